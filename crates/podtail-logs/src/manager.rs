//! Runs one tail per target under a concurrency budget

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::filter::ContentFilter;
use crate::restart::{Immediate, RestartPolicy};
use crate::sink::SinkSet;
use crate::tail::{Tail, TailOutcome};
use podtail_k8s::{LogSource, LogStreamOptions, TargetEvent};
use podtail_types::{ResumeRequest, Target, TargetKey};

#[derive(Clone, Debug)]
pub struct ManagerConfig {
    /// Log streams held open at once
    pub max_concurrent_tails: usize,
    /// Restart faulted tails from their watermark
    pub resume: bool,
    /// Options for a target's first open
    pub options: LogStreamOptions,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tails: 50,
            resume: true,
            options: LogStreamOptions {
                follow: true,
                ..Default::default()
            },
        }
    }
}

struct TailHandle {
    target: Arc<Target>,
    /// Distinguishes this run's exit from an earlier run's
    generation: u64,
    /// Consecutive restarts without progress
    attempts: u32,
    /// False once the tail closed on its own and `target_stopped` was sent
    active: bool,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct TailExit {
    key: TargetKey,
    generation: u64,
    outcome: TailOutcome,
}

/// How a tail task begins
enum Launch {
    Fresh,
    Restart {
        resume: Option<ResumeRequest>,
        delay: Duration,
    },
}

/// Owns the target to tail map.
///
/// The map is only touched from [`TailManager::run`]; tail tasks report
/// back over a channel. Each task waits for a semaphore permit before
/// opening its stream, so admission never blocks the event loop.
pub struct TailManager {
    source: Arc<dyn LogSource>,
    config: ManagerConfig,
    filter: Arc<ContentFilter>,
    sinks: SinkSet,
    restart_policy: Arc<dyn RestartPolicy>,
    semaphore: Arc<Semaphore>,
    tails: HashMap<TargetKey, TailHandle>,
    /// Tasks of removed tails that may still be finishing
    stopping: Vec<JoinHandle<()>>,
    next_generation: u64,
    exit_tx: mpsc::UnboundedSender<TailExit>,
    exit_rx: mpsc::UnboundedReceiver<TailExit>,
}

impl TailManager {
    pub fn new(
        source: Arc<dyn LogSource>,
        config: ManagerConfig,
        filter: ContentFilter,
        sinks: SinkSet,
    ) -> Self {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        Self {
            source,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_tails.max(1))),
            config,
            filter: Arc::new(filter),
            sinks,
            restart_policy: Arc::new(Immediate),
            tails: HashMap::new(),
            stopping: Vec::new(),
            next_generation: 0,
            exit_tx,
            exit_rx,
        }
    }

    pub fn with_restart_policy(mut self, policy: Arc<dyn RestartPolicy>) -> Self {
        self.restart_policy = policy;
        self
    }

    /// Process target notifications until cancelled, or until the
    /// notifications end and every tail has closed. All tails are stopped
    /// and awaited before returning.
    pub async fn run(
        mut self,
        mut targets: mpsc::Receiver<TargetEvent>,
        cancel: CancellationToken,
    ) {
        let mut targets_open = true;

        loop {
            if !targets_open && !self.tails.values().any(|t| t.active) {
                tracing::debug!("no targets left to tail");
                break;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = targets.recv(), if targets_open => match event {
                    Some(TargetEvent::Added(target)) => self.add(target, &cancel),
                    Some(TargetEvent::Removed(target)) => self.remove(&target),
                    None => targets_open = false,
                },
                Some(exit) = self.exit_rx.recv() => self.on_exit(exit, &cancel),
            }
        }

        self.shutdown().await;
    }

    fn add(&mut self, target: Target, cancel: &CancellationToken) {
        let key = target.key();
        if self.tails.contains_key(&key) {
            tracing::debug!(tail = %key, "already tailing");
            return;
        }

        tracing::info!(tail = %key, "target added");
        let target = Arc::new(target);
        let generation = self.bump_generation();
        let (token, task) = self.spawn(
            key.clone(),
            target.clone(),
            generation,
            Launch::Fresh,
            cancel,
        );
        self.tails.insert(
            key,
            TailHandle {
                target,
                generation,
                attempts: 0,
                active: true,
                cancel: token,
                task,
            },
        );
    }

    fn remove(&mut self, target: &Target) {
        let key = target.key();
        let Some(handle) = self.tails.remove(&key) else {
            return;
        };

        tracing::info!(tail = %key, "target removed");
        handle.cancel.cancel();
        if handle.active {
            self.sinks.target_stopped(&handle.target);
        }
        self.stopping.retain(|task| !task.is_finished());
        self.stopping.push(handle.task);
    }

    fn on_exit(&mut self, exit: TailExit, cancel: &CancellationToken) {
        let Some(handle) = self.tails.get_mut(&exit.key) else {
            return;
        };
        if handle.generation != exit.generation {
            return;
        }

        let (resume, error) = match exit.outcome {
            TailOutcome::Closed => {
                tracing::info!(tail = %exit.key, "tail closed");
                self.close(&exit.key);
                return;
            }
            TailOutcome::Faulted {
                resume,
                new_lines,
                error,
            } => {
                if new_lines > 0 {
                    handle.attempts = 0;
                }
                handle.attempts += 1;
                (resume, error)
            }
        };

        if !self.config.resume {
            tracing::warn!(
                tail = %exit.key,
                error = %error,
                "log stream failed and resume is disabled"
            );
            self.close(&exit.key);
            return;
        }

        let attempt = handle.attempts;
        let Some(delay) = self.restart_policy.next_delay(attempt) else {
            tracing::warn!(
                tail = %exit.key,
                attempt,
                error = %error,
                "giving up on log stream"
            );
            self.close(&exit.key);
            return;
        };

        tracing::info!(tail = %exit.key, attempt, ?delay, ?resume, "restarting tail");
        let target = handle.target.clone();
        let generation = self.bump_generation();
        let (token, task) = self.spawn(
            exit.key.clone(),
            target,
            generation,
            Launch::Restart { resume, delay },
            cancel,
        );
        if let Some(handle) = self.tails.get_mut(&exit.key) {
            handle.generation = generation;
            handle.cancel = token;
            handle.task = task;
        }
    }

    /// The tail ended for good while its target is still desired
    fn close(&mut self, key: &TargetKey) {
        if let Some(handle) = self.tails.get_mut(key) {
            if handle.active {
                handle.active = false;
                self.sinks.target_stopped(&handle.target);
            }
        }
    }

    fn bump_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn spawn(
        &self,
        key: TargetKey,
        target: Arc<Target>,
        generation: u64,
        launch: Launch,
        parent: &CancellationToken,
    ) -> (CancellationToken, JoinHandle<()>) {
        let cancel = parent.child_token();
        let tail = Tail::new(
            target,
            self.source.clone(),
            self.config.options.clone(),
            self.filter.clone(),
            self.sinks.clone(),
        );
        let (mut tail, delay) = match launch {
            Launch::Fresh => (tail, Duration::ZERO),
            Launch::Restart {
                resume: Some(resume),
                delay,
            } => (tail.resume(resume), delay),
            Launch::Restart {
                resume: None,
                delay,
            } => (tail.restarting(), delay),
        };

        let semaphore = self.semaphore.clone();
        let exit_tx = self.exit_tx.clone();
        let span = tracing::info_span!(
            "tail",
            namespace = %key.namespace,
            pod = %key.pod,
            container = %key.container,
        );
        let token = cancel.clone();

        let task = tokio::spawn(
            async move {
                if !delay.is_zero() {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }

                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    permit = semaphore.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return,
                    },
                };

                let outcome = tail.run(&cancel).await;
                drop(permit);
                let _ = exit_tx.send(TailExit {
                    key,
                    generation,
                    outcome,
                });
            }
            .instrument(span),
        );

        (token, task)
    }

    async fn shutdown(mut self) {
        for (_, handle) in self.tails.drain() {
            handle.cancel.cancel();
            if handle.active {
                self.sinks.target_stopped(&handle.target);
            }
            self.stopping.push(handle.task);
        }

        tracing::debug!(tasks = self.stopping.len(), "waiting for tails to close");
        for result in futures::future::join_all(self.stopping).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "tail task failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::restart::ExponentialBackoff;
    use crate::sink::Sink;
    use crate::testing::{MemorySink, ScriptedSource, Session, target};
    use chrono::{DateTime, Utc};

    struct Fixture {
        source: Arc<ScriptedSource>,
        memory: Arc<MemorySink>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                source: Arc::new(ScriptedSource::default()),
                memory: Arc::new(MemorySink::default()),
            }
        }

        fn manager(&self, config: ManagerConfig) -> TailManager {
            let sinks: Vec<Arc<dyn Sink>> = vec![self.memory.clone()];
            TailManager::new(
                self.source.clone(),
                config,
                ContentFilter::default(),
                SinkSet::new(sinks),
            )
        }
    }

    async fn wait_until(what: &str, condition: impl Fn() -> bool) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    #[tokio::test]
    async fn test_concurrency_budget() {
        let fx = Fixture::new();
        let manager = fx.manager(ManagerConfig {
            max_concurrent_tails: 2,
            ..Default::default()
        });
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let run = tokio::spawn(manager.run(rx, cancel.clone()));

        let pods = ["p0", "p1", "p2", "p3", "p4"];
        for pod in pods {
            tx.send(TargetEvent::Added(target(pod, "app"))).await.unwrap();
        }
        wait_until("two streams", || fx.source.opens().len() == 2).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fx.source.opens().len(), 2);
        assert_eq!(fx.source.open_now(), 2);

        let opened: Vec<String> = fx.source.opens().into_iter().map(|(p, _)| p).collect();
        let waiting: Vec<&str> = pods
            .iter()
            .copied()
            .filter(|p| !opened.iter().any(|o| o == p))
            .collect();

        // A target removed while waiting for a slot is never opened
        tx.send(TargetEvent::Removed(target(waiting[0], "app")))
            .await
            .unwrap();
        // Freeing a slot admits exactly one waiting target
        tx.send(TargetEvent::Removed(target(&opened[0], "app")))
            .await
            .unwrap();

        wait_until("third stream", || fx.source.opens().len() == 3).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fx.source.opens().len(), 3);
        assert_eq!(fx.source.max_open(), 2);
        assert_eq!(fx.source.open_count(waiting[0]), 0);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), run)
            .await
            .expect("manager did not stop")
            .unwrap();
        assert_eq!(fx.source.open_now(), 0);
    }

    #[tokio::test]
    async fn test_fault_restarts_with_resume_request() {
        let fx = Fixture::new();
        fx.source.push(
            "web-1",
            Session::severed(&[
                "2024-01-02T03:04:05.9Z a",
                "2024-01-02T03:04:06.1Z b",
                "2024-01-02T03:04:06.2Z c",
                "2024-01-02T03:04:06.3Z d",
            ]),
        );
        fx.source.push(
            "web-1",
            Session::lines(&[
                "2024-01-02T03:04:06.1Z b",
                "2024-01-02T03:04:06.2Z c",
                "2024-01-02T03:04:06.3Z d",
                "2024-01-02T03:04:06.4Z e",
                "2024-01-02T03:04:07.0Z f",
            ]),
        );

        let manager = fx.manager(ManagerConfig::default());
        let (tx, rx) = mpsc::channel(16);
        tx.send(TargetEvent::Added(target("web-1", "app"))).await.unwrap();
        drop(tx);

        tokio::time::timeout(
            Duration::from_secs(2),
            manager.run(rx, CancellationToken::new()),
        )
        .await
        .expect("manager did not finish");

        let since = DateTime::parse_from_rfc3339("2024-01-02T03:04:06Z")
            .unwrap()
            .with_timezone(&Utc);
        let opens = fx.source.opens();
        assert_eq!(opens.len(), 2);
        assert_eq!(opens[0].1.since_time, None);
        assert_eq!(opens[1].1.since_time, Some(since));
        assert_eq!(fx.memory.contents(), vec!["a", "b", "c", "d", "e", "f"]);
        assert_eq!(fx.memory.started(), vec!["web-1"]);
        assert_eq!(fx.memory.stopped(), vec!["web-1"]);
    }

    #[tokio::test]
    async fn test_resume_disabled_closes_faulted_tail() {
        let fx = Fixture::new();
        fx.source
            .push("web-1", Session::severed(&["2024-01-02T03:04:05Z a"]));

        let manager = fx.manager(ManagerConfig {
            resume: false,
            ..Default::default()
        });
        let (tx, rx) = mpsc::channel(16);
        tx.send(TargetEvent::Added(target("web-1", "app"))).await.unwrap();
        drop(tx);

        tokio::time::timeout(
            Duration::from_secs(2),
            manager.run(rx, CancellationToken::new()),
        )
        .await
        .expect("manager did not finish");

        assert_eq!(fx.source.open_count("web-1"), 1);
        assert_eq!(fx.memory.stopped(), vec!["web-1"]);
    }

    #[tokio::test]
    async fn test_restart_policy_can_give_up() {
        let fx = Fixture::new();
        fx.source.push("web-1", Session::severed(&[]));
        fx.source.push("web-1", Session::severed(&[]));

        let manager = fx
            .manager(ManagerConfig::default())
            .with_restart_policy(Arc::new(ExponentialBackoff {
                initial: Duration::from_millis(1),
                max: Duration::from_millis(5),
                max_attempts: Some(1),
            }));
        let (tx, rx) = mpsc::channel(16);
        tx.send(TargetEvent::Added(target("web-1", "app"))).await.unwrap();
        drop(tx);

        tokio::time::timeout(
            Duration::from_secs(2),
            manager.run(rx, CancellationToken::new()),
        )
        .await
        .expect("manager did not finish");

        assert_eq!(fx.source.open_count("web-1"), 2);
        assert_eq!(fx.memory.stopped(), vec!["web-1"]);
    }

    #[tokio::test]
    async fn test_duplicate_add_and_closed_target_removal() {
        let fx = Fixture::new();
        fx.source
            .push("web-1", Session::lines(&["2024-01-02T03:04:05Z only"]));

        let manager = fx.manager(ManagerConfig::default());
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let run = tokio::spawn(manager.run(rx, cancel.clone()));

        tx.send(TargetEvent::Added(target("web-1", "app"))).await.unwrap();
        tx.send(TargetEvent::Added(target("web-1", "app"))).await.unwrap();
        wait_until("stream end", || fx.memory.stopped().len() == 1).await;

        // Removal after the stream closed on its own is only a confirmation
        tx.send(TargetEvent::Removed(target("web-1", "app")))
            .await
            .unwrap();
        drop(tx);

        tokio::time::timeout(Duration::from_secs(2), run)
            .await
            .expect("manager did not finish")
            .unwrap();
        assert_eq!(fx.source.open_count("web-1"), 1);
        assert_eq!(fx.memory.contents(), vec!["only"]);
        assert_eq!(fx.memory.started(), vec!["web-1"]);
        assert_eq!(fx.memory.stopped(), vec!["web-1"]);
    }

    #[tokio::test]
    async fn test_shutdown_stops_active_tails() {
        let fx = Fixture::new();
        let manager = fx.manager(ManagerConfig::default());
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let run = tokio::spawn(manager.run(rx, cancel.clone()));

        for pod in ["a", "b"] {
            tx.send(TargetEvent::Added(target(pod, "app"))).await.unwrap();
        }
        wait_until("both streams", || fx.source.open_now() == 2).await;

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), run)
            .await
            .expect("manager did not stop")
            .unwrap();
        assert_eq!(fx.source.open_now(), 0);

        let mut stopped = fx.memory.stopped();
        stopped.sort();
        assert_eq!(stopped, vec!["a", "b"]);
    }
}
