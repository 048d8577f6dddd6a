//! In-memory log source and sink for driving tails without a cluster

use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use crate::sink::{Sink, SinkError, SinkKind};
use podtail_k8s::{ClusterError, LineStream, LogSource, LogStreamOptions};
use podtail_types::{LogLine, Target};

/// A target in namespace `default` on `node-a`, labelled `app=web`
pub fn target(pod: &str, container: &str) -> Target {
    Target {
        namespace: "default".to_string(),
        pod: pod.to_string(),
        container: container.to_string(),
        node_name: Some("node-a".to_string()),
        labels: [("app".to_string(), "web".to_string())].into(),
        annotations: Default::default(),
        pod_uid: Some(format!("uid-{}", pod)),
        container_id: Some(format!("containerd://{}-{}", pod, container)),
    }
}

/// Records everything it is given
#[derive(Default)]
pub struct MemorySink {
    lines: Mutex<Vec<LogLine>>,
    started: Mutex<Vec<String>>,
    stopped: Mutex<Vec<String>>,
    shut_down: AtomicBool,
}

impl MemorySink {
    pub fn contents(&self) -> Vec<String> {
        self.lines.lock().iter().map(|l| l.content.clone()).collect()
    }

    pub fn lines(&self) -> Vec<LogLine> {
        self.lines.lock().clone()
    }

    /// Pod names passed to `target_started`
    pub fn started(&self) -> Vec<String> {
        self.started.lock().clone()
    }

    /// Pod names passed to `target_stopped`
    pub fn stopped(&self) -> Vec<String> {
        self.stopped.lock().clone()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

impl Sink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    fn kind(&self) -> SinkKind {
        SinkKind::Display
    }

    fn emit(&self, line: &LogLine) -> Result<(), SinkError> {
        self.lines.lock().push(line.clone());
        Ok(())
    }

    fn target_started(&self, target: &Target) {
        self.started.lock().push(target.pod.clone());
    }

    fn target_stopped(&self, target: &Target) {
        self.stopped.lock().push(target.pod.clone());
    }

    fn shutdown(&self, _deadline: Duration) -> BoxFuture<'_, Result<(), SinkError>> {
        self.shut_down.store(true, Ordering::SeqCst);
        Box::pin(futures::future::ready(Ok(())))
    }
}

/// One scripted answer to `open_log_stream`
pub enum Session {
    /// Yield these items, then end (or hang when `hang` is set)
    Lines {
        items: Vec<Result<String, ClusterError>>,
        hang: bool,
    },
    /// Fail the open itself
    Fail(ClusterError),
}

impl Session {
    /// Lines followed by a clean end of stream
    pub fn lines(lines: &[&str]) -> Self {
        Self::Lines {
            items: lines.iter().map(|l| Ok(l.to_string())).collect(),
            hang: false,
        }
    }

    /// Lines followed by a stream that never yields again
    pub fn follow(lines: &[&str]) -> Self {
        Self::Lines {
            items: lines.iter().map(|l| Ok(l.to_string())).collect(),
            hang: true,
        }
    }

    /// Lines followed by a transport error
    pub fn severed(lines: &[&str]) -> Self {
        let mut items: Vec<_> = lines.iter().map(|l| Ok(l.to_string())).collect();
        items.push(Err(ClusterError::StreamTransport("connection reset".into())));
        Self::Lines { items, hang: false }
    }
}

/// Decrements the open-stream gauge when the stream is dropped
struct OpenGuard(Arc<AtomicUsize>);

impl Drop for OpenGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Log source answering opens from per-pod scripts. A pod with no script
/// left gets a stream that never yields.
#[derive(Default)]
pub struct ScriptedSource {
    scripts: Mutex<HashMap<String, VecDeque<Session>>>,
    opens: Mutex<Vec<(String, LogStreamOptions)>>,
    open_now: Arc<AtomicUsize>,
    max_open: Arc<AtomicUsize>,
}

impl ScriptedSource {
    pub fn push(&self, pod: &str, session: Session) {
        self.scripts
            .lock()
            .entry(pod.to_string())
            .or_default()
            .push_back(session);
    }

    /// (pod, options) of every open, in order
    pub fn opens(&self) -> Vec<(String, LogStreamOptions)> {
        self.opens.lock().clone()
    }

    pub fn open_count(&self, pod: &str) -> usize {
        self.opens.lock().iter().filter(|(p, _)| p == pod).count()
    }

    /// Streams currently held open
    pub fn open_now(&self) -> usize {
        self.open_now.load(Ordering::SeqCst)
    }

    /// Most streams ever held open at once
    pub fn max_open(&self) -> usize {
        self.max_open.load(Ordering::SeqCst)
    }
}

impl LogSource for ScriptedSource {
    fn open_log_stream(
        &self,
        target: &Target,
        options: &LogStreamOptions,
    ) -> BoxFuture<'static, Result<LineStream, ClusterError>> {
        self.opens
            .lock()
            .push((target.pod.clone(), options.clone()));
        let session = self
            .scripts
            .lock()
            .get_mut(&target.pod)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Session::Lines {
                items: Vec::new(),
                hang: true,
            });

        let (items, hang) = match session {
            Session::Fail(e) => return Box::pin(futures::future::ready(Err(e))),
            Session::Lines { items, hang } => (items, hang),
        };

        let now = self.open_now.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_open.fetch_max(now, Ordering::SeqCst);
        let guard = OpenGuard(self.open_now.clone());

        let rest: LineStream = if hang {
            stream::pending().boxed()
        } else {
            stream::empty().boxed()
        };
        let lines: LineStream = stream::iter(items)
            .chain(rest)
            .map(move |item| {
                let _ = &guard;
                item
            })
            .boxed();
        Box::pin(futures::future::ready(Ok(lines)))
    }
}
