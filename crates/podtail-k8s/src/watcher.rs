//! Turns pod lifecycle events into target added/removed notifications

use futures::StreamExt;
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::selector::Selector;
use crate::source::{ClusterError, PodEvent, PodEventStream};
use podtail_types::{PodInfo, Target};

/// Change in the set of containers to tail
#[derive(Clone, Debug, PartialEq)]
pub enum TargetEvent {
    Added(Target),
    Removed(Target),
}

/// (namespace, pod name)
type PodKey = (String, String);

/// Tracks which containers currently match the selector.
///
/// Only changes in the match outcome are reported: an update that leaves a
/// pod's matching containers (and their instances) unchanged emits nothing.
pub struct TargetWatcher {
    selector: Selector,

    /// Matching containers per pod, keyed by container name
    tracked: HashMap<PodKey, BTreeMap<String, Target>>,

    /// Pods seen so far in each in-progress re-list
    resyncs: HashMap<Option<String>, HashSet<PodKey>>,
}

impl TargetWatcher {
    pub fn new(selector: Selector) -> Self {
        Self {
            selector,
            tracked: HashMap::new(),
            resyncs: HashMap::new(),
        }
    }

    /// Number of containers currently matching
    pub fn tracked_targets(&self) -> usize {
        self.tracked.values().map(BTreeMap::len).sum()
    }

    /// Apply one pod event and return the resulting notifications.
    ///
    /// Removals are always ordered before additions, so a restarted
    /// container shows up as `Removed(old)` followed by `Added(new)`.
    pub fn handle(&mut self, event: PodEvent) -> Vec<TargetEvent> {
        match event {
            PodEvent::Applied(pod) => {
                let key = (pod.namespace.clone(), pod.name.clone());
                for (scope, seen) in self.resyncs.iter_mut() {
                    if in_scope(&key, scope) {
                        seen.insert(key.clone());
                    }
                }
                self.apply(&pod)
            }
            PodEvent::Deleted(pod) => self.forget(&(pod.namespace, pod.name)),
            PodEvent::ResyncStarted { scope } => {
                self.resyncs.insert(scope, HashSet::new());
                Vec::new()
            }
            PodEvent::ResyncDone { scope } => {
                let Some(seen) = self.resyncs.remove(&scope) else {
                    return Vec::new();
                };
                let gone: Vec<PodKey> = self
                    .tracked
                    .keys()
                    .filter(|key| in_scope(key, &scope) && !seen.contains(*key))
                    .cloned()
                    .collect();
                gone.iter().flat_map(|key| self.forget(key)).collect()
            }
        }
    }

    fn apply(&mut self, pod: &PodInfo) -> Vec<TargetEvent> {
        let key = (pod.namespace.clone(), pod.name.clone());
        let mut previous = self.tracked.remove(&key).unwrap_or_default();
        let mut current = BTreeMap::new();
        let mut removed = Vec::new();
        let mut added = Vec::new();

        for target in self.selector.matching_targets(pod) {
            match previous.remove(&target.container) {
                Some(existing) if existing.same_instance(&target) => {
                    // Keep the snapshot taken at discovery time
                    current.insert(existing.container.clone(), existing);
                }
                Some(existing) => {
                    removed.push(TargetEvent::Removed(existing));
                    added.push(TargetEvent::Added(target.clone()));
                    current.insert(target.container.clone(), target);
                }
                None => {
                    added.push(TargetEvent::Added(target.clone()));
                    current.insert(target.container.clone(), target);
                }
            }
        }
        removed.extend(previous.into_values().map(TargetEvent::Removed));

        if !current.is_empty() {
            self.tracked.insert(key, current);
        }

        tracing::trace!(
            namespace = %pod.namespace,
            pod = %pod.name,
            removed = removed.len(),
            added = added.len(),
            "pod applied"
        );

        removed.extend(added);
        removed
    }

    fn forget(&mut self, key: &PodKey) -> Vec<TargetEvent> {
        self.tracked
            .remove(key)
            .map(|targets| targets.into_values().map(TargetEvent::Removed).collect())
            .unwrap_or_default()
    }

    /// Consume pod events until cancelled or the stream ends.
    ///
    /// An error from the stream is fatal and returned; cancelling stops new
    /// notifications but leaves already running tails alone.
    pub async fn run(
        mut self,
        mut events: PodEventStream,
        tx: mpsc::Sender<TargetEvent>,
        cancel: CancellationToken,
    ) -> Result<(), ClusterError> {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                event = events.next() => event,
            };

            match event {
                Some(Ok(event)) => {
                    for notification in self.handle(event) {
                        match &notification {
                            TargetEvent::Added(t) => tracing::debug!(
                                namespace = %t.namespace, pod = %t.pod, container = %t.container,
                                "target added"
                            ),
                            TargetEvent::Removed(t) => tracing::debug!(
                                namespace = %t.namespace, pod = %t.pod, container = %t.container,
                                "target removed"
                            ),
                        }
                        tokio::select! {
                            _ = cancel.cancelled() => return Ok(()),
                            sent = tx.send(notification) => {
                                if sent.is_err() {
                                    return Ok(());
                                }
                            }
                        }
                    }
                }
                Some(Err(e)) => return Err(e),
                None => {
                    tracing::debug!(tracked = self.tracked_targets(), "pod event stream ended");
                    return Ok(());
                }
            }
        }
    }
}

fn in_scope(key: &PodKey, scope: &Option<String>) -> bool {
    scope.as_ref().is_none_or(|ns| ns == &key.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::compile_patterns;
    use futures::stream;
    use podtail_types::{ContainerInfo, ContainerKind, ContainerState};

    fn selector() -> Selector {
        Selector {
            label_selector: Some("app=x".parse().unwrap()),
            container_include: compile_patterns(&["^app$"]).unwrap(),
            ..Default::default()
        }
    }

    fn pod(name: &str, container_id: &str) -> PodInfo {
        let mut pod = PodInfo::new(name.to_string(), "default".to_string());
        pod.uid = Some(format!("{}-uid", name));
        pod.labels.insert("app".to_string(), "x".to_string());
        for c in ["app", "sidecar"] {
            let mut container = ContainerInfo::new(c.to_string(), ContainerKind::Regular);
            container.state = Some(ContainerState::Running);
            container.container_id = Some(format!("{}-{}", c, container_id));
            pod.containers.push(container);
        }
        pod
    }

    fn names(events: &[TargetEvent]) -> Vec<String> {
        events
            .iter()
            .map(|e| match e {
                TargetEvent::Added(t) => format!("+{}/{}", t.pod, t.container),
                TargetEvent::Removed(t) => format!("-{}/{}", t.pod, t.container),
            })
            .collect()
    }

    #[test]
    fn test_new_pod_adds_matching_container_only() {
        let mut watcher = TargetWatcher::new(selector());
        let events = watcher.handle(PodEvent::Applied(pod("web-1", "a")));
        assert_eq!(names(&events), vec!["+web-1/app"]);
    }

    #[test]
    fn test_unrelated_update_is_silent() {
        let mut watcher = TargetWatcher::new(selector());
        watcher.handle(PodEvent::Applied(pod("web-1", "a")));

        let mut updated = pod("web-1", "a");
        updated
            .annotations
            .insert("deploy/revision".to_string(), "7".to_string());
        assert!(watcher.handle(PodEvent::Applied(updated)).is_empty());
        assert_eq!(watcher.tracked_targets(), 1);
    }

    #[test]
    fn test_label_change_removes_target() {
        let mut watcher = TargetWatcher::new(selector());
        watcher.handle(PodEvent::Applied(pod("web-1", "a")));

        let mut relabeled = pod("web-1", "a");
        relabeled.labels.insert("app".to_string(), "y".to_string());
        let events = watcher.handle(PodEvent::Applied(relabeled));
        assert_eq!(names(&events), vec!["-web-1/app"]);
        assert_eq!(watcher.tracked_targets(), 0);
    }

    #[test]
    fn test_container_restart_is_remove_then_add() {
        let mut watcher = TargetWatcher::new(selector());
        watcher.handle(PodEvent::Applied(pod("web-1", "a")));

        let events = watcher.handle(PodEvent::Applied(pod("web-1", "b")));
        assert_eq!(names(&events), vec!["-web-1/app", "+web-1/app"]);
        match &events[1] {
            TargetEvent::Added(t) => assert_eq!(t.container_id.as_deref(), Some("app-b")),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_container_leaving_running_state_is_removed() {
        let mut watcher = TargetWatcher::new(selector());
        watcher.handle(PodEvent::Applied(pod("web-1", "a")));

        let mut stopped = pod("web-1", "a");
        stopped.containers[0].state = Some(ContainerState::Terminated);
        let events = watcher.handle(PodEvent::Applied(stopped));
        assert_eq!(names(&events), vec!["-web-1/app"]);
    }

    #[test]
    fn test_delete_removes_all_targets() {
        let mut watcher = TargetWatcher::new(selector());
        watcher.handle(PodEvent::Applied(pod("web-1", "a")));
        let events = watcher.handle(PodEvent::Deleted(pod("web-1", "a")));
        assert_eq!(names(&events), vec!["-web-1/app"]);

        // Deleting an untracked pod is a no-op
        assert!(watcher.handle(PodEvent::Deleted(pod("web-9", "a"))).is_empty());
    }

    #[test]
    fn test_resync_removes_pods_missing_from_relist() {
        let mut watcher = TargetWatcher::new(selector());
        watcher.handle(PodEvent::Applied(pod("web-1", "a")));
        watcher.handle(PodEvent::Applied(pod("web-2", "a")));

        assert!(watcher.handle(PodEvent::ResyncStarted { scope: None }).is_empty());
        assert!(watcher.handle(PodEvent::Applied(pod("web-2", "a"))).is_empty());
        let events = watcher.handle(PodEvent::ResyncDone { scope: None });
        assert_eq!(names(&events), vec!["-web-1/app"]);
    }

    #[test]
    fn test_resync_is_scoped_to_namespace() {
        let mut watcher = TargetWatcher::new(selector());
        let mut other_ns = pod("web-1", "a");
        other_ns.namespace = "other".to_string();
        watcher.handle(PodEvent::Applied(other_ns));
        watcher.handle(PodEvent::Applied(pod("web-2", "a")));

        watcher.handle(PodEvent::ResyncStarted {
            scope: Some("default".to_string()),
        });
        let events = watcher.handle(PodEvent::ResyncDone {
            scope: Some("default".to_string()),
        });
        assert_eq!(names(&events), vec!["-web-2/app"]);
        assert_eq!(watcher.tracked_targets(), 1);
    }

    #[tokio::test]
    async fn test_run_forwards_notifications_and_surfaces_fatal_errors() {
        let events: PodEventStream = stream::iter(vec![
            Ok(PodEvent::Applied(pod("web-1", "a"))),
            Ok(PodEvent::Deleted(pod("web-1", "a"))),
            Err(ClusterError::WatchChannel("forbidden".to_string())),
        ])
        .boxed();
        let (tx, mut rx) = mpsc::channel(8);

        let result = TargetWatcher::new(selector())
            .run(events, tx, CancellationToken::new())
            .await;
        assert!(matches!(result, Err(ClusterError::WatchChannel(_))));

        let mut received = Vec::new();
        while let Some(event) = rx.recv().await {
            received.push(event);
        }
        assert_eq!(names(&received), vec!["+web-1/app", "-web-1/app"]);
    }

    #[tokio::test]
    async fn test_run_returns_on_cancel() {
        let events: PodEventStream = stream::pending().boxed();
        let (tx, _rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = TargetWatcher::new(selector()).run(events, tx, cancel).await;
        assert!(result.is_ok());
    }
}
