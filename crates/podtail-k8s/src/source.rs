//! Seams between the tailing core and the cluster API

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use podtail_types::{PodInfo, Target};

/// Errors surfaced by the cluster collaborator
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClusterError {
    /// Connection severed or timed out; the stream may be resumed
    #[error("log stream transport error: {0}")]
    StreamTransport(String),

    /// The container or pod is gone; retrying will not help
    #[error("log stream unavailable: {0}")]
    StreamTerminal(String),

    /// The pod watch failed in a way the watch itself cannot recover from
    #[error("pod watch failed: {0}")]
    WatchChannel(String),
}

impl ClusterError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StreamTransport(_))
    }
}

/// Lines of one container log, timestamp-prefixed, without trailing newline
pub type LineStream = BoxStream<'static, Result<String, ClusterError>>;

/// Stream of pod lifecycle events
pub type PodEventStream = BoxStream<'static, Result<PodEvent, ClusterError>>;

/// Options for opening a container log stream.
///
/// Timestamps are always requested; the line codec depends on them.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LogStreamOptions {
    pub follow: bool,
    pub since_seconds: Option<i64>,
    pub since_time: Option<DateTime<Utc>>,
    pub tail_lines: Option<i64>,
}

impl LogStreamOptions {
    /// Options for resuming from `since`; other bounds are cleared so they
    /// cannot open a gap or overlap
    pub fn resuming_from(&self, since: DateTime<Utc>) -> Self {
        Self {
            follow: self.follow,
            since_seconds: None,
            since_time: Some(since),
            tail_lines: None,
        }
    }
}

/// Pod lifecycle event delivered by the pod watch
#[derive(Clone, Debug, PartialEq)]
pub enum PodEvent {
    /// Pod created or modified
    Applied(PodInfo),
    /// Pod deleted
    Deleted(PodInfo),
    /// A full re-list of `scope` (a namespace, or everything when `None`)
    /// is about to follow
    ResyncStarted { scope: Option<String> },
    /// The re-list of `scope` is complete; pods not re-listed are gone
    ResyncDone { scope: Option<String> },
}

/// What to watch
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WatchRequest {
    /// Namespaces to watch; empty means cluster-wide
    pub namespaces: Vec<String>,
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
    /// When false the pods are listed once and the stream ends
    pub follow: bool,
}

/// Source of container log streams
pub trait LogSource: Send + Sync + 'static {
    fn open_log_stream(
        &self,
        target: &Target,
        options: &LogStreamOptions,
    ) -> BoxFuture<'static, Result<LineStream, ClusterError>>;
}

/// Source of pod lifecycle events.
///
/// Reconnecting after a dropped watch is the source's job; errors it yields
/// are fatal to the watcher.
pub trait PodSource: Send + Sync + 'static {
    fn watch_pods(&self, request: &WatchRequest) -> PodEventStream;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resume_options_clear_other_bounds() {
        let base = LogStreamOptions {
            follow: true,
            since_seconds: Some(172_800),
            since_time: None,
            tail_lines: Some(10),
        };
        let since = DateTime::parse_from_rfc3339("2024-01-02T03:04:05Z")
            .map(|ts| ts.with_timezone(&Utc))
            .unwrap();

        let resumed = base.resuming_from(since);
        assert!(resumed.follow);
        assert_eq!(resumed.since_time, Some(since));
        assert_eq!(resumed.since_seconds, None);
        assert_eq!(resumed.tail_lines, None);
    }

    #[test]
    fn test_retryable_classification() {
        assert!(ClusterError::StreamTransport("reset".into()).is_retryable());
        assert!(!ClusterError::StreamTerminal("gone".into()).is_retryable());
        assert!(!ClusterError::WatchChannel("forbidden".into()).is_retryable());
    }
}
