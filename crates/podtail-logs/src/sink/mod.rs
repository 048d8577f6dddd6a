//! Output sinks for accepted log lines
//!
//! A sink is either a display sink (console) or an export sink. Display
//! sink failures are logged and never stop a tail; export sinks handle their
//! own queueing and drop policy.

mod console;
mod export;

pub use console::{ConsoleConfig, ConsoleSink, OutputFormat, TimestampFormat, Timezone};
pub use export::{ExportConfig, ExportSink};

use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;

use podtail_types::{LogLine, Target};

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("write failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("export queue is full")]
    QueueFull,

    #[error("sink is shut down")]
    Closed,

    #[error("shutdown did not finish within {0:?}")]
    ShutdownTimeout(Duration),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SinkKind {
    Display,
    Export,
}

/// Destination for accepted log lines.
///
/// `emit` must not block indefinitely; a sink that talks to something slow
/// queues internally.
pub trait Sink: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> SinkKind;

    fn emit(&self, line: &LogLine) -> Result<(), SinkError>;

    /// A target was opened for the first time
    fn target_started(&self, _target: &Target) {}

    /// A target is gone for good; called once per target
    fn target_stopped(&self, _target: &Target) {}

    /// Flush buffered work, giving up after `deadline`. Invoked once.
    fn shutdown(&self, deadline: Duration) -> BoxFuture<'_, Result<(), SinkError>>;
}

/// The sinks every tail writes to
#[derive(Clone, Default)]
pub struct SinkSet {
    sinks: Arc<Vec<Arc<dyn Sink>>>,
}

impl SinkSet {
    pub fn new(sinks: Vec<Arc<dyn Sink>>) -> Self {
        Self {
            sinks: Arc::new(sinks),
        }
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Write a line to every sink. Failures are logged, never propagated.
    pub fn emit(&self, line: &LogLine) {
        for sink in self.sinks.iter() {
            if let Err(e) = sink.emit(line) {
                match sink.kind() {
                    SinkKind::Display => tracing::warn!(
                        sink = sink.name(),
                        error = %e,
                        pod = %line.target.pod,
                        container = %line.target.container,
                        "failed to write log line"
                    ),
                    // Export sinks account for their own drops
                    SinkKind::Export => tracing::trace!(
                        sink = sink.name(),
                        error = %e,
                        "export sink rejected log line"
                    ),
                }
            }
        }
    }

    pub fn target_started(&self, target: &Target) {
        for sink in self.sinks.iter() {
            sink.target_started(target);
        }
    }

    pub fn target_stopped(&self, target: &Target) {
        for sink in self.sinks.iter() {
            sink.target_stopped(target);
        }
    }

    /// Shut every sink down concurrently, waiting at most `deadline`
    pub async fn shutdown(&self, deadline: Duration) {
        let shutdowns = self.sinks.iter().map(|sink| async move {
            if let Err(e) = sink.shutdown(deadline).await {
                tracing::warn!(sink = sink.name(), error = %e, "sink shutdown failed");
            }
        });

        if tokio::time::timeout(deadline, futures::future::join_all(shutdowns))
            .await
            .is_err()
        {
            tracing::warn!(?deadline, "sinks did not shut down in time");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemorySink, target};

    struct FailingSink;

    impl Sink for FailingSink {
        fn name(&self) -> &str {
            "failing"
        }

        fn kind(&self) -> SinkKind {
            SinkKind::Display
        }

        fn emit(&self, _line: &LogLine) -> Result<(), SinkError> {
            Err(SinkError::Io(std::io::Error::other("broken pipe")))
        }

        fn shutdown(&self, _deadline: Duration) -> BoxFuture<'_, Result<(), SinkError>> {
            Box::pin(std::future::pending())
        }
    }

    #[tokio::test]
    async fn test_failing_sink_does_not_block_others() {
        let memory = Arc::new(MemorySink::default());
        let sinks: Vec<Arc<dyn Sink>> = vec![Arc::new(FailingSink), memory.clone()];
        let sinks = SinkSet::new(sinks);
        let line = LogLine::new(
            Arc::new(target("web-1", "app")),
            "2024-01-02T03:04:05Z".to_string(),
            "hello".to_string(),
        );

        sinks.emit(&line);
        assert_eq!(memory.contents(), vec!["hello"]);

        // A sink that never finishes shutting down is abandoned at the deadline
        sinks.shutdown(Duration::from_millis(20)).await;
        assert!(memory.is_shut_down());
    }
}
