//! One container's log stream, from open to close

use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::codec::{canonicalize, split_line};
use crate::filter::ContentFilter;
use crate::resume::ResumeTracker;
use crate::sink::SinkSet;
use podtail_k8s::{ClusterError, LogSource, LogStreamOptions};
use podtail_types::{LogLine, ResumeRequest, Target};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TailState {
    Idle,
    Streaming,
    Closed,
    Faulted,
}

/// How a tail run ended
#[derive(Debug)]
pub enum TailOutcome {
    /// Stopped, reached end of stream, or the stream is gone for good
    Closed,
    /// The connection failed; the stream can be resumed from `resume`
    Faulted {
        resume: Option<ResumeRequest>,
        /// Lines read past any resume backlog before the fault
        new_lines: u64,
        error: ClusterError,
    },
}

pub struct Tail {
    target: Arc<Target>,
    source: Arc<dyn LogSource>,
    options: LogStreamOptions,
    filter: Arc<ContentFilter>,
    sinks: SinkSet,
    tracker: ResumeTracker,
    state: TailState,
    /// Notify sinks that the target started; off for restarts
    announce: bool,
    new_lines: u64,
}

impl Tail {
    pub fn new(
        target: Arc<Target>,
        source: Arc<dyn LogSource>,
        options: LogStreamOptions,
        filter: Arc<ContentFilter>,
        sinks: SinkSet,
    ) -> Self {
        Self {
            target,
            source,
            options,
            filter,
            sinks,
            tracker: ResumeTracker::new(),
            state: TailState::Idle,
            announce: true,
            new_lines: 0,
        }
    }

    /// Mark this tail as a restart of an earlier one for the same target
    pub fn restarting(mut self) -> Self {
        self.announce = false;
        self
    }

    /// Restart from where a faulted tail left off.
    ///
    /// The stream is opened at the request's second with no tail or
    /// since-seconds bound, and the lines already delivered at that second
    /// are skipped. A request whose timestamp does not parse starts fresh.
    pub fn resume(mut self, request: ResumeRequest) -> Self {
        self.announce = false;
        match DateTime::parse_from_rfc3339(&request.timestamp) {
            Ok(since) => {
                self.options = self.options.resuming_from(since.with_timezone(&Utc));
                self.tracker = ResumeTracker::resuming(request);
            }
            Err(e) => tracing::warn!(
                timestamp = %request.timestamp,
                error = %e,
                "cannot resume from watermark, restarting stream from the beginning"
            ),
        }
        self
    }

    pub fn state(&self) -> TailState {
        self.state
    }

    pub fn options(&self) -> &LogStreamOptions {
        &self.options
    }

    /// Stream until the log ends, the connection fails or `cancel` fires.
    ///
    /// Cancellation is checked between lines, so a line already being
    /// written to the sinks is finished first.
    pub async fn run(&mut self, cancel: &CancellationToken) -> TailOutcome {
        if self.announce {
            self.sinks.target_started(&self.target);
            self.announce = false;
        }

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return self.close(),
            opened = self.source.open_log_stream(&self.target, &self.options) => opened,
        };
        let mut lines = match opened {
            Ok(lines) => lines,
            Err(e) => return self.fail(e),
        };

        self.state = TailState::Streaming;
        tracing::debug!(
            since_time = ?self.options.since_time,
            follow = self.options.follow,
            "log stream opened"
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return self.close(),
                next = lines.next() => match next {
                    Some(Ok(raw)) => self.consume_line(&raw),
                    Some(Err(e)) => return self.fail(e),
                    None => {
                        tracing::debug!("log stream ended");
                        return self.close();
                    }
                },
            }
        }
    }

    fn consume_line(&mut self, raw: &str) {
        let (timestamp, content) = match split_line(raw) {
            Ok(parts) => parts,
            Err(e) => {
                self.sinks
                    .emit(&LogLine::malformed(self.target.clone(), e, raw));
                return;
            }
        };

        let canonical = canonicalize(timestamp);
        self.tracker.observe(&canonical);
        if self.tracker.should_skip(&canonical) {
            tracing::trace!(timestamp, "skipping already delivered line");
            return;
        }
        self.new_lines += 1;

        if !self.filter.accepts(content) {
            return;
        }
        self.sinks.emit(&LogLine::new(
            self.target.clone(),
            timestamp.to_string(),
            content.to_string(),
        ));
    }

    fn close(&mut self) -> TailOutcome {
        self.state = TailState::Closed;
        TailOutcome::Closed
    }

    fn fail(&mut self, error: ClusterError) -> TailOutcome {
        if !error.is_retryable() {
            tracing::info!(error = %error, "log stream is gone");
            return self.close();
        }
        self.state = TailState::Faulted;
        let resume = self.tracker.resume_request();
        tracing::warn!(error = %error, ?resume, "log stream failed");
        TailOutcome::Faulted {
            resume,
            new_lines: self.new_lines,
            error,
        }
    }
}
