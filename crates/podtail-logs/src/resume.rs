//! Resume bookkeeping for interrupted log streams.
//!
//! The log API has no cursor, only a second-precision `sinceTime`. A tail
//! therefore remembers the last second it saw and how many lines carried
//! it; a restarted stream opened at that second skips exactly that many
//! lines before emitting again.

use podtail_types::{ResumeRequest, Watermark};

/// Skip a line already delivered before the restart.
///
/// Returns true, consuming one line from `request`, iff the request is for
/// `timestamp` and still has lines left to skip.
pub fn should_skip(timestamp: &str, request: Option<&mut ResumeRequest>) -> bool {
    let Some(request) = request else {
        return false;
    };
    if request.timestamp.is_empty() || request.timestamp != timestamp || request.lines_to_skip == 0
    {
        return false;
    }
    request.lines_to_skip -= 1;
    true
}

/// Per-tail watermark plus the pending resume request, if resuming
#[derive(Debug, Default)]
pub struct ResumeTracker {
    watermark: Option<Watermark>,
    pending: Option<ResumeRequest>,
}

impl ResumeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracker for a stream restarted from `request`
    pub fn resuming(request: ResumeRequest) -> Self {
        Self {
            watermark: None,
            pending: Some(request),
        }
    }

    /// Record one parsed line. Called before any filtering so the watermark
    /// reflects the true stream position.
    pub fn observe(&mut self, timestamp: &str) -> &Watermark {
        let watermark = match self.watermark.take() {
            Some(mut watermark) if watermark.timestamp == timestamp => {
                watermark.lines_at_timestamp += 1;
                watermark
            }
            _ => Watermark {
                timestamp: timestamp.to_string(),
                lines_at_timestamp: 1,
            },
        };
        self.watermark.insert(watermark)
    }

    pub fn should_skip(&mut self, timestamp: &str) -> bool {
        should_skip(timestamp, self.pending.as_mut())
    }

    pub fn watermark(&self) -> Option<&Watermark> {
        self.watermark.as_ref()
    }

    /// Where a restart should pick up.
    ///
    /// Lines of the pending request not yet re-observed were delivered by
    /// an earlier stream, so they are still owed a skip.
    pub fn resume_request(&self) -> Option<ResumeRequest> {
        let pending = self.pending.as_ref().filter(|p| p.lines_to_skip > 0);
        match (&self.watermark, pending) {
            (Some(watermark), Some(pending)) if pending.timestamp == watermark.timestamp => {
                Some(ResumeRequest {
                    timestamp: watermark.timestamp.clone(),
                    lines_to_skip: watermark.lines_at_timestamp + pending.lines_to_skip,
                })
            }
            (Some(watermark), _) => Some(ResumeRequest::from(watermark.clone())),
            (None, Some(pending)) => Some(pending.clone()),
            (None, None) => None,
        }
    }
}
