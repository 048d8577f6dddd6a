use std::time::Duration;

/// Decides whether, and after how long, a faulted tail is restarted
pub trait RestartPolicy: Send + Sync {
    /// Delay before restart `attempt` (1-based), or `None` to give up
    fn next_delay(&self, attempt: u32) -> Option<Duration>;
}

/// Restart right away, forever
#[derive(Clone, Copy, Debug, Default)]
pub struct Immediate;

impl RestartPolicy for Immediate {
    fn next_delay(&self, _attempt: u32) -> Option<Duration> {
        Some(Duration::ZERO)
    }
}

/// Doubling delay from `initial`, capped at `max`
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    pub initial: Duration,
    pub max: Duration,
    /// Give up after this many consecutive attempts (`None` = never)
    pub max_attempts: Option<u32>,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            max_attempts: None,
        }
    }
}

impl RestartPolicy for ExponentialBackoff {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if self.max_attempts.is_some_and(|max| attempt > max) {
            return None;
        }
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        Some(self.initial.saturating_mul(factor).min(self.max))
    }
}
