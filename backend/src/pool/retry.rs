use std::time::Duration;

/// Consecutive failed attempts tolerated before a connection is abandoned
pub const MAX_RETRIES: u32 = 10;

const RETRY_STEP: Duration = Duration::from_millis(50);
const MAX_RETRY_DELAY: Duration = Duration::from_millis(2000);

/// Linear backoff capped at two seconds. `None` means stop retrying.
pub fn retry_delay(attempt: u32, max_attempts: u32) -> Option<Duration> {
    if attempt > max_attempts {
        return None;
    }
    Some((RETRY_STEP * attempt).min(MAX_RETRY_DELAY))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    /// Attempts exhausted; reported once per exhaustion
    GiveUp,
    /// Still exhausted after a previous `GiveUp`
    Abandoned,
}

/// Per-connection attempt counter
#[derive(Debug, Default)]
pub struct RetryTracker {
    attempts: u32,
    exhausted: bool,
}

impl RetryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn record_failure(&mut self, max_attempts: u32) -> RetryDecision {
        self.attempts = self.attempts.saturating_add(1);
        match retry_delay(self.attempts, max_attempts) {
            Some(delay) => RetryDecision::RetryAfter(delay),
            None if !self.exhausted => {
                self.exhausted = true;
                RetryDecision::GiveUp
            }
            None => RetryDecision::Abandoned,
        }
    }

    pub fn record_success(&mut self) {
        self.attempts = 0;
        self.exhausted = false;
    }
}
