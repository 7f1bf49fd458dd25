use std::time::Duration;

/// Exponential backoff applied before every downstream attempt.
///
/// Attempt `r` (0-based retry count) waits `base * 2^r`; the first attempt is
/// throttled too.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(1000),
            max_retries: 3,
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for(&self, retries: u32) -> Duration {
        2u32.checked_pow(retries)
            .and_then(|factor| self.base.checked_mul(factor))
            .unwrap_or(Duration::MAX)
    }

    pub fn should_retry(&self, retries: u32) -> bool {
        retries < self.max_retries
    }
}
