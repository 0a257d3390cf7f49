use std::time;

/// Delay before the second dial attempt.
pub const INITIAL_RETRY_INTERVAL: time::Duration = time::Duration::from_millis(500);
/// Ceiling for the dial backoff.
pub const MAX_RETRY_INTERVAL: time::Duration = time::Duration::from_secs(30);
/// Fixed pause between failed `consume` calls. Intentionally not exponential:
/// group-level errors are expected to clear faster than broker outages at boot.
pub const CONSUME_RETRY_DELAY: time::Duration = time::Duration::from_secs(2);

const MIN_INTERVAL: time::Duration = time::Duration::from_millis(1);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
/// Exponential backoff used between connection attempts.
pub struct BackoffPolicy {
    /// The delay after the first failed attempt.
    initial_interval: time::Duration,
    /// The maximum possible delay between attempts.
    maximum_interval: time::Duration,
}

impl BackoffPolicy {
    /// Both intervals are clamped so every delay is strictly positive and the
    /// ceiling is never below the starting delay.
    pub fn new(initial_interval: time::Duration, maximum_interval: time::Duration) -> Self {
        let initial_interval = initial_interval.max(MIN_INTERVAL);
        Self {
            initial_interval,
            maximum_interval: maximum_interval.max(initial_interval),
        }
    }

    pub fn initial_interval(&self) -> time::Duration {
        self.initial_interval
    }

    pub fn maximum_interval(&self) -> time::Duration {
        self.maximum_interval
    }

    /// Calculate the delay that follows `current`: twice as long, capped.
    pub fn next(&self, current: time::Duration) -> time::Duration {
        current
            .saturating_mul(2)
            .clamp(self.initial_interval, self.maximum_interval)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(INITIAL_RETRY_INTERVAL, MAX_RETRY_INTERVAL)
    }
}
