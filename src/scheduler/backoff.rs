use chrono::{DateTime, TimeDelta, Utc};
use std::time::Duration;

/// Feed-level poll spacing.
///
/// A healthy feed is polled every `base_interval`. After `n` consecutive
/// failures the next poll waits `min(base_interval * 2^n, max_interval)`.
/// There is no failure limit: a broken feed keeps retrying at the cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_interval: Duration,
    pub max_interval: Duration,
}

impl BackoffPolicy {
    pub fn new(base_interval: Duration, max_interval: Duration) -> Self {
        Self {
            base_interval,
            max_interval,
        }
    }

    /// Delay before the next poll given the failure count after this poll.
    pub fn interval_after(&self, consecutive_failures: u32) -> Duration {
        if consecutive_failures == 0 {
            return self.base_interval;
        }

        1u32.checked_shl(consecutive_failures)
            .and_then(|factor| self.base_interval.checked_mul(factor))
            .map_or(self.max_interval, |interval| interval.min(self.max_interval))
    }

    pub fn next_poll_at(&self, at: DateTime<Utc>, consecutive_failures: u32) -> DateTime<Utc> {
        let delta = TimeDelta::from_std(self.interval_after(consecutive_failures))
            .unwrap_or(TimeDelta::MAX);
        at.checked_add_signed(delta)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(15 * 60), Duration::from_secs(6 * 60 * 60))
    }
}
