//! Send interval policy for consecutive delivery failures.

use std::time::Duration;

/// Exponential backoff bounded between a floor and a ceiling.
///
/// With no failures the interval is `min`. After `n >= 1` consecutive
/// failures it is `min(max, min * 2^(n-1))`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    min: Duration,
    max: Duration,
}

impl BackoffPolicy {
    /// Create a policy; a ceiling below the floor is raised to the floor.
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
        }
    }

    /// Interval to wait after `error_count` consecutive failures.
    pub fn interval(&self, error_count: u32) -> Duration {
        if error_count == 0 {
            return self.min;
        }

        // 2^31 already dwarfs any sane ceiling
        let factor = 1u32 << (error_count - 1).min(31);
        self.min
            .checked_mul(factor)
            .map_or(self.max, |interval| interval.min(self.max))
    }

    pub fn min(&self) -> Duration {
        self.min
    }

    pub fn max(&self) -> Duration {
        self.max
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}
