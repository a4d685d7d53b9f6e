//! Capped exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;

/// Backoff configuration shared by store retries, watch reconnects and
/// controller requeues.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Base delay for first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            ..Default::default()
        }
    }

    /// Same delays without randomization.
    #[must_use]
    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    /// Calculate delay for the given attempt number (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.min(32) as i32;
        let delay = self.base.as_millis() as f64 * 2.0_f64.powi(exp);
        let max = self.max.as_millis() as f64;
        let delay = delay.min(max);

        let jitter_range = delay * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            rand::rng().random_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };
        let final_delay = (delay + jitter).clamp(0.0, max);

        Duration::from_millis(final_delay as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_doubles_until_cap() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(1))
            .without_jitter();
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(800));
        assert_eq!(policy.delay(4), Duration::from_secs(1));
        assert_eq!(policy.delay(1000), Duration::from_secs(1));
    }

    proptest! {
        #[test]
        fn prop_delay_never_exceeds_max(attempt in 0u32..100, jitter in 0.0f64..1.0) {
            let policy = BackoffPolicy {
                base: Duration::from_millis(50),
                max: Duration::from_secs(5),
                jitter,
            };
            prop_assert!(policy.delay(attempt) <= policy.max);
        }
    }
}
