use rand::Rng;
use std::time::Duration;

/// Per-stage retry budget with capped exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: if max_delay.is_zero() {
                base_delay
            } else {
                max_delay
            },
        }
    }

    /// Whether another attempt is allowed after `failed_attempts` failures.
    pub fn allows_retry(&self, failed_attempts: u32) -> bool {
        failed_attempts < self.max_attempts
    }

    /// Delay before retry number `attempt` (1-based), with up to 20% jitter.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }

        let factor = 1u128 << attempt.saturating_sub(1).min(6);
        let base_ms = self.base_delay.as_millis();
        let capped = base_ms
            .saturating_mul(factor)
            .min(self.max_delay.as_millis()) as u64;
        let jitter = rand::rng().random_range(0..=capped / 5);
        Duration::from_millis(capped.saturating_sub(jitter))
    }
}
