//! Retry policy for retryable action failures.

use chrono::Duration;
use clinicflow_core::config::RetryConfig;

/// Exponential backoff for step retries.
///
/// The delay before retry N is `min(base_delay * 2^(N-1), max_delay)`.
/// After `max_attempts` failed attempts the failure is handled as terminal.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Includes the initial attempt.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::seconds(config.base_delay_secs as i64),
            max_delay: Duration::seconds(config.max_delay_secs as i64),
        }
    }

    /// Delay after failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let multiplier = 2i32.saturating_pow(attempt.saturating_sub(1));
        let delay = self
            .base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay);
        delay.min(self.max_delay)
    }

    /// Returns `true` if another attempt should follow failed attempt `attempt`.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay, Duration::seconds(60));
        assert_eq!(policy.max_delay, Duration::seconds(3600));
    }

    #[test]
    fn exponential_backoff() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::seconds(1),
            max_delay: Duration::seconds(300),
        };
        assert_eq!(policy.backoff(1), Duration::seconds(1));
        assert_eq!(policy.backoff(2), Duration::seconds(2));
        assert_eq!(policy.backoff(3), Duration::seconds(4));
        assert_eq!(policy.backoff(4), Duration::seconds(8));
    }

    #[test]
    fn backoff_capped_at_max() {
        let policy = RetryPolicy {
            max_attempts: 50,
            base_delay: Duration::seconds(1),
            max_delay: Duration::seconds(60),
        };
        assert_eq!(policy.backoff(10), Duration::seconds(60));
        assert_eq!(policy.backoff(40), Duration::seconds(60));
    }

    #[test]
    fn should_retry() {
        let policy = RetryPolicy {
            max_attempts: 3,
            ..Default::default()
        };
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }
}
