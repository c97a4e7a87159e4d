//! Retry policy for failed test attempts

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::TestError;

/// Retry policy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Additional attempts after the first failure
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Exponential backoff base (1.0 = fixed delay)
    pub exponential_base: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::no_retry()
    }
}

impl RetryPolicy {
    /// Create a policy with no retries
    pub fn no_retry() -> Self {
        Self::immediate(0)
    }

    /// Retry straight away, up to `max_retries` times
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            exponential_base: 1.0,
        }
    }

    /// Create a policy with fixed delay
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay: delay,
            max_delay: delay,
            exponential_base: 1.0,
        }
    }

    /// Create a policy with exponential backoff
    pub fn exponential(max_retries: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
            max_delay,
            exponential_base: 2.0,
        }
    }

    /// Total attempts allowed
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Should a failure on 1-based `attempt` be retried?
    pub fn should_retry(&self, attempt: u32, error: Option<&TestError>) -> bool {
        attempt < self.max_attempts() && error.map_or(true, TestError::is_retryable)
    }

    /// Delay before retry number `retry` (1-based)
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 || self.initial_delay.is_zero() {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay.as_secs_f64()
            * self.exponential_base.powi(retry.saturating_sub(1) as i32);
        let capped_delay = base_delay.min(self.max_delay.as_secs_f64());

        Duration::from_secs_f64(capped_delay.max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_retry() {
        let policy = RetryPolicy::no_retry();
        assert_eq!(policy.max_attempts(), 1);
        assert!(!policy.should_retry(1, Some(&TestError::assertion("x"))));
    }

    #[test]
    fn test_should_retry_respects_error_kind() {
        let policy = RetryPolicy::immediate(2);
        assert!(policy.should_retry(1, Some(&TestError::assertion("x"))));
        assert!(policy.should_retry(2, None));
        assert!(!policy.should_retry(3, Some(&TestError::assertion("x"))));
        assert!(!policy.should_retry(1, Some(&TestError::Skipped("later".into()))));
        assert!(!policy.should_retry(1, Some(&TestError::Cancelled)));
    }

    #[test]
    fn test_exponential_delay_is_capped() {
        let policy = RetryPolicy::exponential(5, Duration::from_millis(100), Duration::from_millis(300));
        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_retry(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_retry(3), Duration::from_millis(300));
        assert_eq!(policy.delay_for_retry(4), Duration::from_millis(300));
    }

    #[test]
    fn test_fixed_delay() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(50));
        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(50));
        assert_eq!(policy.delay_for_retry(3), Duration::from_millis(50));
    }
}
