//! Timeout and retry policies for gateway calls.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff between retry attempts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// No delay between retries.
    None,
    /// Fixed delay.
    Fixed { millis: u64 },
    /// Exponential backoff with base and cap.
    Exponential { base_millis: u64, max_millis: u64 },
}

impl BackoffStrategy {
    /// Delay before retry number `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            Self::None => Duration::ZERO,
            Self::Fixed { millis } => Duration::from_millis(*millis),
            Self::Exponential {
                base_millis,
                max_millis,
            } => {
                let multiplier = 2u64.saturating_pow(attempt);
                Duration::from_millis(base_millis.saturating_mul(multiplier).min(*max_millis))
            }
        }
    }
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential {
            base_millis: 100,
            max_millis: 1_000,
        }
    }
}

/// Retry policy for gateway calls.
///
/// Only transient failures retry. Declines are final, and timeouts are
/// not retried either: a timed-out charge may have landed, so the order
/// stays pending and the webhook settles it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub backoff: BackoffStrategy,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            backoff: BackoffStrategy::default(),
        }
    }

    pub fn none() -> Self {
        Self {
            max_retries: 0,
            backoff: BackoffStrategy::None,
        }
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(2)
    }
}

/// Timeout for one gateway operation, end to end.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct TimeoutConfig {
    pub total_millis: u64,
}

impl TimeoutConfig {
    pub fn from_total(total: Duration) -> Self {
        Self {
            total_millis: total.as_millis() as u64,
        }
    }

    pub fn total(&self) -> Duration {
        Duration::from_millis(self.total_millis)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            total_millis: 10_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff_caps() {
        let backoff = BackoffStrategy::Exponential {
            base_millis: 100,
            max_millis: 500,
        };
        assert_eq!(backoff.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_millis(500));
    }

    #[test]
    fn test_retry_budget() {
        let policy = RetryPolicy::new(2);
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(1));
        assert!(!policy.should_retry(2));
        assert!(!RetryPolicy::none().should_retry(0));
    }
}
