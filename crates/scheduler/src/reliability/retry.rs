//! Backoff between task retries

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::duration_serde::millis;

/// Backoff applied before resubmitting a task whose worker crashed
///
/// The retry budget itself lives on the task (`max_retries`); this policy
/// only decides how long to wait before the task re-enters the queue.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use tessera_scheduler::reliability::RetryPolicy;
///
/// let policy = RetryPolicy::exponential()
///     .with_initial_interval(Duration::from_millis(50))
///     .with_max_interval(Duration::from_secs(2))
///     .with_jitter(0.0);
///
/// assert_eq!(policy.delay_for_retry(1), Duration::from_millis(50));
/// assert_eq!(policy.delay_for_retry(2), Duration::from_millis(100));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry
    #[serde(with = "millis")]
    pub initial_interval: Duration,

    /// Upper bound on any single delay
    #[serde(with = "millis")]
    pub max_interval: Duration,

    /// Multiplier applied per retry
    pub backoff_coefficient: f64,

    /// Jitter factor (0.0-1.0); 0.1 means ±10%
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// Exponential backoff: 10ms, 20ms, 40ms ... capped at 1s, 10% jitter
    pub fn exponential() -> Self {
        Self {
            initial_interval: Duration::from_millis(10),
            max_interval: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            jitter: 0.1,
        }
    }

    /// Resubmit without waiting
    pub fn immediate() -> Self {
        Self {
            initial_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            backoff_coefficient: 1.0,
            jitter: 0.0,
        }
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient.max(1.0);
        self
    }

    /// Set the jitter factor (0.0-1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry number `retry` (1-based)
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }

        let exponent = (retry - 1).min(i32::MAX as u32) as i32;
        let base = self.initial_interval.as_secs_f64() * self.backoff_coefficient.powi(exponent);
        let capped = base.min(self.max_interval.as_secs_f64());

        let jittered = if self.jitter > 0.0 && capped > 0.0 {
            let range = capped * self.jitter;
            let offset = rand::thread_rng().gen_range(-range..range);
            (capped + offset).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_growth() {
        let policy = RetryPolicy::exponential().with_jitter(0.0);

        assert_eq!(policy.delay_for_retry(0), Duration::ZERO);
        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(10));
        assert_eq!(policy.delay_for_retry(2), Duration::from_millis(20));
        assert_eq!(policy.delay_for_retry(3), Duration::from_millis(40));
    }

    #[test]
    fn test_max_interval_cap() {
        let policy = RetryPolicy::exponential()
            .with_max_interval(Duration::from_millis(50))
            .with_jitter(0.0);

        assert_eq!(policy.delay_for_retry(30), Duration::from_millis(50));
    }

    #[test]
    fn test_immediate() {
        let policy = RetryPolicy::immediate();
        assert_eq!(policy.delay_for_retry(5), Duration::ZERO);
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy::exponential()
            .with_initial_interval(Duration::from_millis(100))
            .with_jitter(0.5);

        for _ in 0..100 {
            let delay = policy.delay_for_retry(1);
            assert!(delay >= Duration::from_millis(50));
            assert!(delay <= Duration::from_millis(150));
        }
    }

    #[test]
    fn test_serialization() {
        let policy = RetryPolicy::exponential().with_initial_interval(Duration::from_millis(25));
        let json = serde_json::to_value(&policy).unwrap();
        assert_eq!(json["initial_interval"], 25);

        let parsed: RetryPolicy = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, policy);
    }
}
