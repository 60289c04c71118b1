//! Connection retry policy
//!
//! Deterministic exponential backoff schedule shared by every component that
//! opens a connection. The first attempt is always immediate; later attempts
//! wait `initial_delay * multiplier^(attempt - 2)` capped at `max_delay`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DaqifiError, Result};

/// Retry policy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Whether retry is enabled; when false clients perform exactly one attempt
    pub enabled: bool,
    /// Maximum connection attempts (must be at least 1)
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound on the backoff delay
    pub max_delay: Duration,
    /// Backoff multiplier for exponential delay (must be at least 1.0)
    pub backoff_multiplier: f64,
    /// Deadline applied to each individual attempt
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            attempt_timeout: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Policy that performs a single attempt with the given timeout
    pub fn single_attempt(attempt_timeout: Duration) -> Self {
        Self {
            enabled: false,
            max_attempts: 1,
            attempt_timeout,
            ..Self::default()
        }
    }

    /// Validate policy invariants
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(DaqifiError::ConfigError(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(DaqifiError::ConfigError(
                "backoff_multiplier must be at least 1.0".to_string(),
            ));
        }
        if self.max_delay < self.initial_delay {
            return Err(DaqifiError::ConfigError(
                "max_delay must not be smaller than initial_delay".to_string(),
            ));
        }
        Ok(())
    }

    /// Number of attempts clients should perform under this policy
    pub fn effective_attempts(&self) -> u32 {
        if self.enabled {
            self.max_attempts.max(1)
        } else {
            1
        }
    }

    /// Delay to wait before the given 1-based attempt
    ///
    /// The first attempt has no delay. Attempt `k > 1` waits
    /// `initial_delay * multiplier^(k - 2)` capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 2) as i32;
        let delay = self
            .initial_delay
            .mul_f64(self.backoff_multiplier.powi(exponent));
        delay.min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_attempt_has_no_delay() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::ZERO);
    }

    #[test]
    fn test_exponential_backoff() {
        let policy = RetryPolicy {
            enabled: true,
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            attempt_timeout: Duration::from_secs(1),
        };

        assert_eq!(policy.delay_for(2), Duration::from_millis(100));
        assert_eq!(policy.delay_for(3), Duration::from_millis(200));
        assert_eq!(policy.delay_for(4), Duration::from_millis(400));
        assert_eq!(policy.delay_for(5), Duration::from_millis(800));
    }

    #[test]
    fn test_delay_never_exceeds_max() {
        let policy = RetryPolicy {
            enabled: true,
            max_attempts: 30,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            attempt_timeout: Duration::from_secs(1),
        };

        for attempt in 1..=30 {
            assert!(policy.delay_for(attempt) <= Duration::from_secs(5));
        }
    }

    #[test]
    fn test_disabled_policy_performs_single_attempt() {
        let policy = RetryPolicy {
            enabled: false,
            max_attempts: 7,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.effective_attempts(), 1);
    }

    #[test]
    fn test_validation_rejects_inverted_delays() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(1),
            ..RetryPolicy::default()
        };
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_zero_attempts() {
        let policy = RetryPolicy {
            max_attempts: 0,
            ..RetryPolicy::default()
        };
        assert!(policy.validate().is_err());
    }
}
