//! Retry delay policies.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How the delay grows between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay every time
    Fixed,
    /// base * 2^(attempt - 1)
    #[default]
    Exponential,
}

/// Backoff and attempt ceiling shared by local denials and transient vendor errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Attempts allowed before a job is failed
    pub max_attempts: u32,
    pub strategy: BackoffStrategy,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            max_attempts: 10,
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl BackoffPolicy {
    pub fn exponential(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_attempts,
            strategy: BackoffStrategy::Exponential,
        }
    }

    pub fn fixed(delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            max_attempts,
            strategy: BackoffStrategy::Fixed,
        }
    }

    /// Delay after the `attempt`-th failed attempt (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                let factor = 2u32.saturating_pow((attempt - 1).min(31));
                self.base_delay.saturating_mul(factor)
            }
        };

        delay.min(self.max_delay)
    }

    /// Whether another attempt is allowed after `attempts` have been made.
    pub fn allows_another(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_doubles_then_caps() {
        let p = BackoffPolicy::exponential(Duration::from_millis(500), Duration::from_secs(5), 10);
        assert_eq!(p.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(p.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(p.delay_for_attempt(2), Duration::from_millis(1000));
        assert_eq!(p.delay_for_attempt(4), Duration::from_millis(4000));
        assert_eq!(p.delay_for_attempt(5), Duration::from_secs(5));
        assert_eq!(p.delay_for_attempt(200), Duration::from_secs(5));
    }

    #[test]
    fn fixed_never_grows() {
        let p = BackoffPolicy::fixed(Duration::from_millis(250), 3);
        assert_eq!(p.delay_for_attempt(1), p.delay_for_attempt(7));
    }

    #[test]
    fn ceiling() {
        let p = BackoffPolicy::default();
        assert!(p.allows_another(9));
        assert!(!p.allows_another(10));
    }
}
