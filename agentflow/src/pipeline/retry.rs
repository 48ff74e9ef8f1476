//! Retry budget and backoff schedule for stage attempts.
//!
//! The default schedule sleeps `base * 2^attempt` between attempts with no
//! jitter, so a three-attempt stage with a one-second base sleeps 1s and
//! then 2s before giving up.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// delay = base * 2^attempt
    #[default]
    Exponential,
    /// delay = base * (attempt + 1)
    Linear,
    /// delay = base
    Constant,
}

/// Jitter applied on top of the backoff delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// Exact delays.
    #[default]
    None,
    /// Random from 0 to delay.
    Full,
    /// Half fixed, half random.
    Equal,
    /// min(max, random(base, prev * 3))
    Decorrelated,
}

/// How many times a stage runs and how long it sleeps in between.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Zero is treated as one.
    pub max_attempts: usize,
    /// Base delay.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Backoff strategy.
    pub backoff: BackoffStrategy,
    /// Jitter strategy.
    pub jitter: JitterStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff: BackoffStrategy::Exponential,
            jitter: JitterStrategy::None,
        }
    }
}

impl RetryPolicy {
    /// Creates the default policy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy that runs once and never sleeps.
    #[must_use]
    pub fn no_retry() -> Self {
        Self::default().with_max_attempts(1)
    }

    /// Sets the attempt budget.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub fn with_backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff = strategy;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, strategy: JitterStrategy) -> Self {
        self.jitter = strategy;
        self
    }

    /// Returns the effective number of attempts.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.max_attempts.max(1)
    }

    /// Starts a fresh backoff schedule.
    #[must_use]
    pub fn schedule(&self) -> Backoff<'_> {
        Backoff {
            policy: self,
            previous: None,
        }
    }

    fn base_delay_for(&self, attempt: usize) -> Duration {
        let base = self.base_delay;
        let delay = match self.backoff {
            BackoffStrategy::Exponential => {
                let exp = u32::try_from(attempt).unwrap_or(u32::MAX);
                base.saturating_mul(2u32.saturating_pow(exp))
            }
            BackoffStrategy::Linear => {
                base.saturating_mul(u32::try_from(attempt + 1).unwrap_or(u32::MAX))
            }
            BackoffStrategy::Constant => base,
        };
        delay.min(self.max_delay)
    }
}

/// Delay calculator for one stage execution.
///
/// Keeps the previous delay for decorrelated jitter.
#[derive(Debug)]
pub struct Backoff<'a> {
    policy: &'a RetryPolicy,
    previous: Option<Duration>,
}

impl Backoff<'_> {
    /// Returns the delay to sleep after the failed `attempt` (0-indexed).
    pub fn delay_after(&mut self, attempt: usize) -> Duration {
        let delay = self.policy.base_delay_for(attempt);
        let mut rng = rand::thread_rng();

        let jittered = match self.policy.jitter {
            JitterStrategy::None => delay,
            JitterStrategy::Full => {
                if delay.is_zero() {
                    delay
                } else {
                    rng.gen_range(Duration::ZERO..=delay)
                }
            }
            JitterStrategy::Equal => {
                let half = delay / 2;
                if half.is_zero() {
                    delay
                } else {
                    half + rng.gen_range(Duration::ZERO..=half)
                }
            }
            JitterStrategy::Decorrelated => {
                let base = self.policy.base_delay;
                let prev = self.previous.unwrap_or(base);
                let upper = prev.saturating_mul(3).min(self.policy.max_delay);
                if upper <= base {
                    base
                } else {
                    rng.gen_range(base..=upper)
                }
            }
        };

        self.previous = Some(jittered);
        jittered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_schedule_doubles() {
        let policy = RetryPolicy::default();
        let mut backoff = policy.schedule();

        assert_eq!(backoff.delay_after(0), Duration::from_secs(1));
        assert_eq!(backoff.delay_after(1), Duration::from_secs(2));
        assert_eq!(backoff.delay_after(2), Duration::from_secs(4));
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy::default().with_max_delay(Duration::from_secs(3));
        let mut backoff = policy.schedule();

        assert_eq!(backoff.delay_after(5), Duration::from_secs(3));
        assert_eq!(backoff.delay_after(64), Duration::from_secs(3));
    }

    #[test]
    fn test_linear_and_constant() {
        let linear = RetryPolicy::default().with_backoff(BackoffStrategy::Linear);
        let constant = RetryPolicy::default().with_backoff(BackoffStrategy::Constant);

        assert_eq!(linear.schedule().delay_after(2), Duration::from_secs(3));
        assert_eq!(constant.schedule().delay_after(2), Duration::from_secs(1));
    }

    #[test]
    fn test_full_jitter_within_bounds() {
        let policy = RetryPolicy::default().with_jitter(JitterStrategy::Full);
        let mut backoff = policy.schedule();

        for attempt in 0..4 {
            let delay = backoff.delay_after(attempt);
            assert!(delay <= policy.base_delay_for(attempt));
        }
    }

    #[test]
    fn test_decorrelated_jitter_within_bounds() {
        let policy = RetryPolicy::default().with_jitter(JitterStrategy::Decorrelated);
        let mut backoff = policy.schedule();

        for attempt in 0..8 {
            let delay = backoff.delay_after(attempt);
            assert!(delay >= policy.base_delay);
            assert!(delay <= policy.max_delay);
        }
    }

    #[test]
    fn test_zero_attempts_runs_once() {
        assert_eq!(RetryPolicy::default().with_max_attempts(0).attempts(), 1);
        assert_eq!(RetryPolicy::no_retry().attempts(), 1);
    }
}
