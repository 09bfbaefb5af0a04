//! Retry logic and policies
//!
//! [`RetryPolicy::evaluate`] is a pure function of the attempt count and the
//! job's retry settings. It never looks at the error itself: handlers decide
//! between retryable and fatal failures explicitly through
//! [`JobFailure`](super::JobFailure).

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::core::Job;

/// Delay function applied between retry attempts.
///
/// Stored on each job, so durations are kept as milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// Retry as soon as possible
    Immediate,
    /// Same delay before every retry
    Fixed {
        /// Delay in milliseconds
        delay_ms: u64,
    },
    /// Delay grows by a fixed increment
    Linear {
        /// Delay before the first retry
        initial_ms: u64,
        /// Added for each further retry
        increment_ms: u64,
        /// Upper bound
        max_ms: u64,
    },
    /// `base * 2^(attempt - 1)`, capped
    Exponential {
        /// Delay before the first retry
        base_ms: u64,
        /// Upper bound
        max_ms: u64,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Exponential {
            base_ms: 1_000,
            max_ms: 15 * 60 * 1_000,
        }
    }
}

impl Backoff {
    /// Create a fixed-delay backoff
    pub fn fixed(delay: Duration) -> Self {
        Self::Fixed {
            delay_ms: millis(delay),
        }
    }

    /// Create a linear backoff
    pub fn linear(initial: Duration, increment: Duration, max: Duration) -> Self {
        Self::Linear {
            initial_ms: millis(initial),
            increment_ms: millis(increment),
            max_ms: millis(max),
        }
    }

    /// Create an exponential backoff
    pub fn exponential(base: Duration, max: Duration) -> Self {
        Self::Exponential {
            base_ms: millis(base),
            max_ms: millis(max),
        }
    }

    /// Delay before retry number `attempt` (1-based: the first retry is 1).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let step = attempt.saturating_sub(1);

        let ms = match *self {
            Backoff::Immediate => 0,
            Backoff::Fixed { delay_ms } => delay_ms,
            Backoff::Linear {
                initial_ms,
                increment_ms,
                max_ms,
            } => initial_ms
                .saturating_add(increment_ms.saturating_mul(step as u64))
                .min(max_ms),
            Backoff::Exponential { base_ms, max_ms } => {
                let factor = 2u64.checked_pow(step).unwrap_or(u64::MAX);
                base_ms.saturating_mul(factor).min(max_ms)
            }
        };

        Duration::from_millis(ms)
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Outcome of evaluating a failed execution against the retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Release the job back to the queue after `delay`
    Retry { delay: Duration },
    /// Retry budget spent; dead-letter the job
    Exhausted,
}

impl RetryDecision {
    /// Check if the decision is to retry
    pub fn is_retry(&self) -> bool {
        matches!(self, RetryDecision::Retry { .. })
    }
}

/// Decides whether a failed job is retried and after how long.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryPolicy;

impl RetryPolicy {
    /// Evaluate a failure.
    ///
    /// `attempts` is the number of failed executions including the one just
    /// observed. A job may fail `max_attempts` times and still be retried; the
    /// next failure exhausts it, so it runs at most `max_attempts + 1` times.
    pub fn evaluate(attempts: u32, max_attempts: u32, backoff: &Backoff) -> RetryDecision {
        if attempts > max_attempts {
            RetryDecision::Exhausted
        } else {
            RetryDecision::Retry {
                delay: backoff.delay_for(attempts),
            }
        }
    }

    /// Evaluate a failure using the retry settings stored on `job`.
    pub fn evaluate_job(job: &Job, attempts: u32) -> RetryDecision {
        Self::evaluate(attempts, job.max_attempts, &job.backoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff_calculation() {
        let backoff = Backoff::exponential(Duration::from_secs(1), Duration::from_secs(300));

        assert_eq!(backoff.delay_for(1), Duration::from_secs(1));
        assert_eq!(backoff.delay_for(2), Duration::from_secs(2));
        assert_eq!(backoff.delay_for(3), Duration::from_secs(4));
        assert_eq!(backoff.delay_for(10), Duration::from_secs(300));
    }

    #[test]
    fn test_exponential_backoff_does_not_overflow() {
        let backoff = Backoff::exponential(Duration::from_secs(1), Duration::from_secs(60));
        assert_eq!(backoff.delay_for(200), Duration::from_secs(60));
    }

    #[test]
    fn test_fixed_retry_calculation() {
        let backoff = Backoff::fixed(Duration::from_secs(5));

        assert_eq!(backoff.delay_for(1), Duration::from_secs(5));
        assert_eq!(backoff.delay_for(7), Duration::from_secs(5));
    }

    #[test]
    fn test_linear_backoff_calculation() {
        let backoff = Backoff::linear(
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_secs(60),
        );

        assert_eq!(backoff.delay_for(1), Duration::from_secs(1));
        assert_eq!(backoff.delay_for(2), Duration::from_secs(3));
        assert_eq!(backoff.delay_for(3), Duration::from_secs(5));
        assert_eq!(backoff.delay_for(100), Duration::from_secs(60));
    }

    #[test]
    fn test_evaluate_retries_until_budget_is_spent() {
        let backoff = Backoff::Immediate;

        assert_eq!(
            RetryPolicy::evaluate(1, 2, &backoff),
            RetryDecision::Retry {
                delay: Duration::ZERO
            }
        );
        assert!(RetryPolicy::evaluate(2, 2, &backoff).is_retry());
        assert_eq!(RetryPolicy::evaluate(3, 2, &backoff), RetryDecision::Exhausted);
    }

    #[test]
    fn test_zero_budget_exhausts_on_first_failure() {
        assert_eq!(
            RetryPolicy::evaluate(1, 0, &Backoff::default()),
            RetryDecision::Exhausted
        );
    }

    #[test]
    fn test_backoff_serde_shape() {
        let json = serde_json::to_string(&Backoff::fixed(Duration::from_millis(250))).unwrap();
        assert_eq!(json, r#"{"kind":"fixed","delay_ms":250}"#);

        let back: Backoff = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Backoff::Fixed { delay_ms: 250 });
    }
}
