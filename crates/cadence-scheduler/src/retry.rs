//! Retry policy for failed attempts.
//!
//! The job schema only carries a flat `retry_delay_ms`, so backoff is
//! constant: every retry waits the same delay.

use std::time::Duration;

use crate::runner::Outcome;
use crate::types::{RunStatus, ScheduledJob};

/// What to do after an attempt finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Run another attempt after waiting this long.
    RetryAfter(Duration),
    /// The outcome is final for this logical run.
    GiveUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts allowed per logical run (at least 1).
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    pub fn for_job(job: &ScheduledJob) -> Self {
        Self::new(job.retry_attempts, Duration::from_millis(job.retry_delay_ms))
    }

    /// Decide after `attempt` (1-based) produced `outcome`.
    pub fn decide(&self, attempt: u32, outcome: &Outcome) -> RetryDecision {
        should_retry(
            attempt,
            self.max_attempts,
            self.delay,
            outcome.status,
            outcome.retryable,
        )
    }
}

/// Only retryable failures and timeouts are retried, while `attempt < max_attempts`.
pub fn should_retry(
    attempt: u32,
    max_attempts: u32,
    delay: Duration,
    status: RunStatus,
    retryable: bool,
) -> RetryDecision {
    let failed = matches!(status, RunStatus::Failed | RunStatus::Timeout);
    if failed && retryable && attempt < max_attempts {
        RetryDecision::RetryAfter(delay)
    } else {
        RetryDecision::GiveUp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DELAY: Duration = Duration::from_millis(250);

    #[test]
    fn completed_never_retries() {
        assert_eq!(
            should_retry(1, 5, DELAY, RunStatus::Completed, true),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn failures_retry_until_max_attempts() {
        assert_eq!(
            should_retry(1, 2, DELAY, RunStatus::Failed, true),
            RetryDecision::RetryAfter(DELAY)
        );
        assert_eq!(
            should_retry(2, 2, DELAY, RunStatus::Failed, true),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn timeouts_are_retried_like_failures() {
        assert_eq!(
            should_retry(1, 3, DELAY, RunStatus::Timeout, true),
            RetryDecision::RetryAfter(DELAY)
        );
    }

    #[test]
    fn configuration_failures_are_not_retried() {
        assert_eq!(
            should_retry(1, 5, DELAY, RunStatus::Failed, false),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn delay_is_constant() {
        let policy = RetryPolicy::new(4, DELAY);
        let outcome = Outcome::failed("boom", 3);
        for attempt in 1..4 {
            assert_eq!(policy.decide(attempt, &outcome), RetryDecision::RetryAfter(DELAY));
        }
        assert_eq!(policy.decide(4, &outcome), RetryDecision::GiveUp);
    }

    #[test]
    fn zero_attempts_means_single_attempt() {
        let policy = RetryPolicy::new(0, DELAY);
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(
            policy.decide(1, &Outcome::failed("boom", 1)),
            RetryDecision::GiveUp
        );
    }
}
