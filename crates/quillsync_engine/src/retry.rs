//! Retry bookkeeping shared by both queues.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How long to wait before the next attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffPolicy {
    /// `step * retry_count`.
    Linear {
        /// Delay added per failed attempt.
        step: Duration,
    },
    /// `base * 2^retry_count`, capped at `max`.
    Exponential {
        /// Base delay.
        base: Duration,
        /// Upper bound.
        max: Duration,
    },
}

impl BackoffPolicy {
    /// Linear backoff.
    pub fn linear(step: Duration) -> Self {
        Self::Linear { step }
    }

    /// Exponential backoff capped at five minutes.
    pub fn exponential(base: Duration) -> Self {
        Self::Exponential {
            base,
            max: Duration::from_secs(300),
        }
    }

    /// Returns the delay after `retry_count` failures.
    pub fn delay(&self, retry_count: u32) -> Duration {
        match *self {
            BackoffPolicy::Linear { step } => step.saturating_mul(retry_count),
            BackoffPolicy::Exponential { base, max } => {
                let factor = 1u32.checked_shl(retry_count).unwrap_or(u32::MAX);
                base.saturating_mul(factor).min(max)
            }
        }
    }
}

/// Per-record retry state.
///
/// Flattened into persisted records, so the JSON carries `retry_count`,
/// `max_retries`, `error` and `last_attempt` at the top level.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryState {
    /// Failed attempts so far.
    #[serde(default)]
    pub retry_count: u32,
    /// Attempts allowed before the record is moved to the failed set.
    pub max_retries: u32,
    /// Last error message.
    #[serde(default)]
    pub error: Option<String>,
    /// Time of the last attempt.
    #[serde(default)]
    pub last_attempt: Option<DateTime<Utc>>,
}

impl RetryState {
    /// Creates a fresh state.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// Records a failed attempt. Returns true once retries are exhausted.
    pub fn record_failure(&mut self, error: impl Into<String>) -> bool {
        self.retry_count = self.retry_count.saturating_add(1);
        self.error = Some(error.into());
        self.last_attempt = Some(Utc::now());
        self.is_exhausted()
    }

    /// Returns true if no attempts are left.
    pub fn is_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    /// Clears the counter and the last error.
    pub fn reset(&mut self) {
        self.retry_count = 0;
        self.error = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_delay() {
        let policy = BackoffPolicy::linear(Duration::from_millis(500));
        assert_eq!(policy.delay(0), Duration::ZERO);
        assert_eq!(policy.delay(1), Duration::from_millis(500));
        assert_eq!(policy.delay(3), Duration::from_millis(1500));
    }

    #[test]
    fn exponential_delay_is_capped() {
        let policy = BackoffPolicy::Exponential {
            base: Duration::from_secs(1),
            max: Duration::from_secs(10),
        };
        assert_eq!(policy.delay(0), Duration::from_secs(1));
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(3), Duration::from_secs(8));
        assert_eq!(policy.delay(4), Duration::from_secs(10));
        assert_eq!(policy.delay(64), Duration::from_secs(10));
    }

    #[test]
    fn retry_state_exhaustion() {
        let mut state = RetryState::new(2);
        assert!(!state.record_failure("first"));
        assert!(state.record_failure("second"));
        assert_eq!(state.retry_count, 2);
        assert_eq!(state.error.as_deref(), Some("second"));
        assert!(state.last_attempt.is_some());

        state.reset();
        assert_eq!(state.retry_count, 0);
        assert!(state.error.is_none());
        assert!(!state.is_exhausted());
    }
}
