//! Retry backoff strategies.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::ProcessError;

/// Backoff configuration stored with a job's options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackoffOptions {
    /// Constant delay between attempts.
    Fixed { delay: u64 },
    /// Delay doubles with every attempt: `delay * 2^(attempts_made - 1)`.
    Exponential { delay: u64 },
    /// Delegate to a strategy registered on the worker.
    Custom,
}

/// Outcome of a backoff computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffDecision {
    /// Schedule the retry after this many milliseconds (0 retries immediately).
    RetryIn(u64),
    /// Stop retrying and fail the job even if attempts remain.
    DontRetry,
}

/// Custom strategy registered on a worker. Receives the number of attempts
/// already made and the error that ended the last one.
pub type CustomBackoff = Arc<dyn Fn(u32, &ProcessError) -> BackoffDecision + Send + Sync>;

/// Computes the retry decision for a failed attempt.
///
/// Returns `None` only when the job asks for a custom strategy and the
/// worker has none registered; the caller must treat that as a terminal
/// failure rather than guessing a delay.
pub fn compute(
    options: Option<&BackoffOptions>,
    attempts_made: u32,
    error: &ProcessError,
    custom: Option<&CustomBackoff>,
) -> Option<BackoffDecision> {
    match options {
        None => Some(BackoffDecision::RetryIn(0)),
        Some(BackoffOptions::Fixed { delay }) => Some(BackoffDecision::RetryIn(*delay)),
        Some(BackoffOptions::Exponential { delay }) => {
            Some(BackoffDecision::RetryIn(exponential_delay(*delay, attempts_made)))
        }
        Some(BackoffOptions::Custom) => custom.map(|strategy| strategy(attempts_made, error)),
    }
}

fn exponential_delay(base: u64, attempts_made: u32) -> u64 {
    // Shift saturates well before u64 overflow becomes observable.
    let shift = attempts_made.saturating_sub(1).min(32);
    base.saturating_mul(1u64 << shift)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn err() -> ProcessError {
        ProcessError::new("boom")
    }

    #[test]
    fn test_no_backoff_retries_immediately() {
        assert_eq!(compute(None, 1, &err(), None), Some(BackoffDecision::RetryIn(0)));
    }

    #[test]
    fn test_fixed_delay_is_constant() {
        let opts = BackoffOptions::Fixed { delay: 500 };
        for attempts in 1..5 {
            assert_eq!(
                compute(Some(&opts), attempts, &err(), None),
                Some(BackoffDecision::RetryIn(500))
            );
        }
    }

    #[test]
    fn test_exponential_delay_doubles() {
        let opts = BackoffOptions::Exponential { delay: 100 };
        assert_eq!(compute(Some(&opts), 1, &err(), None), Some(BackoffDecision::RetryIn(100)));
        assert_eq!(compute(Some(&opts), 2, &err(), None), Some(BackoffDecision::RetryIn(200)));
        assert_eq!(compute(Some(&opts), 3, &err(), None), Some(BackoffDecision::RetryIn(400)));
        assert_eq!(compute(Some(&opts), 5, &err(), None), Some(BackoffDecision::RetryIn(1600)));
    }

    #[test]
    fn test_exponential_delay_saturates() {
        assert_eq!(exponential_delay(u64::MAX, 10), u64::MAX);
        assert_eq!(exponential_delay(1, 100), 1u64 << 32);
    }

    #[test]
    fn test_custom_without_strategy_is_none() {
        assert_eq!(compute(Some(&BackoffOptions::Custom), 1, &err(), None), None);
    }

    #[test]
    fn test_custom_strategy_sees_attempt_count() {
        let strategy: CustomBackoff = Arc::new(|attempts, _| {
            if attempts >= 3 {
                BackoffDecision::DontRetry
            } else {
                BackoffDecision::RetryIn(u64::from(attempts) * 10)
            }
        });
        assert_eq!(
            compute(Some(&BackoffOptions::Custom), 2, &err(), Some(&strategy)),
            Some(BackoffDecision::RetryIn(20))
        );
        assert_eq!(
            compute(Some(&BackoffOptions::Custom), 3, &err(), Some(&strategy)),
            Some(BackoffDecision::DontRetry)
        );
    }

    #[test]
    fn test_serde_round_trip() {
        let opts = BackoffOptions::Exponential { delay: 250 };
        let json = serde_json::to_string(&opts).unwrap();
        assert_eq!(json, r#"{"type":"exponential","delay":250}"#);
        let back: BackoffOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(back, opts);
    }
}
