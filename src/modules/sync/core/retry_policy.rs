// Retry policy for transient delivery failures.
//
// Responsibilities
// - Exponential backoff: initial * 2^(attempt - 1), capped at the maximum.
// - Give up once the time since the first failure reaches the retry window.

use std::time::Duration;

use crate::shared::infrastructure::change_outbox::{OutboxEvent, RetrySchedule};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_backoff_ms: i64,
    pub max_backoff_ms: i64,
    pub retry_window_ms: i64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 500,
            max_backoff_ms: 60_000,
            retry_window_ms: 15 * 60_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAt(RetrySchedule),
    GiveUp { attempts: u32, reason: String },
}

impl RetryPolicy {
    pub fn from_durations(initial_backoff: Duration, max_backoff: Duration, retry_window: Duration) -> Self {
        let millis = |duration: Duration| i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        Self {
            initial_backoff_ms: millis(initial_backoff),
            max_backoff_ms: millis(max_backoff),
            retry_window_ms: millis(retry_window),
        }
    }

    pub fn backoff_ms(&self, attempt: u32) -> i64 {
        let exponent = attempt.max(1) - 1;
        2_i64
            .checked_pow(exponent)
            .and_then(|factor| self.initial_backoff_ms.checked_mul(factor))
            .map_or(self.max_backoff_ms, |backoff| backoff.min(self.max_backoff_ms))
    }

    /// Decide what happens to an event whose delivery just failed at `now`.
    pub fn decide(&self, event: &OutboxEvent, error: &str, now: i64) -> RetryDecision {
        let attempts = event.attempts.saturating_add(1);
        let first_failed_at = event.first_failed_at.unwrap_or(now);
        if now.saturating_sub(first_failed_at) >= self.retry_window_ms {
            return RetryDecision::GiveUp {
                attempts,
                reason: format!("retry window exhausted after {attempts} attempts: {error}"),
            };
        }
        RetryDecision::RetryAt(RetrySchedule {
            attempts,
            next_attempt_at: now.saturating_add(self.backoff_ms(attempts)),
            first_failed_at,
            last_error: error.to_string(),
        })
    }
}
