use std::time;

use chrono::{DateTime, Utc};

/// What to do with a mail after a failed delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Requeue the mail, ineligible until the given time.
    RetryAt(DateTime<Utc>),
    /// Drop the mail: the next retry would land at or past its time to live.
    Expire,
}

#[derive(Copy, Clone, Debug)]
/// The retry policy the worker uses to set `not_before` when requeuing a mail, or to expire it.
pub struct RetryPolicy {
    /// How long a mail may stay in the queue, counted from its creation.
    unprocessed_ttl: time::Duration,
    /// Retries are delayed by `attempt_count ^ backoff_exponent` minutes.
    backoff_exponent: u32,
}

impl RetryPolicy {
    pub fn new(unprocessed_ttl: time::Duration, backoff_exponent: u32) -> Self {
        Self {
            unprocessed_ttl,
            backoff_exponent,
        }
    }

    pub fn unprocessed_ttl(&self) -> time::Duration {
        self.unprocessed_ttl
    }

    pub fn backoff_exponent(&self) -> u32 {
        self.backoff_exponent
    }

    /// Delay before the next attempt, given the number of attempts that already failed.
    /// `None` when the delay does not fit in a `chrono::Duration`.
    ///
    /// The count is the one *before* this failure is recorded, so the first retry is immediate.
    pub fn backoff(&self, attempt_count: u32) -> Option<chrono::Duration> {
        let minutes = i64::from(attempt_count).checked_pow(self.backoff_exponent)?;
        chrono::Duration::try_minutes(minutes)
    }

    /// Decide between retrying and expiring a mail created at `created_at` that failed at `now`.
    pub fn decide(
        &self,
        attempt_count: u32,
        created_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> RetryDecision {
        let retry_at = match self
            .backoff(attempt_count)
            .and_then(|delay| now.checked_add_signed(delay))
        {
            Some(retry_at) => retry_at,
            None => return RetryDecision::Expire,
        };

        // A TTL too large to represent never expires anything.
        let expires_at = chrono::Duration::from_std(self.unprocessed_ttl)
            .ok()
            .and_then(|ttl| created_at.checked_add_signed(ttl));

        match expires_at {
            Some(expires_at) if expires_at <= retry_at => RetryDecision::Expire,
            _ => RetryDecision::RetryAt(retry_at),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            unprocessed_ttl: time::Duration::from_secs(3 * 24 * 60 * 60),
            backoff_exponent: 2,
        }
    }
}
