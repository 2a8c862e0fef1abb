//! # Retry Policy
//!
//! Exponential backoff schedule for the retry queue.
//!
//! ```text
//! delay(n) = min(base × 2ⁿ, max)         defaults: base 60s, max 3600s
//!
//! attempt  0     1     2     3     4     5     6
//! delay   60s  120s  240s  480s  960s 1920s 3600s (capped)
//! ```
//!
//! An entry is created at attempt 0 with `next = now + delay(0)`. Each
//! transient failure of a retry increments the attempt count; once it
//! reaches `max_attempts` the invoice fails and an alert is raised.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            base_delay_secs: 60,
            max_delay_secs: 3600,
            max_attempts: 5,
        }
    }
}

/// What to do with a retry entry after a transient failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again at `next_retry_at`; `attempt` is the new attempt count.
    Reschedule {
        attempt: i64,
        next_retry_at: DateTime<Utc>,
    },
    /// Attempts used up.
    Exhausted { attempts: i64 },
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_delays(mut self, base_secs: u64, max_secs: u64) -> Self {
        self.base_delay_secs = base_secs;
        self.max_delay_secs = max_secs;
        self
    }

    /// Delay before attempt `attempt`.
    ///
    /// ```rust
    /// use fiscal_core::retry::RetryPolicy;
    ///
    /// let p = RetryPolicy::default();
    /// let secs: Vec<i64> = (0..5).map(|n| p.delay(n).num_seconds()).collect();
    /// assert_eq!(secs, vec![60, 120, 240, 480, 960]);
    /// assert_eq!(p.delay(10).num_seconds(), 3600);
    /// ```
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let secs = self
            .base_delay_secs
            .saturating_mul(factor)
            .min(self.max_delay_secs);
        Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX))
    }

    /// When a freshly enqueued entry (attempt 0) becomes due.
    pub fn first_retry_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + self.delay(0)
    }

    /// Decision after a retry attempt failed transiently.
    ///
    /// `attempts_so_far` is the entry's attempt count before this failure.
    pub fn after_transient_failure(&self, attempts_so_far: i64, now: DateTime<Utc>) -> RetryDecision {
        let attempt = attempts_so_far.saturating_add(1);
        if attempt >= i64::from(self.max_attempts) {
            RetryDecision::Exhausted { attempts: attempt }
        } else {
            let exp = u32::try_from(attempt).unwrap_or(u32::MAX);
            RetryDecision::Reschedule {
                attempt,
                next_retry_at: now + self.delay(exp),
            }
        }
    }
}
