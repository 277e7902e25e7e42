//! Fixed-window rate limiting.
//!
//! Time is cut into non-overlapping windows aligned to a multiple of the
//! window length. Each `(caller, window)` pair has its own counter:
//!
//! ```text
//!  window_start = now - (now mod window)         reset_at = window_start + window
//!  |-------- counter("1.2.3.4", window_start) --------|-------- next counter ...
//! ```
//!
//! Counters live in a [`DurableStore`](standings_backend::DurableStore) when
//! one is configured. Any durable error sends that single call to the
//! bounded [`MemoryCounterStore`] instead; callers never see the error.

mod limiter;
mod memory;

use chrono::{DateTime, Utc};
use serde::Serialize;

pub use limiter::{WindowRateLimiter, WindowRateLimiterBuilder};
pub use memory::{MemoryCounterStore, RateWindowCounter};

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateDecision {
    /// Whether the operation may proceed.
    pub allowed: bool,
    /// Operations left in the current window.
    pub remaining: u32,
    /// End of the current window, epoch seconds.
    pub reset_at: i64,
    /// Seconds until the window resets, set only when denied. At least 1.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

/// One fixed window, in epoch seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Window {
    pub(crate) start: i64,
    pub(crate) end: i64,
}

impl Window {
    /// The window of length `len_secs` containing `now`.
    pub(crate) fn containing(now: DateTime<Utc>, len_secs: i64) -> Self {
        let len_secs = len_secs.max(1);
        let now_secs = now.timestamp();
        let start = now_secs - now_secs.rem_euclid(len_secs);
        Self {
            start,
            end: start.saturating_add(len_secs),
        }
    }

    /// Whole seconds until the window ends, rounded up, at least 1.
    pub(crate) fn seconds_left(&self, now: DateTime<Utc>) -> u64 {
        let millis_left = self
            .end
            .saturating_mul(1000)
            .saturating_sub(now.timestamp_millis());
        let secs = millis_left.saturating_add(999) / 1000;
        u64::try_from(secs).unwrap_or(0).max(1)
    }

    pub(crate) fn allow(&self, limit: u32, count: u32) -> RateDecision {
        RateDecision {
            allowed: true,
            remaining: limit.saturating_sub(count),
            reset_at: self.end,
            retry_after: None,
        }
    }

    pub(crate) fn deny(&self, now: DateTime<Utc>) -> RateDecision {
        RateDecision {
            allowed: false,
            remaining: 0,
            reset_at: self.end,
            retry_after: Some(self.seconds_left(now)),
        }
    }
}
