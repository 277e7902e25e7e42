//! Lock-free gate for periodic maintenance.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Allows a maintenance pass at most once per interval.
///
/// Stores call [`SweepThrottle::try_begin`] on their write paths. Exactly one
/// caller wins per interval; every other caller pays a single atomic load, so
/// an O(n) sweep never turns into per-operation cost under load.
#[derive(Debug)]
pub struct SweepThrottle {
    interval_ms: i64,
    last_run_ms: AtomicI64,
}

impl SweepThrottle {
    /// Creates a throttle whose first pass is allowed one interval after `start`.
    pub fn new(interval: Duration, start: DateTime<Utc>) -> Self {
        Self {
            interval_ms: i64::try_from(interval.as_millis()).unwrap_or(i64::MAX),
            last_run_ms: AtomicI64::new(start.timestamp_millis()),
        }
    }

    /// The configured minimum spacing between passes.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(0) as u64)
    }

    /// Returns `true` if the caller should run a pass now.
    pub fn try_begin(&self, now: DateTime<Utc>) -> bool {
        let now_ms = now.timestamp_millis();
        let last = self.last_run_ms.load(Ordering::Acquire);
        if now_ms.saturating_sub(last) < self.interval_ms {
            return false;
        }
        self.last_run_ms
            .compare_exchange(last, now_ms, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}
