//! Time source abstraction.
//!
//! Every store reads the current time through a [`Clock`] instead of calling
//! [`Utc::now`] directly. Production code uses [`SystemClock`]; tests enable
//! the `test-helpers` feature and drive a [`ManualClock`] explicitly, which
//! keeps window boundaries and expiry instants deterministic.

use std::fmt::Debug;
use std::sync::Arc;

use chrono::{DateTime, Utc};

/// Source of wall-clock time for cache entries and rate windows.
pub trait Clock: Debug + Send + Sync {
    /// Returns the current instant.
    fn now(&self) -> DateTime<Utc>;
}

impl<T> Clock for Arc<T>
where
    T: Clock + ?Sized,
{
    fn now(&self) -> DateTime<Utc> {
        (**self).now()
    }
}

/// Shared clock handle passed to stores.
pub type SharedClock = Arc<dyn Clock>;

/// The system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Returns the default shared clock.
pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}

#[cfg(any(test, feature = "test-helpers"))]
pub use manual::ManualClock;

#[cfg(any(test, feature = "test-helpers"))]
mod manual {
    use std::sync::{Arc, Mutex, PoisonError};
    use std::time::Duration;

    use chrono::{DateTime, TimeZone, Utc};

    use super::Clock;

    /// A clock that only moves when told to.
    ///
    /// Clones share the same underlying instant.
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        now: Arc<Mutex<DateTime<Utc>>>,
    }

    impl ManualClock {
        /// Creates a clock frozen at `start`.
        pub fn new(start: DateTime<Utc>) -> Self {
            Self {
                now: Arc::new(Mutex::new(start)),
            }
        }

        /// Creates a clock frozen at the given unix timestamp (seconds).
        pub fn at_timestamp(secs: i64) -> Self {
            let start = Utc
                .timestamp_opt(secs, 0)
                .single()
                .unwrap_or_default();
            Self::new(start)
        }

        /// Moves the clock forward.
        pub fn advance(&self, by: Duration) {
            let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
            let delta = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::MAX);
            *now = now.checked_add_signed(delta).unwrap_or(DateTime::<Utc>::MAX_UTC);
        }

        /// Moves the clock to an absolute instant.
        pub fn set(&self, to: DateTime<Utc>) {
            *self.now.lock().unwrap_or_else(PoisonError::into_inner) = to;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.now.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn manual_clock_clones_share_time() {
        let clock = ManualClock::at_timestamp(1_700_000_000);
        let other = clock.clone();
        clock.advance(Duration::from_secs(90));
        assert_eq!(other.now().timestamp(), 1_700_000_090);
    }

    #[test]
    fn system_clock_moves_forward() {
        let clock = system_clock();
        let first = clock.now();
        assert!(clock.now() >= first);
    }
}
