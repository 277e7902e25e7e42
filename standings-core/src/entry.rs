//! Cache entries with freshness metadata.
//!
//! Every store in the workspace keeps its payloads inside a [`CacheEntry`]:
//!
//! - [`CacheEntry`] - last known value, last error and the three lifecycle instants
//! - [`ExpiryPolicy`] - turns a write instant into `fresh_until` / `hard_expiry`
//! - [`Freshness`] - result of classifying an entry against the current time
//!
//! ## Fresh, stale and expired
//!
//! ```text
//! stored_at            fresh_until                 hard_expiry      + grace
//!     |---- Fresh ---------|----------- Stale ----------|---- Stale ----|-- Expired
//! ```
//!
//! A fresh entry can be served without any refresh. A stale entry is still
//! served, but is eligible for revalidation. An expired entry must not be
//! served and should be purged by whoever discovers it.
//!
//! ```
//! use std::time::Duration;
//! use chrono::Utc;
//! use standings_core::{CacheEntry, ExpiryPolicy, Freshness};
//!
//! let policy = ExpiryPolicy::new(Duration::from_secs(300), Duration::from_secs(1800));
//! let now = Utc::now();
//! let entry: CacheEntry<&str, ()> = CacheEntry::new(Some("standings"), None, now, &policy);
//!
//! assert_eq!(entry.freshness(now, Duration::ZERO), Freshness::Fresh);
//! assert!(entry.fresh_until() <= entry.hard_expiry());
//! ```

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Adds a std duration to an instant, saturating at the far future.
pub fn offset(at: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(by)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Classification of an entry at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Younger than `stale_after`; serve without refreshing.
    Fresh,
    /// Past `stale_after` but before `hard_expiry` (plus grace); serve and refresh.
    Stale,
    /// Past `hard_expiry` (plus grace); unusable.
    Expired,
}

impl Freshness {
    /// Returns `true` for [`Freshness::Stale`].
    pub fn is_stale(self) -> bool {
        matches!(self, Freshness::Stale)
    }

    /// Returns `true` for [`Freshness::Expired`].
    pub fn is_expired(self) -> bool {
        matches!(self, Freshness::Expired)
    }
}

/// Soft and hard lifetimes of an entry.
///
/// `stale_after` is clamped to `ttl`, so `fresh_until <= hard_expiry` holds for
/// every entry produced by this policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiryPolicy {
    stale_after: Duration,
    ttl: Duration,
}

impl ExpiryPolicy {
    /// Creates a policy where entries go stale after `stale_after` and are
    /// purged after `ttl`.
    pub fn new(stale_after: Duration, ttl: Duration) -> Self {
        Self {
            stale_after: stale_after.min(ttl),
            ttl,
        }
    }

    /// Creates a policy without a soft phase: entries stay fresh until `ttl`.
    pub fn hard(ttl: Duration) -> Self {
        Self::new(ttl, ttl)
    }

    /// Time after which an entry stops being fresh.
    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    /// Time after which an entry is purged.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Computes `(fresh_until, hard_expiry)` for an entry stored at `stored_at`.
    pub fn deadlines(&self, stored_at: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        (
            offset(stored_at, self.stale_after),
            offset(stored_at, self.ttl),
        )
    }
}

/// A cached value together with its lifecycle metadata.
///
/// `value` and `last_error` are tracked independently: a failed refresh
/// records the error through [`CacheEntry::fail`] and leaves the last good
/// value untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry<V, E> {
    value: Option<V>,
    stored_at: DateTime<Utc>,
    fresh_until: DateTime<Utc>,
    hard_expiry: DateTime<Utc>,
    last_error: Option<E>,
    refreshing: bool,
    last_attempt: Option<DateTime<Utc>>,
}

impl<V, E> CacheEntry<V, E> {
    /// Creates an entry written at `stored_at`.
    pub fn new(
        value: Option<V>,
        error: Option<E>,
        stored_at: DateTime<Utc>,
        policy: &ExpiryPolicy,
    ) -> Self {
        let (fresh_until, hard_expiry) = policy.deadlines(stored_at);
        Self {
            value,
            stored_at,
            fresh_until,
            hard_expiry,
            last_error: error,
            refreshing: false,
            last_attempt: None,
        }
    }

    /// Creates a placeholder entry for a key whose first fetch is starting.
    ///
    /// A placeholder has no value, so it is never considered fresh.
    pub fn pending(now: DateTime<Utc>, policy: &ExpiryPolicy) -> Self {
        let mut entry = Self::new(None, None, now, policy);
        entry.fresh_until = now;
        entry
    }

    /// The last successfully fetched value, if any.
    #[inline]
    pub fn value(&self) -> Option<&V> {
        self.value.as_ref()
    }

    /// The error recorded by the last failed refresh, if any.
    #[inline]
    pub fn error(&self) -> Option<&E> {
        self.last_error.as_ref()
    }

    /// When the entry was last written.
    #[inline]
    pub fn stored_at(&self) -> DateTime<Utc> {
        self.stored_at
    }

    /// Reads strictly after this instant are stale.
    #[inline]
    pub fn fresh_until(&self) -> DateTime<Utc> {
        self.fresh_until
    }

    /// Reads after this instant (plus any grace window) are expired.
    #[inline]
    pub fn hard_expiry(&self) -> DateTime<Utc> {
        self.hard_expiry
    }

    /// Whether a fetch for this entry's key is in flight.
    #[inline]
    pub fn is_refreshing(&self) -> bool {
        self.refreshing
    }

    /// When the most recent refresh attempt started.
    #[inline]
    pub fn last_attempt(&self) -> Option<DateTime<Utc>> {
        self.last_attempt
    }

    /// Classifies the entry at `now`, allowing `grace` past the hard expiry.
    pub fn freshness(&self, now: DateTime<Utc>, grace: Duration) -> Freshness {
        if self.value.is_some() && now <= self.fresh_until {
            Freshness::Fresh
        } else if now <= offset(self.hard_expiry, grace) {
            Freshness::Stale
        } else {
            Freshness::Expired
        }
    }

    /// Shorthand for `freshness(now, grace).is_expired()`.
    pub fn is_expired(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        self.freshness(now, grace).is_expired()
    }

    /// Whether a refresh attempt started less than `window` before `now`.
    pub fn attempted_within(&self, now: DateTime<Utc>, window: Duration) -> bool {
        self.last_attempt
            .is_some_and(|started| now < offset(started, window))
    }

    /// Replaces value and error and restarts the lifecycle at `now`.
    ///
    /// The `refreshing` flag and the last attempt instant are preserved.
    pub fn replace(
        &mut self,
        value: Option<V>,
        error: Option<E>,
        now: DateTime<Utc>,
        policy: &ExpiryPolicy,
    ) {
        let (fresh_until, hard_expiry) = policy.deadlines(now);
        self.value = value;
        self.last_error = error;
        self.stored_at = now;
        self.fresh_until = fresh_until;
        self.hard_expiry = hard_expiry;
    }

    /// Records a failed refresh. The current value is kept.
    pub fn fail(&mut self, error: E) {
        self.last_error = Some(error);
    }

    /// Marks a refresh as started at `now`.
    pub fn begin_refresh(&mut self, now: DateTime<Utc>) {
        self.refreshing = true;
        self.last_attempt = Some(now);
    }

    /// Marks the in-flight refresh as finished.
    pub fn end_refresh(&mut self) {
        self.refreshing = false;
    }

    /// Ends the fresh phase early so the next read is stale.
    pub fn mark_stale(&mut self, now: DateTime<Utc>) {
        let cutoff = now - chrono::Duration::milliseconds(1);
        if cutoff < self.fresh_until {
            self.fresh_until = cutoff;
        }
        self.last_attempt = None;
    }

    /// Consumes the entry and returns its value.
    pub fn into_value(self) -> Option<V> {
        self.value
    }
}
