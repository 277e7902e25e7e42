use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use smol_str::SmolStr;
use standings_core::{RecencyQueue, SweepThrottle};
use tracing::debug;

use super::{RateDecision, Window};

/// Count of operations by one caller within one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateWindowCounter {
    /// Operations counted so far. Only grows within a window.
    pub count: u32,
    /// End of the window, epoch seconds. The counter is dead from then on.
    pub window_end: i64,
}

type CounterKey = (SmolStr, i64);

struct Slot {
    counter: RateWindowCounter,
    tick: u64,
}

#[derive(Default)]
struct Counters {
    slots: HashMap<CounterKey, Slot>,
    order: RecencyQueue<CounterKey>,
}

impl Counters {
    fn purge_elapsed(&mut self, now_secs: i64) -> usize {
        let before = self.slots.len();
        self.slots.retain(|_, slot| slot.counter.window_end > now_secs);
        self.compact();
        before - self.slots.len()
    }

    fn evict_oldest(&mut self) -> bool {
        let Self { slots, order } = self;
        let victim = order
            .pop_oldest(|key, tick| slots.get(key).is_some_and(|slot| slot.tick == tick))
            .or_else(|| slots.keys().next().cloned());
        match victim {
            Some(key) => slots.remove(&key).is_some(),
            None => false,
        }
    }

    fn compact(&mut self) {
        let Self { slots, order } = self;
        if order.needs_compaction(slots.len()) {
            order.compact(|key, tick| slots.get(key).is_some_and(|slot| slot.tick == tick));
        }
    }
}

/// Bounded in-memory counter store used when the durable store is absent
/// or failing.
///
/// The number of resident counters never exceeds `capacity`. When a new
/// counter would cross it, counters of elapsed windows are purged first and
/// then the least recently touched ones are evicted, so under pressure a
/// caller may be counted from zero again.
#[derive(Debug)]
pub struct MemoryCounterStore {
    capacity: usize,
    counters: Mutex<Counters>,
    cleanup: SweepThrottle,
}

impl std::fmt::Debug for Counters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Counters")
            .field("resident", &self.slots.len())
            .finish()
    }
}

impl MemoryCounterStore {
    /// Creates a store holding at most `capacity` counters.
    pub fn new(capacity: usize, cleanup_interval: Duration, now: DateTime<Utc>) -> Self {
        Self {
            capacity: capacity.max(1),
            counters: Mutex::new(Counters::default()),
            cleanup: SweepThrottle::new(cleanup_interval, now),
        }
    }

    /// Maximum number of resident counters.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of resident counters, including elapsed ones not yet purged.
    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    /// Whether no counters are resident.
    pub fn is_empty(&self) -> bool {
        self.lock().slots.is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Counts one operation by `caller` in `window` unless the limit is reached.
    pub(crate) fn check_and_increment(
        &self,
        caller: &str,
        window: &Window,
        limit: u32,
        now: DateTime<Utc>,
    ) -> RateDecision {
        self.count(caller, window, limit, 0, now).0
    }

    /// Like [`check_and_increment`](Self::check_and_increment), but counting
    /// from at least `floor`. Returns the decision and the count after it.
    ///
    /// The check and the increment happen under one lock, so concurrent
    /// callers never both take the last slot of a window.
    pub(crate) fn count(
        &self,
        caller: &str,
        window: &Window,
        limit: u32,
        floor: u32,
        now: DateTime<Utc>,
    ) -> (RateDecision, u32) {
        let now_secs = now.timestamp();
        let key = (SmolStr::new(caller), window.start);
        let mut counters = self.lock();

        if self.cleanup.try_begin(now) {
            let purged = counters.purge_elapsed(now_secs);
            debug!(purged, "Purged elapsed rate windows");
        }

        if !counters.slots.contains_key(&key) && counters.slots.len() >= self.capacity {
            let purged = counters.purge_elapsed(now_secs);
            let mut evicted = 0usize;
            while counters.slots.len() >= self.capacity && counters.evict_oldest() {
                evicted += 1;
            }
            debug!(purged, evicted, "Fallback rate store at capacity");
        }

        let Counters { slots, order } = &mut *counters;
        let slot = slots.entry(key.clone()).or_insert(Slot {
            counter: RateWindowCounter {
                count: 0,
                window_end: window.end,
            },
            tick: 0,
        });

        slot.counter.count = slot.counter.count.max(floor);
        let decision = if slot.counter.count >= limit {
            window.deny(now)
        } else {
            slot.counter.count += 1;
            window.allow(limit, slot.counter.count)
        };
        let count = slot.counter.count;
        slot.tick = order.touch(key);
        counters.compact();
        (decision, count)
    }

    /// The counter of `caller` in `window`, if resident.
    pub(crate) fn peek(&self, caller: &str, window: &Window) -> Option<RateWindowCounter> {
        self.lock()
            .slots
            .get(&(SmolStr::new(caller), window.start))
            .map(|slot| slot.counter)
    }

    /// Drops the counter of `caller` in `window`.
    pub(crate) fn reset(&self, caller: &str, window: &Window) -> bool {
        self.lock()
            .slots
            .remove(&(SmolStr::new(caller), window.start))
            .is_some()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap()
    }

    #[test]
    fn never_exceeds_capacity() {
        let now = at(1_699_999_980);
        let store = MemoryCounterStore::new(8, Duration::from_secs(60), now);
        let window = Window::containing(now, 60);

        for caller in 0..1000 {
            let decision = store.check_and_increment(&caller.to_string(), &window, 5, now);
            assert!(decision.allowed);
            assert!(store.len() <= 8);
        }
        assert_eq!(store.len(), 8);
    }

    #[test]
    fn elapsed_windows_are_purged_before_live_ones() {
        let t0 = at(1_699_999_980);
        let store = MemoryCounterStore::new(3, Duration::from_secs(3600), t0);
        let old = Window::containing(t0, 60);
        store.check_and_increment("a", &old, 5, t0);
        store.check_and_increment("b", &old, 5, t0);

        let t1 = at(1_699_999_980 + 60);
        let live = Window::containing(t1, 60);
        store.check_and_increment("c", &live, 5, t1);
        store.check_and_increment("d", &live, 5, t1);

        assert!(store.peek("a", &old).is_none());
        assert!(store.peek("b", &old).is_none());
        assert_eq!(store.peek("c", &live).map(|c| c.count), Some(1));
        assert_eq!(store.peek("d", &live).map(|c| c.count), Some(1));
    }

    #[test]
    fn floor_raises_the_count_before_deciding() {
        let now = at(1_699_999_980);
        let store = MemoryCounterStore::new(8, Duration::from_secs(60), now);
        let window = Window::containing(now, 60);

        let (decision, count) = store.count("a", &window, 5, 3, now);
        assert_eq!((decision.remaining, count), (1, 4));
        let (decision, count) = store.count("a", &window, 5, 0, now);
        assert_eq!((decision.remaining, count), (0, 5));
        let (decision, count) = store.count("a", &window, 5, 0, now);
        assert!(!decision.allowed);
        assert_eq!(count, 5);
    }

    #[test]
    fn least_recently_touched_live_counter_is_evicted() {
        let now = at(1_699_999_980);
        let store = MemoryCounterStore::new(2, Duration::from_secs(3600), now);
        let window = Window::containing(now, 60);
        store.check_and_increment("a", &window, 5, now);
        store.check_and_increment("b", &window, 5, now);
        store.check_and_increment("a", &window, 5, now);
        store.check_and_increment("c", &window, 5, now);

        assert_eq!(store.peek("a", &window).map(|c| c.count), Some(2));
        assert!(store.peek("b", &window).is_none());
        assert!(store.peek("c", &window).is_some());
    }
}
