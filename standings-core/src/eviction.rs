//! Approximate-LRU bookkeeping.
//!
//! [`RecencyQueue`] is an explicit recency-ordered list of keys. Each touch
//! appends a `(key, tick)` record and returns the tick; the owner keeps the
//! latest tick next to its value. Records whose tick no longer matches the
//! owner's are ghosts left behind by later touches or deletions, and are
//! skipped when popping.
//!
//! ```text
//!   head                                     tail
//!   (a,1) (b,2) (a,3)* (c,4) (b,5)* ...
//!          ^ ghost: b was touched again at 5
//! ```
//!
//! Touch is O(1). Popping the least recently touched key is O(1) amortized,
//! since every ghost is skipped exactly once. [`RecencyQueue::compact`] drops
//! ghosts in bulk so the queue length stays proportional to the live size.

use std::collections::VecDeque;

/// Recency-ordered key list with lazy deletion.
#[derive(Debug, Clone)]
pub struct RecencyQueue<K> {
    records: VecDeque<(K, u64)>,
    next_tick: u64,
}

impl<K> Default for RecencyQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> RecencyQueue<K> {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self {
            records: VecDeque::new(),
            next_tick: 1,
        }
    }

    /// Records a touch of `key` and returns its new tick.
    pub fn touch(&mut self, key: K) -> u64 {
        let tick = self.next_tick;
        self.next_tick += 1;
        self.records.push_back((key, tick));
        tick
    }

    /// Removes and returns the least recently touched live key.
    ///
    /// `is_live(key, tick)` must return `true` only if `tick` is the latest
    /// tick the owner holds for `key`.
    pub fn pop_oldest<F>(&mut self, mut is_live: F) -> Option<K>
    where
        F: FnMut(&K, u64) -> bool,
    {
        while let Some((key, tick)) = self.records.pop_front() {
            if is_live(&key, tick) {
                return Some(key);
            }
        }
        None
    }

    /// Drops every ghost record.
    pub fn compact<F>(&mut self, mut is_live: F)
    where
        F: FnMut(&K, u64) -> bool,
    {
        self.records.retain(|(key, tick)| is_live(key, *tick));
    }

    /// Whether the queue holds enough ghosts to be worth compacting.
    pub fn needs_compaction(&self, live: usize) -> bool {
        self.records.len() > live.saturating_mul(2) + 16
    }

    /// Number of records, including ghosts.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the queue holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Removes every record.
    pub fn clear(&mut self) {
        self.records.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    struct Owner {
        ticks: HashMap<&'static str, u64>,
        queue: RecencyQueue<&'static str>,
    }

    impl Owner {
        fn new() -> Self {
            Self {
                ticks: HashMap::new(),
                queue: RecencyQueue::new(),
            }
        }

        fn touch(&mut self, key: &'static str) {
            let tick = self.queue.touch(key);
            self.ticks.insert(key, tick);
        }

        fn evict(&mut self) -> Option<&'static str> {
            let ticks = &self.ticks;
            let key = self
                .queue
                .pop_oldest(|k, t| ticks.get(k).is_some_and(|live| *live == t))?;
            self.ticks.remove(key);
            Some(key)
        }
    }

    #[test]
    fn evicts_least_recently_touched() {
        let mut owner = Owner::new();
        owner.touch("a");
        owner.touch("b");
        owner.touch("c");
        owner.touch("a");

        assert_eq!(owner.evict(), Some("b"));
        assert_eq!(owner.evict(), Some("c"));
        assert_eq!(owner.evict(), Some("a"));
        assert_eq!(owner.evict(), None);
    }

    #[test]
    fn deleted_keys_are_skipped() {
        let mut owner = Owner::new();
        owner.touch("a");
        owner.touch("b");
        owner.ticks.remove("a");
        assert_eq!(owner.evict(), Some("b"));
    }

    #[test]
    fn compaction_keeps_live_records_in_order() {
        let mut owner = Owner::new();
        for _ in 0..20 {
            owner.touch("hot");
        }
        owner.touch("cold");
        assert!(owner.queue.needs_compaction(owner.ticks.len()));

        let ticks = owner.ticks.clone();
        owner
            .queue
            .compact(|k, t| ticks.get(k).is_some_and(|live| *live == t));
        assert_eq!(owner.queue.len(), 2);
        assert_eq!(owner.evict(), Some("hot"));
    }
}
