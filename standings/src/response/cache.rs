use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use smol_str::SmolStr;
use standings_core::{
    CacheEntry, Clock, ExpiryPolicy, Freshness, RecencyQueue, RequestKey, SharedClock,
    SweepThrottle, system_clock,
};
use tracing::{debug, warn};

use crate::concurrency::{InFlightRegistry, SharedFetch, spawn_flight};
use crate::config::{ResponseConfig, StalePolicy};
use crate::error::{CacheError, SharedError};

#[cfg(feature = "metrics")]
use crate::metrics::{
    CACHE_EVICTIONS, CACHE_HIT_COUNTER, CACHE_MISS_COUNTER, CACHE_STALE_COUNTER, CACHE_SWEPT,
    FETCHES_FAILED,
};

/// A value returned from the response cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cached<V> {
    /// The cached response.
    pub value: V,
    /// The TTL has passed and the value is inside its stale window.
    pub is_stale: bool,
}

/// Occupancy report returned by [`ResponseCache::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    /// Resident keys.
    pub size: usize,
    /// Capacity.
    pub max_entries: usize,
}

struct Slot<V> {
    entry: CacheEntry<V, SharedError>,
    tick: u64,
}

struct Store<V> {
    entries: HashMap<SmolStr, Slot<V>>,
    recency: RecencyQueue<SmolStr>,
}

impl<V> Store<V> {
    fn touch(&mut self, key: &str) {
        let Some(owned) = self.entries.get_key_value(key).map(|(k, _)| k.clone()) else {
            return;
        };
        let tick = self.recency.touch(owned.clone());
        if let Some(slot) = self.entries.get_mut(&owned) {
            slot.tick = tick;
        }
    }

    fn evict_oldest(&mut self) -> Option<SmolStr> {
        let Self { entries, recency } = self;
        let key = recency
            .pop_oldest(|key, tick| entries.get(key).is_some_and(|slot| slot.tick == tick))
            .or_else(|| entries.keys().next().cloned())?;
        entries.remove(&key);
        Some(key)
    }

    fn compact_if_needed(&mut self) {
        let Self { entries, recency } = self;
        if recency.needs_compaction(entries.len()) {
            recency.compact(|key, tick| entries.get(key).is_some_and(|slot| slot.tick == tick));
        }
    }
}

struct Inner<V: Clone> {
    config: ResponseConfig,
    clock: SharedClock,
    store: Mutex<Store<V>>,
    inflight: InFlightRegistry<V>,
    sweep: SweepThrottle,
}

/// Server-facing response cache with a hard TTL, a stale grace window and a
/// bounded number of resident keys.
///
/// Inserting a new key at capacity evicts the least recently touched key;
/// both [`get`](Self::get) and [`set`](Self::set) count as touches.
pub struct ResponseCache<V: Clone> {
    inner: Arc<Inner<V>>,
}

impl<V: Clone> Clone for ResponseCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: Clone> fmt::Debug for ResponseCache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseCache")
            .field("max_entries", &self.inner.config.max_entries)
            .field("stale_policy", &self.inner.config.stale_policy)
            .field("inflight", &self.inner.inflight)
            .finish()
    }
}

impl<V> ResponseCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Creates a cache using the system clock.
    pub fn new(config: ResponseConfig) -> Self {
        Self::with_clock(config, system_clock())
    }

    /// Creates a cache reading time from `clock`.
    pub fn with_clock(config: ResponseConfig, clock: impl Clock + 'static) -> Self {
        let now = clock.now();
        Self {
            inner: Arc::new(Inner {
                store: Mutex::new(Store {
                    entries: HashMap::with_capacity(config.max_entries.min(1024)),
                    recency: RecencyQueue::new(),
                }),
                sweep: SweepThrottle::new(config.sweep_interval, now),
                inflight: InFlightRegistry::new(),
                clock: Arc::new(clock),
                config,
            }),
        }
    }

    /// The active configuration.
    pub fn config(&self) -> &ResponseConfig {
        &self.inner.config
    }

    /// Derives the canonical, category-prefixed key of a request payload.
    pub fn key_for(&self, payload: &Value) -> RequestKey {
        RequestKey::derive(payload, |fields| {
            self.inner
                .config
                .classify(fields)
                .map(|rule| rule.name.clone())
        })
    }

    /// TTL of the category `key` was classified into.
    pub fn ttl_for(&self, key: &RequestKey) -> Duration {
        self.inner.config.ttl_for(key.category())
    }

    /// Returns the value of `key` unless it is unknown or past its TTL plus
    /// the stale window. The latter is purged on the spot.
    pub fn get(&self, key: &str) -> Option<Cached<V>> {
        self.inner.get(key, self.inner.clock.now())
    }

    /// Stores `value` under `key` for `ttl`, or for the default TTL.
    pub fn set(&self, key: &str, value: V, ttl: Option<Duration>) {
        self.inner.set(key, value, ttl);
    }

    /// Removes `key`. Returns whether it was resident.
    pub fn delete(&self, key: &str) -> bool {
        self.inner.lock().entries.remove(key).is_some()
    }

    /// Removes every entry.
    pub fn clear(&self) {
        let mut store = self.inner.lock();
        store.entries.clear();
        store.recency.clear();
    }

    /// Current occupancy.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.inner.lock().entries.len(),
            max_entries: self.inner.config.max_entries,
        }
    }

    /// Whether a fetch for `key` is in flight.
    pub fn is_fetching(&self, key: &str) -> bool {
        self.inner.inflight.contains(key)
    }

    /// Error of the last failed fetch for a resident `key`, cleared when a
    /// new value is stored.
    pub fn last_error(&self, key: &str) -> Option<SharedError> {
        self.inner
            .lock()
            .entries
            .get(key)
            .and_then(|slot| slot.entry.error().cloned())
    }

    /// Returns the cached value of `key` or fetches it through `producer`.
    ///
    /// Concurrent misses for one key share a single call to `producer`,
    /// whose result is stored for `ttl` (default TTL if `None`). A stale hit
    /// is handled by the configured [`StalePolicy`]:
    ///
    /// - `Return` serves the stale value
    /// - `OffloadRevalidate` serves the stale value and refreshes in the background
    /// - `Revalidate` waits for the refresh; its error is returned while the
    ///   stale value stays readable through [`get`](Self::get)
    pub async fn get_or_fetch<F, Fut, E>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        producer: F,
    ) -> Result<Cached<V>, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<Box<dyn std::error::Error + Send + Sync>> + Send + 'static,
    {
        let hit = self.get(key);
        let fetch = match hit {
            Some(hit) if !hit.is_stale => return Ok(hit),
            Some(hit) => match self.inner.config.stale_policy {
                StalePolicy::Return => return Ok(hit),
                StalePolicy::OffloadRevalidate => {
                    drop(self.fetch(key, ttl, producer));
                    debug!(key, "Serving stale response, refreshing in background");
                    return Ok(hit);
                }
                StalePolicy::Revalidate => self.fetch(key, ttl, producer),
            },
            None => self.fetch(key, ttl, producer),
        };
        fetch.await.map(|value| Cached {
            value,
            is_stale: false,
        })
    }

    /// Derives the key and TTL of `payload`, then runs
    /// [`get_or_fetch`](Self::get_or_fetch).
    pub async fn get_or_fetch_request<F, Fut, E>(
        &self,
        payload: &Value,
        producer: F,
    ) -> Result<Cached<V>, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<Box<dyn std::error::Error + Send + Sync>> + Send + 'static,
    {
        let key = self.key_for(payload);
        let ttl = self.ttl_for(&key);
        self.get_or_fetch(key.as_str(), Some(ttl), producer).await
    }

    fn fetch<F, Fut, E>(&self, key: &str, ttl: Option<Duration>, producer: F) -> SharedFetch<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<Box<dyn std::error::Error + Send + Sync>> + Send + 'static,
    {
        if let Some(fetch) = self.inner.inflight.get(key) {
            debug!(key, "Joining in-flight upstream fetch");
            return fetch;
        }
        // Outside the registry's shard lock; dropped unpolled if another
        // caller registers first.
        let fetch = producer();
        let inner = Arc::clone(&self.inner);
        self.inner
            .inflight
            .check(key, move |ticket| {
                spawn_flight(
                    ticket,
                    "response",
                    async move { fetch.await.map_err(CacheError::upstream) },
                    move |ticket, outcome| {
                        match outcome {
                            Ok(value) => inner.set(ticket.key(), value.clone(), ttl),
                            Err(error) => {
                                inner.record_failure(ticket.key(), error.to_shared());
                                warn!(key = ticket.key(), %error, "Upstream fetch failed");
                                #[cfg(feature = "metrics")]
                                metrics::counter!(*FETCHES_FAILED, "cache" => "response")
                                    .increment(1);
                            }
                        }
                        inner.inflight.complete(ticket);
                    },
                )
            })
            .into_fetch()
    }
}

impl<V> Inner<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn lock(&self) -> MutexGuard<'_, Store<V>> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn get(&self, key: &str, now: DateTime<Utc>) -> Option<Cached<V>> {
        let grace = self.config.stale_window;
        let mut store = self.lock();
        let Some(slot) = store.entries.get(key) else {
            #[cfg(feature = "metrics")]
            metrics::counter!(*CACHE_MISS_COUNTER, "cache" => "response").increment(1);
            return None;
        };

        let freshness = slot.entry.freshness(now, grace);
        let value = match freshness {
            Freshness::Expired => None,
            _ => slot.entry.value().cloned(),
        };
        let Some(value) = value else {
            store.entries.remove(key);
            debug!(key, "Expired response purged on read");
            #[cfg(feature = "metrics")]
            metrics::counter!(*CACHE_MISS_COUNTER, "cache" => "response").increment(1);
            return None;
        };

        store.touch(key);
        store.compact_if_needed();
        #[cfg(feature = "metrics")]
        {
            let counter = if freshness.is_stale() {
                *CACHE_STALE_COUNTER
            } else {
                *CACHE_HIT_COUNTER
            };
            metrics::counter!(counter, "cache" => "response").increment(1);
        }
        Some(Cached {
            value,
            is_stale: freshness.is_stale(),
        })
    }

    fn set(&self, key: &str, value: V, ttl: Option<Duration>) {
        let now = self.clock.now();
        let policy = ExpiryPolicy::hard(ttl.unwrap_or(self.config.default_ttl));
        let entry = CacheEntry::new(Some(value), None, now, &policy);
        let key = SmolStr::new(key);

        let mut store = self.lock();
        if !store.entries.contains_key(&key) {
            while store.entries.len() >= self.config.max_entries {
                let Some(evicted) = store.evict_oldest() else {
                    break;
                };
                debug!(key = %evicted, "Evicted least recently used response");
                #[cfg(feature = "metrics")]
                metrics::counter!(*CACHE_EVICTIONS, "cache" => "response").increment(1);
            }
        }
        let tick = store.recency.touch(key.clone());
        store.entries.insert(key, Slot { entry, tick });
        store.compact_if_needed();
        drop(store);

        self.maybe_sweep(now);
    }

    fn record_failure(&self, key: &str, error: SharedError) {
        if let Some(slot) = self.lock().entries.get_mut(key) {
            slot.entry.fail(error);
        }
    }

    fn maybe_sweep(&self, now: DateTime<Utc>) {
        if !self.sweep.try_begin(now) {
            return;
        }
        let grace = self.config.stale_window;
        let mut store = self.lock();
        let before = store.entries.len();
        store
            .entries
            .retain(|_, slot| !slot.entry.is_expired(now, grace));
        let removed = before - store.entries.len();
        store.compact_if_needed();
        drop(store);
        debug!(removed, "Swept expired responses");
        #[cfg(feature = "metrics")]
        metrics::counter!(*CACHE_SWEPT, "cache" => "response").increment(removed as u64);
    }
}
