use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use smol_str::SmolStr;
use standings_core::{
    CacheEntry, Clock, ExpiryPolicy, Freshness, SharedClock, SweepThrottle, system_clock,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{Instrument, debug, info_span, warn};

use super::subscription::{CacheEvent, EventKind, Subscribers, Subscription};
use crate::concurrency::{FlightTicket, InFlightRegistry, SharedFetch, spawn_flight};
use crate::config::RevalidatingConfig;
use crate::error::{CacheError, SharedError};
use crate::signal::{EnvironmentSignal, SignalGuard, SignalReceiver};

#[cfg(feature = "metrics")]
use crate::metrics::{
    CACHE_HIT_COUNTER, CACHE_MISS_COUNTER, CACHE_STALE_COUNTER, CACHE_SWEPT, FETCHES_FAILED,
};

/// Result of [`RevalidatingCache::read`].
#[derive(Debug, Clone)]
pub struct Snapshot<V> {
    /// Last successfully fetched value. `None` while the first fetch for the
    /// key is pending or after it failed.
    pub value: Option<V>,
    /// Error of the last failed refresh, cleared by the next successful one.
    pub error: Option<SharedError>,
    /// The value is past `stale_after` and should be revalidated.
    pub is_stale: bool,
    /// A refresh for the key is in flight.
    pub is_refreshing: bool,
}

impl<V: Clone> Snapshot<V> {
    fn of(entry: &CacheEntry<V, SharedError>, freshness: Freshness) -> Self {
        Self {
            value: entry.value().cloned(),
            error: entry.error().cloned(),
            is_stale: freshness.is_stale(),
            is_refreshing: entry.is_refreshing(),
        }
    }
}

/// What `fetch_or_join` learned from the entry before deciding.
struct Observed<V> {
    freshness: Freshness,
    recent_attempt: bool,
    value: Option<V>,
    error: Option<SharedError>,
}

enum Plan<V: Clone> {
    Ready(Result<V, CacheError>),
    Join(SharedFetch<V>),
}

struct Inner<V: Clone> {
    config: RevalidatingConfig,
    policy: ExpiryPolicy,
    clock: SharedClock,
    entries: DashMap<SmolStr, CacheEntry<V, SharedError>>,
    inflight: InFlightRegistry<V>,
    subscribers: Arc<Subscribers>,
    sweep: SweepThrottle,
    signals: Mutex<Option<SignalGuard>>,
}

/// Client-facing stale-while-revalidate cache.
///
/// Reads never block and never return a "loading" state for a key that has
/// a known value: a stale value is served as-is while at most one refresh
/// per key runs in the background. A failed refresh keeps the last good
/// value and records the error next to it.
///
/// The handle is cheap to clone; clones share the same entries.
///
/// ```
/// use standings::{RevalidatingCache, config::RevalidatingConfig};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let cache: RevalidatingCache<u32> = RevalidatingCache::new(RevalidatingConfig::default());
///
/// let value = cache
///     .fetch_or_join("leaderboard:top", || async { Ok::<_, std::io::Error>(42) })
///     .await
///     .unwrap();
/// assert_eq!(value, 42);
/// assert_eq!(cache.read("leaderboard:top").unwrap().value, Some(42));
/// # }
/// ```
pub struct RevalidatingCache<V: Clone> {
    inner: Arc<Inner<V>>,
}

impl<V: Clone> Clone for RevalidatingCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: Clone> fmt::Debug for RevalidatingCache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RevalidatingCache")
            .field("config", &self.inner.config)
            .field("entries", &self.inner.entries.len())
            .field("inflight", &self.inner.inflight)
            .finish()
    }
}

impl<V> RevalidatingCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Creates a cache using the system clock and no environment signals.
    pub fn new(config: RevalidatingConfig) -> Self {
        Self::builder().config(config).build()
    }

    /// Creates a builder with default configuration.
    pub fn builder() -> RevalidatingCacheBuilder<V> {
        RevalidatingCacheBuilder::default()
    }

    /// The active configuration.
    pub fn config(&self) -> &RevalidatingConfig {
        &self.inner.config
    }

    /// Returns the entry for `key` without triggering any fetch.
    ///
    /// Returns `None` if the key is unknown or older than `cache_time`; the
    /// latter is purged on the spot.
    pub fn read(&self, key: &str) -> Option<Snapshot<V>> {
        let now = self.inner.clock.now();
        match self.inner.entries.get(key) {
            None => {
                #[cfg(feature = "metrics")]
                metrics::counter!(*CACHE_MISS_COUNTER, "cache" => "revalidating").increment(1);
                return None;
            }
            Some(entry) => {
                let freshness = entry.freshness(now, Duration::ZERO);
                if !freshness.is_expired() {
                    #[cfg(feature = "metrics")]
                    record_read(freshness);
                    return Some(Snapshot::of(&entry, freshness));
                }
            }
        }
        self.inner.purge_expired(key, now);
        #[cfg(feature = "metrics")]
        metrics::counter!(*CACHE_MISS_COUNTER, "cache" => "revalidating").increment(1);
        None
    }

    /// Replaces value and error of `key` and restarts its lifecycle.
    ///
    /// An in-flight refresh is not affected and will overwrite this value
    /// when it completes.
    pub fn write(&self, key: &str, value: Option<V>, error: Option<SharedError>) {
        let now = self.inner.clock.now();
        self.inner.store(key, value, error, now);
        self.inner.subscribers.notify(key, EventKind::Written);
        self.inner.maybe_sweep(now);
    }

    /// Returns the cached value of `key`, or the result of a single shared
    /// fetch through `producer`.
    ///
    /// - a fetch started within `dedupe_window` that is still in flight is joined
    /// - a fresh value is returned without calling `producer`
    /// - any other in-flight fetch is joined
    /// - a key attempted within `dedupe_window` gets its last outcome back
    /// - otherwise `producer` is started
    ///
    /// A failed fetch leaves the previous value in place, records the error
    /// and is returned to every caller awaiting it. `producer` is called at
    /// most once, synchronously and outside every lock. If another caller
    /// registers a fetch for the key first, the returned future is dropped
    /// without being polled and that fetch is joined instead.
    pub async fn fetch_or_join<F, Fut, E>(&self, key: &str, producer: F) -> Result<V, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<Box<dyn std::error::Error + Send + Sync>> + Send + 'static,
    {
        match self.plan(key, producer) {
            Plan::Ready(result) => result,
            Plan::Join(fetch) => fetch.await,
        }
    }

    fn plan<F, Fut, E>(&self, key: &str, producer: F) -> Plan<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<Box<dyn std::error::Error + Send + Sync>> + Send + 'static,
    {
        let now = self.inner.clock.now();
        let window = self.inner.config.dedupe_window;
        let observed = self.inner.entries.get(key).map(|entry| Observed {
            freshness: entry.freshness(now, Duration::ZERO),
            recent_attempt: entry.attempted_within(now, window),
            value: CacheEntry::value(&entry).cloned(),
            error: CacheEntry::error(&entry).cloned(),
        });
        let in_flight = self.inner.inflight.get(key);

        if let Some(observed) = &observed {
            if let (Some(fetch), true) = (&in_flight, observed.recent_attempt) {
                debug!(key, "Joining refresh started within dedupe window");
                return Plan::Join(fetch.clone());
            }
            if let (Freshness::Fresh, Some(value)) = (observed.freshness, &observed.value) {
                #[cfg(feature = "metrics")]
                metrics::counter!(*CACHE_HIT_COUNTER, "cache" => "revalidating").increment(1);
                return Plan::Ready(Ok(value.clone()));
            }
        }

        if let Some(fetch) = in_flight {
            debug!(key, "Joining in-flight refresh");
            return Plan::Join(fetch);
        }

        if let Some(observed) = observed {
            if observed.recent_attempt && !observed.freshness.is_expired() {
                match (observed.value, observed.error) {
                    (Some(value), _) => {
                        debug!(key, "Refresh attempted within dedupe window, serving last value");
                        return Plan::Ready(Ok(value));
                    }
                    (None, Some(error)) => return Plan::Ready(Err(CacheError::Upstream(error))),
                    (None, None) => {}
                }
            }
        }

        Plan::Join(self.start(key, now, producer))
    }

    fn start<F, Fut, E>(&self, key: &str, now: DateTime<Utc>, producer: F) -> SharedFetch<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<Box<dyn std::error::Error + Send + Sync>> + Send + 'static,
    {
        // Outside the registry's shard lock; dropped unpolled if another
        // caller registers first.
        let fetch = producer();
        let inner = &self.inner;
        let finisher = Arc::clone(&self.inner);
        inner
            .inflight
            .check(key, move |ticket| {
                inner.begin_refresh(ticket.key(), now);
                spawn_flight(
                    ticket,
                    "revalidate",
                    async move { fetch.await.map_err(CacheError::upstream) },
                    move |ticket, outcome| finisher.finish(ticket, outcome),
                )
            })
            .into_fetch()
    }

    /// Removes `key` and notifies its subscribers. Returns whether it existed.
    pub fn invalidate(&self, key: &str) -> bool {
        let removed = self.inner.entries.remove(key).is_some();
        if removed {
            debug!(key, "Entry invalidated");
            self.inner.subscribers.notify(key, EventKind::Invalidated);
        }
        removed
    }

    /// Removes every key matching `predicate` and notifies their subscribers.
    ///
    /// Returns the number of removed entries.
    pub fn invalidate_by_pattern<P>(&self, predicate: P) -> usize
    where
        P: Fn(&str) -> bool,
    {
        let keys: Vec<SmolStr> = self
            .inner
            .entries
            .iter()
            .filter(|entry| predicate(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        keys.iter().filter(|key| self.invalidate(key)).count()
    }

    /// Removes every entry. Returns the number of removed entries.
    pub fn clear(&self) -> usize {
        self.invalidate_by_pattern(|_| true)
    }

    /// Calls `listener` on every write, failed refresh, invalidation or
    /// revalidation signal affecting `key`.
    ///
    /// Listeners run synchronously on the thread that caused the event, after
    /// the cache has released its locks.
    pub fn subscribe<L>(&self, key: &str, listener: L) -> Subscription
    where
        L: Fn(&CacheEvent) + Send + Sync + 'static,
    {
        self.inner.subscribers.add(key, Arc::new(listener))
    }

    /// Marks every entry stale and emits [`EventKind::Revalidate`] for it.
    ///
    /// Returns the number of affected entries.
    pub fn revalidate_all(&self) -> usize {
        self.inner.revalidate_all()
    }

    /// Starts listening for environment signals on `signals`, replacing any
    /// previous listener.
    ///
    /// Returns `false`, and ignores the signals, when called outside a tokio
    /// runtime.
    pub fn attach_signals(&self, mut signals: SignalReceiver) -> bool {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No tokio runtime, environment signals are ignored");
            return false;
        };
        let weak = Arc::downgrade(&self.inner);
        let handle = runtime.spawn(
            async move {
                loop {
                    let signal = match signals.recv().await {
                        Ok(signal) => Some(signal),
                        Err(RecvError::Lagged(skipped)) => {
                            debug!(skipped, "Signal listener lagged");
                            None
                        }
                        Err(RecvError::Closed) => break,
                    };
                    let Some(inner) = weak.upgrade() else {
                        break;
                    };
                    if signal.is_none_or(|signal| inner.reacts_to(signal)) {
                        let marked = inner.revalidate_all();
                        debug!(?signal, marked, "Entries marked stale");
                    }
                }
                debug!("Signal listener stopped");
            }
            .instrument(info_span!("signal_listener")),
        );

        let previous = self
            .inner
            .signals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(SignalGuard::new(handle));
        drop(previous);
        true
    }

    /// Detaches environment signals and drops every subscription.
    ///
    /// Entries stay readable; in-flight fetches still complete.
    pub fn shutdown(&self) {
        let guard = self
            .inner
            .signals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(guard);
        self.inner.subscribers.clear();
        debug!("Revalidating cache shut down");
    }

    /// Number of resident entries, including pending and expired ones not
    /// yet purged.
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    /// Whether no entries are resident.
    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Whether a fetch for `key` is in flight.
    pub fn is_fetching(&self, key: &str) -> bool {
        self.inner.inflight.contains(key)
    }
}

#[cfg(feature = "metrics")]
fn record_read(freshness: Freshness) {
    match freshness {
        Freshness::Fresh => {
            metrics::counter!(*CACHE_HIT_COUNTER, "cache" => "revalidating").increment(1)
        }
        Freshness::Stale => {
            metrics::counter!(*CACHE_STALE_COUNTER, "cache" => "revalidating").increment(1)
        }
        Freshness::Expired => {
            metrics::counter!(*CACHE_MISS_COUNTER, "cache" => "revalidating").increment(1)
        }
    }
}

impl<V> Inner<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn store(&self, key: &str, value: Option<V>, error: Option<SharedError>, now: DateTime<Utc>) {
        match self.entries.entry(SmolStr::new(key)) {
            Entry::Occupied(mut entry) => entry.get_mut().replace(value, error, now, &self.policy),
            Entry::Vacant(entry) => {
                entry.insert(CacheEntry::new(value, error, now, &self.policy));
            }
        }
    }

    fn begin_refresh(&self, key: &str, now: DateTime<Utc>) {
        let mut entry = self
            .entries
            .entry(SmolStr::new(key))
            .or_insert_with(|| CacheEntry::pending(now, &self.policy));
        if entry.is_expired(now, Duration::ZERO) {
            *entry = CacheEntry::pending(now, &self.policy);
        }
        entry.begin_refresh(now);
    }

    fn finish(&self, ticket: &FlightTicket, outcome: Result<&V, &CacheError>) {
        let key = ticket.key();
        let now = self.clock.now();
        let kind = match outcome {
            Ok(value) => {
                match self.entries.entry(SmolStr::new(key)) {
                    Entry::Occupied(mut entry) => {
                        let entry = entry.get_mut();
                        entry.replace(Some(value.clone()), None, now, &self.policy);
                        entry.end_refresh();
                    }
                    Entry::Vacant(entry) => {
                        entry.insert(CacheEntry::new(Some(value.clone()), None, now, &self.policy));
                    }
                }
                debug!(key, "Refresh stored");
                EventKind::Written
            }
            Err(error) => {
                if let Some(mut entry) = self.entries.get_mut(key) {
                    entry.fail(error.to_shared());
                    entry.end_refresh();
                }
                warn!(key, %error, "Refresh failed, keeping last known value");
                #[cfg(feature = "metrics")]
                metrics::counter!(*FETCHES_FAILED, "cache" => "revalidating").increment(1);
                EventKind::Failed
            }
        };
        self.inflight.complete(ticket);
        self.subscribers.notify(key, kind);
        self.maybe_sweep(now);
    }

    fn purge_expired(&self, key: &str, now: DateTime<Utc>) {
        let removed = self
            .entries
            .remove_if(key, |_, entry| {
                !entry.is_refreshing() && entry.is_expired(now, Duration::ZERO)
            })
            .is_some();
        if removed {
            debug!(key, "Expired entry purged on read");
        }
    }

    fn maybe_sweep(&self, now: DateTime<Utc>) {
        if !self.sweep.try_begin(now) {
            return;
        }
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| entry.is_refreshing() || !entry.is_expired(now, Duration::ZERO));
        let removed = before.saturating_sub(self.entries.len());
        debug!(removed, "Swept expired entries");
        #[cfg(feature = "metrics")]
        metrics::counter!(*CACHE_SWEPT, "cache" => "revalidating").increment(removed as u64);
    }

    fn reacts_to(&self, signal: EnvironmentSignal) -> bool {
        match signal {
            EnvironmentSignal::Focus => self.config.revalidate_on_focus,
            EnvironmentSignal::Reconnect => self.config.revalidate_on_reconnect,
        }
    }

    fn revalidate_all(&self) -> usize {
        let now = self.clock.now();
        let mut keys = Vec::new();
        for mut entry in self.entries.iter_mut() {
            entry.mark_stale(now);
            keys.push(entry.key().clone());
        }
        for key in &keys {
            self.subscribers.notify(key, EventKind::Revalidate);
        }
        keys.len()
    }
}

/// Builder for [`RevalidatingCache`].
pub struct RevalidatingCacheBuilder<V> {
    config: RevalidatingConfig,
    clock: Option<SharedClock>,
    signals: Option<SignalReceiver>,
    _value: PhantomData<fn() -> V>,
}

impl<V> Default for RevalidatingCacheBuilder<V> {
    fn default() -> Self {
        Self {
            config: RevalidatingConfig::default(),
            clock: None,
            signals: None,
            _value: PhantomData,
        }
    }
}

impl<V> fmt::Debug for RevalidatingCacheBuilder<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RevalidatingCacheBuilder")
            .field("config", &self.config)
            .field("clock", &self.clock)
            .field("signals", &self.signals.is_some())
            .finish()
    }
}

impl<V> RevalidatingCacheBuilder<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Set the configuration.
    pub fn config(mut self, config: RevalidatingConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the time source.
    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    /// Revalidate on signals received from `signals`.
    pub fn signals(mut self, signals: SignalReceiver) -> Self {
        self.signals = Some(signals);
        self
    }

    /// Build the cache.
    pub fn build(self) -> RevalidatingCache<V> {
        let clock = self.clock.unwrap_or_else(system_clock);
        let now = clock.now();
        let config = self.config;
        let cache = RevalidatingCache {
            inner: Arc::new(Inner {
                policy: ExpiryPolicy::new(config.stale_after, config.cache_time),
                sweep: SweepThrottle::new(config.sweep_interval, now),
                config,
                clock,
                entries: DashMap::new(),
                inflight: InFlightRegistry::new(),
                subscribers: Arc::new(Subscribers::default()),
                signals: Mutex::new(None),
            }),
        };
        if let Some(signals) = self.signals {
            cache.attach_signals(signals);
        }
        cache
    }
}
