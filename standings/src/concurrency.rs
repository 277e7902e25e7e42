//! In-flight fetch registry.
//!
//! At most one upstream fetch per key runs at a time. The first caller for a
//! key spawns the producer as a tokio task and registers a shareable handle
//! to its result; everyone arriving while it runs awaits the same handle, so
//! all of them observe one outcome.
//!
//! ```text
//!  caller A --check--> Proceed(fetch) --spawn--> [ producer ] --done--> complete(ticket)
//!  caller B --check--> Await(fetch) ---------------^  same result
//! ```
//!
//! The producer runs detached from its callers. A caller that stops awaiting
//! does not cancel the fetch, and its result is still written back.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use smol_str::SmolStr;
use tracing::{Instrument, debug, info_span};

use crate::error::CacheError;

#[cfg(feature = "metrics")]
use crate::metrics::{FETCHES_DEDUPLICATED, FETCHES_STARTED};

/// A fetch result that any number of callers can await.
pub type SharedFetch<V> = Shared<BoxFuture<'static, Result<V, CacheError>>>;

/// Result of a concurrency check: whether this caller started the fetch or
/// joined one already in flight.
pub enum ConcurrencyDecision<V>
where
    V: Clone,
{
    /// The caller started a new fetch.
    Proceed(SharedFetch<V>),
    /// Await the fetch another caller started.
    Await(SharedFetch<V>),
}

impl<V: Clone> ConcurrencyDecision<V> {
    /// Whether this caller started the fetch.
    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Proceed(_))
    }

    /// The shared fetch, regardless of who started it.
    pub fn into_fetch(self) -> SharedFetch<V> {
        match self {
            Self::Proceed(fetch) | Self::Await(fetch) => fetch,
        }
    }
}

/// Identifies one registered fetch.
///
/// Completing with a stale ticket is a no-op, so a late finisher can never
/// unregister a newer fetch for the same key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlightTicket {
    key: SmolStr,
    id: u64,
}

impl FlightTicket {
    /// Key the fetch runs for.
    pub fn key(&self) -> &str {
        &self.key
    }
}

struct Flight<V: Clone> {
    id: u64,
    fetch: SharedFetch<V>,
}

/// Map from key to the single pending fetch for that key.
pub struct InFlightRegistry<V: Clone> {
    flights: DashMap<SmolStr, Flight<V>>,
    next_id: AtomicU64,
}

impl<V: Clone> std::fmt::Debug for InFlightRegistry<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InFlightRegistry")
            .field("in_flight", &self.flights.len())
            .finish()
    }
}

impl<V: Clone> Default for InFlightRegistry<V> {
    fn default() -> Self {
        Self {
            flights: DashMap::new(),
            next_id: AtomicU64::new(0),
        }
    }
}

impl<V> InFlightRegistry<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The fetch in flight for `key`, if any.
    pub fn get(&self, key: &str) -> Option<SharedFetch<V>> {
        self.flights.get(key).map(|flight| flight.fetch.clone())
    }

    /// Whether a fetch for `key` is in flight.
    pub fn contains(&self, key: &str) -> bool {
        self.flights.contains_key(key)
    }

    /// Number of fetches in flight.
    pub fn len(&self) -> usize {
        self.flights.len()
    }

    /// Whether no fetch is in flight.
    pub fn is_empty(&self) -> bool {
        self.flights.is_empty()
    }

    /// Joins the fetch in flight for `key`, or registers the one returned by
    /// `start`.
    ///
    /// The check and the registration are atomic: two racing callers never
    /// both receive [`ConcurrencyDecision::Proceed`]. `start` runs while the
    /// key's shard is locked and must not touch this registry.
    pub fn check<F>(&self, key: &str, start: F) -> ConcurrencyDecision<V>
    where
        F: FnOnce(FlightTicket) -> BoxFuture<'static, Result<V, CacheError>>,
    {
        match self.flights.entry(SmolStr::new(key)) {
            Entry::Occupied(entry) => {
                debug!(key, "Fetch deduplicated - already in flight");
                #[cfg(feature = "metrics")]
                metrics::counter!(*FETCHES_DEDUPLICATED).increment(1);
                ConcurrencyDecision::Await(entry.get().fetch.clone())
            }
            Entry::Vacant(entry) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let ticket = FlightTicket {
                    key: entry.key().clone(),
                    id,
                };
                let fetch = start(ticket).shared();
                entry.insert(Flight {
                    id,
                    fetch: fetch.clone(),
                });
                #[cfg(feature = "metrics")]
                metrics::counter!(*FETCHES_STARTED).increment(1);
                ConcurrencyDecision::Proceed(fetch)
            }
        }
    }

    /// Unregisters the fetch identified by `ticket`.
    ///
    /// Returns `false` if a different fetch now owns the key.
    pub fn complete(&self, ticket: &FlightTicket) -> bool {
        self.flights
            .remove_if(&ticket.key, |_, flight| flight.id == ticket.id)
            .is_some()
    }
}

/// Runs `done` exactly once: with the fetch outcome, or with
/// [`CacheError::Abandoned`] if the task unwinds or is dropped first.
struct Completion<V, D>
where
    D: FnOnce(&FlightTicket, Result<&V, &CacheError>),
{
    ticket: FlightTicket,
    done: Option<D>,
    _value: PhantomData<fn(&V)>,
}

impl<V, D> Completion<V, D>
where
    D: FnOnce(&FlightTicket, Result<&V, &CacheError>),
{
    fn finish(mut self, outcome: &Result<V, CacheError>) {
        if let Some(done) = self.done.take() {
            done(&self.ticket, outcome.as_ref());
        }
    }
}

impl<V, D> Drop for Completion<V, D>
where
    D: FnOnce(&FlightTicket, Result<&V, &CacheError>),
{
    fn drop(&mut self) {
        if let Some(done) = self.done.take() {
            let abandoned = CacheError::Abandoned {
                key: self.ticket.key.clone(),
            };
            done(&self.ticket, Err(&abandoned));
        }
    }
}

/// Spawns `fetch` as a tokio task and returns a future of its result.
///
/// `done` runs inside the task once the fetch settles and before any waiter
/// is woken, so stores can write the result back and unregister the flight
/// while every caller is still pending.
pub(crate) fn spawn_flight<V, Fut, D>(
    ticket: FlightTicket,
    kind: &'static str,
    fetch: Fut,
    done: D,
) -> BoxFuture<'static, Result<V, CacheError>>
where
    V: Send + Sync + 'static,
    Fut: Future<Output = Result<V, CacheError>> + Send + 'static,
    D: FnOnce(&FlightTicket, Result<&V, &CacheError>) + Send + 'static,
{
    let key = ticket.key.clone();
    let span = info_span!("upstream_fetch", kind, key = %key, flight = ticket.id);
    let completion = Completion {
        ticket,
        done: Some(done),
        _value: PhantomData,
    };

    let handle = tokio::spawn(
        async move {
            let outcome = fetch.await;
            completion.finish(&outcome);
            outcome
        }
        .instrument(span),
    );

    async move {
        handle
            .await
            .unwrap_or_else(|_| Err(CacheError::Abandoned { key }))
    }
    .boxed()
}
