use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use smol_str::SmolStr;

/// What happened to a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A new value or error was written.
    Written,
    /// A refresh failed; the previous value is kept.
    Failed,
    /// The entry was removed by `invalidate`, `invalidate_by_pattern` or `clear`.
    Invalidated,
    /// An environment signal marked the entry stale; dependents should refetch.
    Revalidate,
}

/// Notification delivered to subscribers of a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEvent {
    /// The affected key.
    pub key: SmolStr,
    /// What happened.
    pub kind: EventKind,
}

type Listener = Arc<dyn Fn(&CacheEvent) + Send + Sync>;

#[derive(Default)]
pub(crate) struct Subscribers {
    next_id: AtomicU64,
    listeners: DashMap<SmolStr, Vec<(u64, Listener)>>,
}

impl fmt::Debug for Subscribers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscribers")
            .field("keys", &self.listeners.len())
            .finish()
    }
}

impl Subscribers {
    pub(crate) fn add(self: &Arc<Self>, key: &str, listener: Listener) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let key = SmolStr::new(key);
        self.listeners
            .entry(key.clone())
            .or_default()
            .push((id, listener));
        Subscription {
            subscribers: Arc::downgrade(self),
            key,
            id,
        }
    }

    fn remove(&self, key: &str, id: u64) {
        if let Some(mut listeners) = self.listeners.get_mut(key) {
            listeners.retain(|(listener_id, _)| *listener_id != id);
        }
        self.listeners.remove_if(key, |_, listeners| listeners.is_empty());
    }

    /// Calls every listener of `key`. Listeners run outside the map lock and
    /// may freely read or write the cache.
    pub(crate) fn notify(&self, key: &str, kind: EventKind) {
        let listeners: Vec<Listener> = match self.listeners.get(key) {
            Some(listeners) => listeners.iter().map(|(_, l)| Arc::clone(l)).collect(),
            None => return,
        };
        let event = CacheEvent {
            key: SmolStr::new(key),
            kind,
        };
        for listener in listeners {
            listener(&event);
        }
    }

    pub(crate) fn clear(&self) {
        self.listeners.clear();
    }
}

/// Handle returned by [`RevalidatingCache::subscribe`](crate::RevalidatingCache::subscribe).
///
/// The listener stays registered until the handle is dropped or
/// [`Subscription::unsubscribe`] is called.
#[must_use = "dropping a Subscription unsubscribes its listener"]
pub struct Subscription {
    subscribers: Weak<Subscribers>,
    key: SmolStr,
    id: u64,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("id", &self.id)
            .finish()
    }
}

impl Subscription {
    /// The subscribed key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Removes the listener.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(subscribers) = self.subscribers.upgrade() {
            subscribers.remove(&self.key, self.id);
        }
    }
}
