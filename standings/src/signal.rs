//! Environmental revalidation triggers.
//!
//! The host application (a UI shell, a connectivity watcher) publishes
//! [`EnvironmentSignal`]s on a broadcast channel. A
//! [`RevalidatingCache`](crate::RevalidatingCache) subscribes at construction
//! and holds a [`SignalGuard`] for its listener task; the guard aborts the
//! task when the cache shuts down or is dropped.

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// An external event that makes cached data worth revalidating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvironmentSignal {
    /// The application regained focus.
    Focus,
    /// Network connectivity was restored.
    Reconnect,
}

/// Sending half of a signal channel.
pub type SignalSender = broadcast::Sender<EnvironmentSignal>;

/// Receiving half of a signal channel.
pub type SignalReceiver = broadcast::Receiver<EnvironmentSignal>;

/// Creates a signal channel buffering up to `capacity` undelivered signals.
///
/// Listeners that fall behind skip the missed signals and treat the gap as
/// a revalidation trigger of its own.
pub fn signal_channel(capacity: usize) -> (SignalSender, SignalReceiver) {
    broadcast::channel(capacity.max(1))
}

/// Owns a signal listener task and aborts it on drop.
#[derive(Debug)]
pub struct SignalGuard {
    handle: JoinHandle<()>,
}

impl SignalGuard {
    pub(crate) fn new(handle: JoinHandle<()>) -> Self {
        Self { handle }
    }

    /// Check if the listener has stopped.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
