//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use standings_backend::{BackendError, BackendResult, DurableStore, Raw};
use tracing::field::{Field, Visit};
use tracing::subscriber::DefaultGuard;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::{Context, SubscriberExt};

/// Lets spawned background tasks run to completion on a current-thread runtime.
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

/// In-memory durable store that records every write.
#[derive(Debug, Default)]
pub struct MemStore {
    values: Mutex<HashMap<String, (Raw, Duration)>>,
    puts: AtomicUsize,
}

impl MemStore {
    pub fn value(&self, key: &str) -> Option<String> {
        self.values
            .lock()
            .unwrap()
            .get(key)
            .map(|(raw, _)| String::from_utf8_lossy(raw).into_owned())
    }

    pub fn ttl(&self, key: &str) -> Option<Duration> {
        self.values.lock().unwrap().get(key).map(|(_, ttl)| *ttl)
    }

    pub fn insert(&self, key: &str, value: &'static str) {
        self.values.lock().unwrap().insert(
            key.to_owned(),
            (Bytes::from_static(value.as_bytes()), Duration::from_secs(60)),
        );
    }

    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DurableStore for MemStore {
    async fn get(&self, key: &str) -> BackendResult<Option<Raw>> {
        Ok(self
            .values
            .lock()
            .unwrap()
            .get(key)
            .map(|(raw, _)| raw.clone()))
    }

    async fn put(&self, key: &str, value: Raw, ttl: Duration) -> BackendResult<()> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.values
            .lock()
            .unwrap()
            .insert(key.to_owned(), (value, ttl));
        Ok(())
    }

    fn name(&self) -> &str {
        "mem"
    }
}

/// Durable store whose every operation fails with a connection error.
#[derive(Debug, Default)]
pub struct DownStore {
    calls: AtomicUsize,
}

impl DownStore {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DurableStore for DownStore {
    async fn get(&self, _key: &str) -> BackendResult<Option<Raw>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(BackendError::ConnectionError("connection refused".into()))
    }

    async fn put(&self, _key: &str, _value: Raw, _ttl: Duration) -> BackendResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(BackendError::ConnectionError("connection refused".into()))
    }

    fn name(&self) -> &str {
        "down"
    }
}

/// A log event captured during a test.
#[derive(Debug, Clone)]
pub struct CapturedEvent {
    pub level: Level,
    pub message: String,
}

/// Tracing layer that records every event's level and message.
#[derive(Clone, Default)]
pub struct EventCapture {
    events: Arc<Mutex<Vec<CapturedEvent>>>,
}

impl EventCapture {
    /// Installs the layer as the thread's default subscriber.
    pub fn install() -> (Self, DefaultGuard) {
        let capture = Self::default();
        let subscriber = tracing_subscriber::registry().with(capture.clone());
        let guard = tracing::subscriber::set_default(subscriber);
        (capture, guard)
    }

    pub fn warnings(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|event| event.level == Level::WARN)
            .map(|event| event.message.clone())
            .collect()
    }
}

struct MessageVisitor(String);

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{value:?}");
        }
    }
}

impl<S: Subscriber> Layer<S> for EventCapture {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor(String::new());
        event.record(&mut visitor);
        self.events.lock().unwrap().push(CapturedEvent {
            level: *event.metadata().level(),
            message: visitor.0,
        });
    }
}
