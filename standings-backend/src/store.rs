use std::{sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::{BackendError, Raw};

pub type BackendResult<T> = Result<T, BackendError>;

/// A durable key-value store with per-key expiry.
///
/// Visibility of writes is best-effort and eventually consistent; callers
/// must tolerate reading a slightly older value than the one last written.
#[async_trait]
pub trait DurableStore: Sync + Send {
    async fn get(&self, key: &str) -> BackendResult<Option<Raw>>;

    async fn put(&self, key: &str, value: Raw, ttl: Duration) -> BackendResult<()>;

    /// Returns the name of this store, used in logs and metrics labels.
    fn name(&self) -> &str {
        "store"
    }
}

#[async_trait]
impl DurableStore for &dyn DurableStore {
    async fn get(&self, key: &str) -> BackendResult<Option<Raw>> {
        (*self).get(key).await
    }

    async fn put(&self, key: &str, value: Raw, ttl: Duration) -> BackendResult<()> {
        (*self).put(key, value, ttl).await
    }

    fn name(&self) -> &str {
        (*self).name()
    }
}

#[async_trait]
impl DurableStore for Box<dyn DurableStore> {
    async fn get(&self, key: &str) -> BackendResult<Option<Raw>> {
        (**self).get(key).await
    }

    async fn put(&self, key: &str, value: Raw, ttl: Duration) -> BackendResult<()> {
        (**self).put(key, value, ttl).await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

#[async_trait]
impl DurableStore for Arc<dyn DurableStore + Send + 'static> {
    async fn get(&self, key: &str) -> BackendResult<Option<Raw>> {
        (**self).get(key).await
    }

    async fn put(&self, key: &str, value: Raw, ttl: Duration) -> BackendResult<()> {
        (**self).put(key, value, ttl).await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}
