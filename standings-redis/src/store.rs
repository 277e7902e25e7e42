//! Redis store implementation.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use redis::{Client, aio::ConnectionManager};
use smol_str::SmolStr;
use standings_backend::{BackendError, BackendResult, DurableStore, Raw};
use tokio::sync::OnceCell;
use tracing::trace;

use crate::error::Error;

/// Redis durable store based on redis-rs crate.
///
/// Uses a lazily created [`ConnectionManager`], so building the store never
/// touches the network and an unreachable server only surfaces as an error
/// from [`DurableStore::get`] / [`DurableStore::put`].
///
/// [`ConnectionManager`]: redis::aio::ConnectionManager
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    connection: OnceCell<ConnectionManager>,
    key_prefix: Option<SmolStr>,
    label: SmolStr,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("label", &self.label)
            .field("key_prefix", &self.key_prefix)
            .field("connected", &self.connection.initialized())
            .finish()
    }
}

impl RedisStore {
    /// Create new store instance with default settings (`redis://127.0.0.1/`).
    pub fn new() -> Result<Self, BackendError> {
        Ok(Self::builder().build()?)
    }

    /// Creates new RedisStore builder with default settings.
    #[must_use]
    pub fn builder() -> RedisStoreBuilder {
        RedisStoreBuilder::default()
    }

    /// Create lazy connection to redis via [`ConnectionManager`]
    pub async fn connection(&self) -> Result<&ConnectionManager, BackendError> {
        trace!("Get connection manager");
        let manager = self
            .connection
            .get_or_try_init(|| {
                trace!("Initialize new redis connection manager");
                self.client.get_connection_manager()
            })
            .await
            .map_err(Error::from)?;
        Ok(manager)
    }

    fn full_key(&self, key: &str) -> String {
        match &self.key_prefix {
            Some(prefix) => format!("{prefix}:{key}"),
            None => key.to_owned(),
        }
    }
}

/// Part of builder pattern implementation for RedisStore.
pub struct RedisStoreBuilder {
    connection_info: String,
    key_prefix: Option<SmolStr>,
    label: SmolStr,
}

impl Default for RedisStoreBuilder {
    fn default() -> Self {
        Self {
            connection_info: "redis://127.0.0.1/".to_owned(),
            key_prefix: None,
            label: SmolStr::new_static("redis"),
        }
    }
}

impl RedisStoreBuilder {
    /// Set connection info (host, port, database, etc.) for RedisStore.
    pub fn server(mut self, connection_info: impl Into<String>) -> Self {
        self.connection_info = connection_info.into();
        self
    }

    /// Namespace every key written by this store as `{prefix}:{key}`.
    pub fn key_prefix(mut self, prefix: impl Into<SmolStr>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    /// Set a custom name for this store, used in logs and metrics.
    pub fn label(mut self, label: impl Into<SmolStr>) -> Self {
        self.label = label.into();
        self
    }

    /// Create new instance of Redis store with passed settings.
    pub fn build(self) -> Result<RedisStore, Error> {
        Ok(RedisStore {
            client: Client::open(self.connection_info)?,
            connection: OnceCell::new(),
            key_prefix: self.key_prefix,
            label: self.label,
        })
    }
}

#[async_trait]
impl DurableStore for RedisStore {
    async fn get(&self, key: &str) -> BackendResult<Option<Raw>> {
        let mut con = self.connection().await?.clone();
        let data: Option<Vec<u8>> = redis::cmd("GET")
            .arg(self.full_key(key))
            .query_async(&mut con)
            .await
            .map_err(Error::from)?;
        Ok(data.map(Bytes::from))
    }

    async fn put(&self, key: &str, value: Raw, ttl: Duration) -> BackendResult<()> {
        let mut con = self.connection().await?.clone();
        // PX of zero is rejected by Redis.
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        redis::cmd("SET")
            .arg(self.full_key(key))
            .arg(value.as_ref())
            .arg("PX")
            .arg(ttl_ms)
            .query_async::<()>(&mut con)
            .await
            .map_err(Error::from)?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.label
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_prefixed() {
        let store = RedisStore::builder().key_prefix("standings").build().unwrap();
        assert_eq!(store.full_key("ratelimit:a:0"), "standings:ratelimit:a:0");

        let store = RedisStore::builder().build().unwrap();
        assert_eq!(store.full_key("ratelimit:a:0"), "ratelimit:a:0");
    }

    #[test]
    fn invalid_url_is_rejected() {
        assert!(RedisStore::builder().server("not-a-valid-url").build().is_err());
    }

    #[test]
    fn label_defaults_to_redis() {
        let store = RedisStore::builder().build().unwrap();
        assert_eq!(store.name(), "redis");
        let store = RedisStore::builder().label("limits").build().unwrap();
        assert_eq!(store.name(), "limits");
    }
}
