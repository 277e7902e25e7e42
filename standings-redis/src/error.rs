//! Error types for Redis store operations.
//!
//! All errors can be converted to [`BackendError`] for uniform handling by
//! the rate limiter, which treats any of them as "store unavailable" and
//! degrades to its in-memory fallback.
//!
//! [`BackendError`]: standings_backend::BackendError

use redis::RedisError;
use standings_backend::BackendError;

/// Error type for Redis store operations.
///
/// You typically don't handle this error directly. It appears when:
///
/// - Calling [`RedisStoreBuilder::build`] with an invalid connection URL
/// - Performing the first store operation when Redis is unreachable
///   (the connection is established lazily)
/// - Performing store operations when the Redis server returns an error
///
/// [`RedisStoreBuilder::build`]: crate::RedisStoreBuilder::build
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An error from the underlying Redis client.
    #[error("Redis store error: {0}")]
    Redis(#[from] RedisError),
}

impl Error {
    /// Whether the error comes from the network rather than from Redis itself.
    pub fn is_connection(&self) -> bool {
        match self {
            Self::Redis(err) => {
                err.is_io_error()
                    || err.is_connection_refusal()
                    || err.is_connection_dropped()
                    || err.is_timeout()
            }
        }
    }
}

impl From<Error> for BackendError {
    fn from(error: Error) -> Self {
        if error.is_connection() {
            Self::ConnectionError(Box::new(error))
        } else {
            Self::InternalError(Box::new(error))
        }
    }
}
