// #![warn(missing_docs)]
//! Traits and structs for durable store interaction.
//!
//! The window rate limiter keeps its counters in a durable key-value store
//! when one is configured. If you want to back it with your own storage,
//! implement [`DurableStore`].
mod store;

pub use store::{BackendResult, DurableStore};
use thiserror::Error;

/// Raw byte payload kept in a durable store.
pub type Raw = bytes::Bytes;

/// Proxy Error describes general groups of errors in durable store interaction.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Internal store error, state or computation error.
    ///
    /// Any error not bounded with network interaction.
    #[error(transparent)]
    InternalError(Box<dyn std::error::Error + Send + Sync>),
    /// Network interaction error.
    #[error(transparent)]
    ConnectionError(Box<dyn std::error::Error + Send + Sync>),
    /// A stored payload could not be decoded.
    #[error("malformed payload for key `{key}`: {reason}")]
    FormatError {
        /// Key whose payload was rejected.
        key: String,
        /// Why decoding failed.
        reason: String,
    },
}

impl BackendError {
    /// Creates a [`BackendError::FormatError`].
    pub fn format(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::FormatError {
            key: key.into(),
            reason: reason.into(),
        }
    }
}
