//! Error types for cache and configuration operations.

use std::sync::Arc;

use smol_str::SmolStr;
use thiserror::Error;

/// A producer error shared between every caller of one fetch.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Error returned by cache operations that run an upstream producer.
///
/// Cloneable so that a single failure can be handed to every caller that
/// joined the same in-flight fetch.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// The producer failed. Previously cached data, if any, is still servable.
    #[error("upstream fetch failed: {0}")]
    Upstream(SharedError),
    /// The producer task panicked or was aborted before yielding a result.
    #[error("fetch for key `{key}` ended without a result")]
    Abandoned {
        /// Key the fetch was running for.
        key: SmolStr,
    },
}

impl CacheError {
    /// Wraps a producer error.
    pub fn upstream<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::Upstream(Arc::from(error.into()))
    }

    /// The producer error, if this is an upstream failure.
    pub fn upstream_error(&self) -> Option<&SharedError> {
        match self {
            Self::Upstream(err) => Some(err),
            Self::Abandoned { .. } => None,
        }
    }

    /// Converts the error into the form recorded as an entry's `last_error`.
    pub(crate) fn to_shared(&self) -> SharedError {
        match self {
            Self::Upstream(err) => Arc::clone(err),
            other => Arc::new(other.clone()),
        }
    }
}

/// Error raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The YAML document could not be deserialized.
    #[error("failed to parse configuration: {0}")]
    Parse(String),
    /// A setting has an unusable value.
    #[error("invalid `{field}`: {reason}")]
    Invalid {
        /// Name of the offending setting.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}
