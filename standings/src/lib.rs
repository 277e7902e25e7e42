#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]
//! # standings
//!
//! Caching and request coordination for the standings dashboard.
//!
//! Three independent stores built from the primitives in `standings-core`:
//!
//! - [`RevalidatingCache`] - client-facing stale-while-revalidate cache with
//!   deduplicated refreshes, subscriptions and environment-triggered revalidation
//! - [`ResponseCache`] - server-facing TTL cache keyed by canonical request
//!   payloads, with a stale window and recency eviction
//! - [`WindowRateLimiter`] - fixed-window per-caller limiter backed by a
//!   [`DurableStore`] with a bounded in-memory fallback
//!
//! Every store is an explicitly constructed handle. Nothing is global, so
//! tests and tenants can run isolated instances side by side.
//!
//! ## Feature Flags
//!
//! - `metrics` - Export counters through the `metrics` crate
//!

/// In-flight fetch deduplication.
///
/// [`InFlightRegistry`](concurrency::InFlightRegistry) maps a key to the one
/// fetch running for it, so concurrent misses share a single upstream call.
pub mod concurrency;

/// Configuration types and YAML loading.
pub mod config;

/// Error types for cache and configuration operations.
pub mod error;

/// Metrics collection for cache observability.
///
/// When the `metrics` feature is enabled, this module provides counters for
/// hits, misses, stale reads, evictions, fetches and rate limit decisions.
pub mod metrics;

pub mod ratelimit;
pub mod response;
pub mod revalidate;

/// Environment signals that trigger revalidation.
pub mod signal;

pub use config::{
    CategoryRule, RateLimitConfig, ResponseConfig, RevalidatingConfig, StalePolicy,
    StandingsConfig,
};
pub use error::{CacheError, ConfigError, SharedError};
pub use ratelimit::{MemoryCounterStore, RateDecision, RateWindowCounter, WindowRateLimiter};
pub use response::{CacheStats, Cached, ResponseCache};
pub use revalidate::{CacheEvent, EventKind, RevalidatingCache, Snapshot, Subscription};
pub use signal::{EnvironmentSignal, signal_channel};

pub use standings_backend::{BackendError, DurableStore};
pub use standings_core::{Clock, RequestKey, SystemClock};
