#![warn(missing_docs)]
//! # standings-core
//!
//! Core types shared by the standings caches.
//!
//! The three stores in the `standings` crate (revalidating cache, response
//! cache and window rate limiter) are built from the same primitives, which
//! live here:
//!
//! - **Lifecycle** of a cached value ([`CacheEntry`], [`ExpiryPolicy`], [`Freshness`])
//! - **Eviction** order for capacity-bounded stores ([`RecencyQueue`])
//! - **Time** as an injectable [`Clock`]
//! - **Keys** derived from upstream request payloads ([`RequestKey`])
//! - **Maintenance** gating so sweeps stay amortized ([`SweepThrottle`])
//!
//! ## Feature Flags
//!
//! - `test-helpers` - Expose [`ManualClock`] for deterministic tests
//!

pub mod clock;
pub mod entry;
pub mod eviction;
pub mod key;
pub mod throttle;

#[cfg(any(test, feature = "test-helpers"))]
pub use clock::ManualClock;
pub use clock::{Clock, SharedClock, SystemClock, system_clock};
pub use entry::{CacheEntry, ExpiryPolicy, Freshness, offset};
pub use eviction::RecencyQueue;
pub use key::{DEFAULT_CATEGORY, RequestKey, canonical_json, canonical_query, top_level_fields};
#[doc(hidden)]
pub use smol_str::SmolStr;
pub use throttle::SweepThrottle;
