//! Server-facing response cache.
//!
//! Responses are keyed by the canonical form of the request payload (see
//! [`RequestKey`](standings_core::RequestKey)) and kept for a per-category
//! TTL. After the TTL a response is served as stale for `stale_window`
//! more, then purged:
//!
//! ```text
//!  stored ............ ttl ............ ttl + stale_window
//!  |   fresh           |     stale      |  purged
//! ```
//!
//! The number of resident keys is capped at `max_entries`; inserting a new
//! key at the cap evicts the least recently touched one.

mod cache;

pub use cache::{CacheStats, Cached, ResponseCache};
