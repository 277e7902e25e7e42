//! Client-facing stale-while-revalidate cache.
//!
//! Entries move through three phases measured from their last write:
//!
//! ```text
//!  0 ........ stale_after ............ cache_time
//!  |  fresh   |          stale         |  purged
//! ```
//!
//! Fresh values are returned without calling the producer. Stale values are
//! still returned by [`RevalidatingCache::read`], and
//! [`RevalidatingCache::fetch_or_join`] refreshes them through a single
//! shared fetch per key. Values past `cache_time` are gone.
//!
//! Observers register with [`RevalidatingCache::subscribe`] and receive a
//! [`CacheEvent`] for every write, failed refresh, invalidation or
//! environment-triggered revalidation of their key.

mod cache;
mod subscription;

pub use cache::{RevalidatingCache, RevalidatingCacheBuilder, Snapshot};
pub use subscription::{CacheEvent, EventKind, Subscription};
