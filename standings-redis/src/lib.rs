#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]
//! Redis durable store for the standings window rate limiter.
//!
//! ```no_run
//! use standings_redis::RedisStore;
//!
//! let store = RedisStore::builder()
//!     .server("redis://127.0.0.1:6379/")
//!     .key_prefix("standings")
//!     .build()
//!     .expect("valid redis url");
//! ```

pub mod error;
pub mod store;

#[doc(inline)]
pub use crate::error::Error;
#[doc(inline)]
pub use crate::store::{RedisStore, RedisStoreBuilder};
