//! Namespaced response cache with the strategy executors that use it.
//!
//! This module provides:
//! - Persistent, disjoint namespaces keyed by normalized method + URL
//! - Cache-first, bounded cache-first, TTL stale-while-revalidate and
//!   navigation stale-while-revalidate executors
//! - Background revalidation handles the caller can wait on
//! - Basic offline mode (stale cache, offline page or synthetic 503)

mod layer;
mod storage;
mod traits;

pub use layer::{CacheLayer, Served};
pub use storage::{CacheStorage, SqliteStorage};
pub use traits::{cache_key, CacheSource, NamespaceKind, Namespaces};

pub(crate) use storage::parse_datetime;
