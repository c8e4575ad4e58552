//! # courier-cache: optional shared cache for the Courier engine
//!
//! The cache is never required for correctness. A store built without a
//! backend (or switched off) answers every call immediately without error.
//!
//! - **Jittered TTLs**: every write lands within ±5% of the requested TTL so
//!   entries written together do not expire together
//! - **Query sets**: cached query results are registered under a scope set and
//!   dropped together with a single atomic batch
//! - **Pattern deletes**: cursor-based scans, one delete batch per page
//! - **Best-effort invalidation**: [`InvalidateCacheService`] logs backend
//!   failures instead of returning them
//!
//! ```rust
//! use std::sync::Arc;
//! use courier_cache::prelude::*;
//! use courier_core::config::CacheSettings;
//!
//! # tokio_test::block_on(async {
//! let backend = Arc::new(MemoryCacheBackend::new());
//! let store = CacheStore::new(backend, &CacheSettings::default());
//!
//! store.set_query("query:feed:e=1:s=2#query#page=0", "[]", None).await.unwrap();
//! store.del_query("query:feed:e=1:s=2").await.unwrap();
//! assert_eq!(store.get("query:feed:e=1:s=2#query#page=0").await.unwrap(), None);
//! # });
//! ```

pub mod backend;
pub mod error;
pub mod invalidate;
pub mod keys;
pub mod store;

pub use backend::{CacheBackend, CacheBatch, MemoryCacheBackend, ScanPage};
pub use error::{CacheError, CacheResult};
pub use invalidate::InvalidateCacheService;
pub use store::{jitter_ttl, CacheStore, TTL_VARIANT_PERCENTAGE};

#[cfg(feature = "redis")]
pub use backend::RedisCacheBackend;

pub mod prelude {
    pub use crate::backend::{CacheBackend, CacheBatch, MemoryCacheBackend};
    pub use crate::error::{CacheError, CacheResult};
    pub use crate::invalidate::InvalidateCacheService;
    pub use crate::keys::{feed_scope, message_count_scope, query_key, CacheKeyPrefix};
    pub use crate::store::CacheStore;
}
