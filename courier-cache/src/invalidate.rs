use tracing::{debug, warn};

use crate::store::CacheStore;

/// Best-effort cache invalidation for write paths.
///
/// Nothing here returns an error: a failed delete leaves a stale entry that
/// still expires on its own, while the caller's write goes through.
#[derive(Clone)]
pub struct InvalidateCacheService {
    store: CacheStore,
}

impl InvalidateCacheService {
    pub fn new(store: CacheStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub async fn invalidate_key(&self, key: &str) {
        if !self.store.cache_enabled() {
            return;
        }
        if let Err(e) = self.store.del(key).await {
            warn!(key, "Failed to invalidate cache key: {}", e);
        }
    }

    pub async fn invalidate_keys(&self, keys: &[String]) {
        if !self.store.cache_enabled() || keys.is_empty() {
            return;
        }
        if let Err(e) = self.store.del_many(keys).await {
            warn!(count = keys.len(), "Failed to invalidate cache keys: {}", e);
        }
    }

    /// Drop every cached query registered under `scope`.
    pub async fn invalidate_query(&self, scope: &str) {
        if !self.store.cache_enabled() {
            return;
        }
        if let Err(e) = self.store.del_query(scope).await {
            warn!(scope, "Failed to invalidate cached queries: {}", e);
        }
    }

    pub async fn invalidate_by_pattern(&self, pattern: &str) {
        if !self.store.cache_enabled() {
            return;
        }
        match self.store.del_by_pattern(pattern).await {
            Ok(deleted) => debug!(pattern, deleted, "Invalidated cache keys by pattern"),
            Err(e) => warn!(pattern, "Failed to invalidate cache keys by pattern: {}", e),
        }
    }
}
