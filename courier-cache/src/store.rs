use std::future::Future;
use std::sync::Arc;

use futures::stream::{self, Stream, TryStreamExt};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, instrument, warn};

use courier_core::config::{CacheSettings, RuntimeEnv};

use crate::backend::{CacheBackend, CacheBatch};
use crate::keys::split_query_key;
use crate::{CacheError, CacheResult};

/// Total width of the random TTL window (±5% around the requested TTL)
pub const TTL_VARIANT_PERCENTAGE: f64 = 0.1;

/// Keys examined per scan page
pub const DEFAULT_SCAN_COUNT: usize = 100;

/// Spread `ttl` uniformly over `[0.95 ttl, 1.05 ttl]` so entries written
/// together do not expire together.
pub fn jitter_ttl(ttl: u64) -> u64 {
    jitter_ttl_with(ttl, &mut rand::thread_rng())
}

pub fn jitter_ttl_with<R: Rng>(ttl: u64, rng: &mut R) -> u64 {
    let ttl = ttl as f64;
    let half = ttl * TTL_VARIANT_PERCENTAGE / 2.0;
    let value = ttl - half + rng.gen::<f64>() * ttl * TTL_VARIANT_PERCENTAGE;
    value.round().clamp((ttl - half).ceil(), (ttl + half).floor()) as u64
}

enum ScanState {
    Start,
    Resume(String),
    Done,
}

async fn next_page(
    backend: Option<Arc<dyn CacheBackend>>,
    pattern: String,
    count: usize,
    state: ScanState,
) -> CacheResult<Option<(Vec<String>, ScanState)>> {
    let Some(backend) = backend else {
        return Ok(None);
    };
    let cursor = match state {
        ScanState::Done => return Ok(None),
        ScanState::Start => None,
        ScanState::Resume(cursor) => Some(cursor),
    };
    let page = backend.scan(cursor.as_deref(), &pattern, count).await?;
    let next = match page.next_cursor {
        Some(cursor) => ScanState::Resume(cursor),
        None => ScanState::Done,
    };
    Ok(Some((page.keys, next)))
}

/// Key/value cache over an optional shared backend.
///
/// Every operation is a no-op when the cache is disabled; callers never need
/// to check [`CacheStore::cache_enabled`] themselves.
#[derive(Clone)]
pub struct CacheStore {
    backend: Option<Arc<dyn CacheBackend>>,
    enabled: bool,
    default_ttl_secs: u64,
    key_prefix: Option<String>,
    scan_count: usize,
    env: RuntimeEnv,
}

impl CacheStore {
    pub fn new(backend: Arc<dyn CacheBackend>, settings: &CacheSettings) -> Self {
        Self {
            backend: Some(backend),
            enabled: settings.enabled,
            default_ttl_secs: settings.default_ttl_secs,
            key_prefix: settings.key_prefix.clone(),
            scan_count: DEFAULT_SCAN_COUNT,
            env: RuntimeEnv::default(),
        }
    }

    /// A store without a backend
    pub fn disabled() -> Self {
        Self {
            backend: None,
            enabled: false,
            default_ttl_secs: CacheSettings::default().default_ttl_secs,
            key_prefix: None,
            scan_count: DEFAULT_SCAN_COUNT,
            env: RuntimeEnv::default(),
        }
    }

    /// Connect to the configured endpoint, or build a disabled store.
    #[cfg(feature = "redis")]
    pub async fn from_settings(settings: &CacheSettings) -> CacheResult<Self> {
        match &settings.endpoint {
            Some(endpoint) if settings.is_enabled() => {
                let backend =
                    crate::backend::RedisCacheBackend::connect(endpoint, settings.connect_timeout).await?;
                Ok(Self::new(Arc::new(backend), settings))
            }
            _ => Ok(Self::disabled()),
        }
    }

    /// Turn the cache off without dropping the backend
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_runtime_env(mut self, env: RuntimeEnv) -> Self {
        self.env = env;
        self
    }

    pub fn with_scan_count(mut self, scan_count: usize) -> Self {
        self.scan_count = scan_count.max(1);
        self
    }

    pub fn cache_enabled(&self) -> bool {
        self.enabled && self.backend.is_some()
    }

    pub fn default_ttl_secs(&self) -> u64 {
        self.default_ttl_secs
    }

    fn active_backend(&self) -> Option<&Arc<dyn CacheBackend>> {
        self.backend.as_ref().filter(|_| self.enabled)
    }

    fn full_key(&self, key: &str) -> String {
        match &self.key_prefix {
            Some(prefix) => format!("{prefix}{key}"),
            None => key.to_string(),
        }
    }

    fn ttl_or_default(&self, ttl_secs: Option<u64>) -> u64 {
        jitter_ttl(ttl_secs.unwrap_or(self.default_ttl_secs))
    }

    pub async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let Some(backend) = self.active_backend() else {
            return Ok(None);
        };
        backend.get(&self.full_key(key)).await
    }

    pub async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> CacheResult<()> {
        let Some(backend) = self.active_backend() else {
            return Ok(());
        };
        backend.set(&self.full_key(key), value, self.ttl_or_default(ttl_secs)).await
    }

    pub async fn del(&self, key: &str) -> CacheResult<u64> {
        self.del_many(&[key.to_string()]).await
    }

    pub async fn del_many(&self, keys: &[String]) -> CacheResult<u64> {
        let Some(backend) = self.active_backend() else {
            return Ok(0);
        };
        if keys.is_empty() {
            return Ok(0);
        }
        let keys: Vec<String> = keys.iter().map(|k| self.full_key(k)).collect();
        backend.del(&keys).await
    }

    /// Cache one query result and register it in its scope's query set.
    ///
    /// The set outlives its longest member: its TTL is the default TTL plus
    /// the member's TTL.
    #[instrument(skip(self, value))]
    pub async fn set_query(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> CacheResult<()> {
        let Some(backend) = self.active_backend() else {
            return Ok(());
        };
        let (scope, discriminator) =
            split_query_key(key).ok_or_else(|| CacheError::InvalidQueryKey(key.to_string()))?;

        let ttl = self.ttl_or_default(ttl_secs);
        let scope_key = self.full_key(scope);
        let batch = CacheBatch::new()
            .sadd(scope_key.clone(), discriminator)
            .expire(scope_key, self.default_ttl_secs + ttl)
            .set(self.full_key(key), value, ttl);

        backend.exec(batch).await
    }

    /// Drop every cached query of a scope together with the scope set.
    #[instrument(skip(self))]
    pub async fn del_query(&self, scope: &str) -> CacheResult<()> {
        let Some(backend) = self.active_backend() else {
            return Ok(());
        };
        let scope_key = self.full_key(scope);
        let members = backend.smembers(&scope_key).await?;
        if members.is_empty() {
            return Ok(());
        }

        let mut keys: Vec<String> = members
            .iter()
            .map(|member| self.full_key(&crate::keys::query_key(scope, member)))
            .collect();
        keys.push(scope_key);

        debug!("Deleting {} cached queries in scope {}", members.len(), scope);
        backend.exec(CacheBatch::new().del(keys)).await
    }

    /// Lazily page through keys matching `pattern` (already prefixed keys are
    /// returned as stored).
    pub fn scan_keys(&self, pattern: &str) -> impl Stream<Item = CacheResult<Vec<String>>> + Send + 'static {
        self.scan_keys_from(pattern, None)
    }

    /// Resume a scan from a cursor returned by an earlier page.
    pub fn scan_keys_from(
        &self,
        pattern: &str,
        cursor: Option<String>,
    ) -> impl Stream<Item = CacheResult<Vec<String>>> + Send + 'static {
        let backend = self.active_backend().cloned();
        let pattern = self.full_key(pattern);
        let count = self.scan_count;
        let initial = match cursor {
            Some(cursor) => ScanState::Resume(cursor),
            None => ScanState::Start,
        };

        stream::try_unfold(initial, move |state| next_page(backend.clone(), pattern.clone(), count, state))
    }

    /// Delete every key matching `pattern`, one batch per scan page.
    ///
    /// Resolves once the scan is exhausted; the first scan or delete error
    /// aborts the iteration.
    #[instrument(skip(self))]
    pub async fn del_by_pattern(&self, pattern: &str) -> CacheResult<u64> {
        let Some(backend) = self.active_backend().cloned() else {
            return Ok(0);
        };
        let mut pages = Box::pin(self.scan_keys(pattern));
        let mut deleted = 0u64;

        while let Some(keys) = pages.try_next().await? {
            if keys.is_empty() {
                continue;
            }
            deleted += keys.len() as u64;
            backend.exec(CacheBatch::new().del(keys)).await?;
        }

        debug!("Deleted {} keys matching {}", deleted, pattern);
        Ok(deleted)
    }

    /// Read-through helper: return the cached value or fetch, store and
    /// return it. Cache failures never fail the fetch.
    pub async fn get_or_insert_with<T, F, Fut, E>(&self, key: &str, ttl_secs: Option<u64>, fetch: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.cache_enabled() {
            return fetch().await;
        }

        match self.get(key).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(value) => return Ok(value),
                Err(e) => warn!("Discarding undecodable cache entry {}: {}", key, e),
            },
            Ok(None) => {}
            Err(e) => warn!("Cache read failed for {}: {}", key, e),
        }

        let value = fetch().await?;
        match serde_json::to_string(&value) {
            Ok(raw) => {
                if let Err(e) = self.set(key, &raw, ttl_secs).await {
                    warn!("Cache write failed for {}: {}", key, e);
                }
            }
            Err(e) => warn!("Could not serialize cache entry {}: {}", key, e),
        }
        Ok(value)
    }

    /// Wipe the whole cache. Only allowed in the test environment.
    pub async fn flush_all(&self) -> CacheResult<()> {
        if !self.env.allows_destructive_ops() {
            return Err(CacheError::DestructiveOperationRefused(self.env.to_string()));
        }
        let Some(backend) = self.active_backend() else {
            return Ok(());
        };
        backend.flush_all().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn jitter_spreads_ttl_within_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        let samples: Vec<u64> = (0..10_000).map(|_| jitter_ttl_with(3600, &mut rng)).collect();

        assert!(samples.iter().all(|ttl| (3420..=3780).contains(ttl)));
        let first = samples[0];
        assert!(samples.iter().any(|ttl| *ttl != first));
    }

    #[test]
    fn jitter_of_zero_is_zero() {
        assert_eq!(jitter_ttl(0), 0);
    }

    #[test]
    fn disabled_store_reports_disabled() {
        assert!(!CacheStore::disabled().cache_enabled());
    }
}
