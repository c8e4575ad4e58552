pub mod memory;

#[cfg(feature = "redis")]
pub mod redis;

use async_trait::async_trait;

use crate::CacheResult;

pub use memory::MemoryCacheBackend;

#[cfg(feature = "redis")]
pub use self::redis::RedisCacheBackend;

/// One command inside an all-or-nothing [`CacheBatch`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Set { key: String, value: String, ttl_secs: u64 },
    SAdd { key: String, member: String },
    Expire { key: String, ttl_secs: u64 },
    Del { keys: Vec<String> },
}

/// Commands executed as a single transaction by the backend
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheBatch {
    pub ops: Vec<BatchOp>,
}

impl CacheBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>, ttl_secs: u64) -> Self {
        self.ops.push(BatchOp::Set {
            key: key.into(),
            value: value.into(),
            ttl_secs,
        });
        self
    }

    pub fn sadd(mut self, key: impl Into<String>, member: impl Into<String>) -> Self {
        self.ops.push(BatchOp::SAdd {
            key: key.into(),
            member: member.into(),
        });
        self
    }

    pub fn expire(mut self, key: impl Into<String>, ttl_secs: u64) -> Self {
        self.ops.push(BatchOp::Expire {
            key: key.into(),
            ttl_secs,
        });
        self
    }

    pub fn del(mut self, keys: Vec<String>) -> Self {
        if !keys.is_empty() {
            self.ops.push(BatchOp::Del { keys });
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// One page of a cursor-based key scan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanPage {
    pub keys: Vec<String>,
    /// Cursor to resume from; `None` once the keyspace is exhausted
    pub next_cursor: Option<String>,
}

/// Storage primitives the cache store is built on
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> CacheResult<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl_secs: u64) -> CacheResult<()>;

    /// Delete keys, returning how many existed
    async fn del(&self, keys: &[String]) -> CacheResult<u64>;

    async fn smembers(&self, key: &str) -> CacheResult<Vec<String>>;

    /// Execute every command of the batch or none of them
    async fn exec(&self, batch: CacheBatch) -> CacheResult<()>;

    /// Incremental key scan. `cursor == None` starts a new iteration.
    ///
    /// Keys present for the whole iteration are returned at least once; the
    /// scan never blocks other commands.
    async fn scan(&self, cursor: Option<&str>, pattern: &str, count: usize) -> CacheResult<ScanPage>;

    async fn flush_all(&self) -> CacheResult<()>;
}
