pub mod memory;

#[cfg(feature = "redis")]
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;

use crate::LockResult;

pub use memory::MemoryLockBackend;

#[cfg(feature = "redis")]
pub use self::redis::RedisLockBackend;

/// One lock server taking part in a quorum.
///
/// `value` is a random token owned by the acquiring client; a backend only
/// releases a resource when the stored token matches.
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Label used in logs
    fn name(&self) -> &str;

    /// Set `resource` to `value` unless it is already held. Returns whether
    /// this call took the lock.
    async fn try_lock(&self, resource: &str, value: &str, ttl: Duration) -> LockResult<bool>;

    /// Release `resource` if it is still held with `value`.
    async fn unlock(&self, resource: &str, value: &str) -> LockResult<bool>;

    /// Close the connection to the server
    async fn quit(&self) -> LockResult<()>;
}
