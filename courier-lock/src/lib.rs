//! # courier-lock: distributed locks for the Courier engine
//!
//! - **Quorum locking**: a lock counts as held once a majority of independent
//!   lock servers granted it within its TTL, so a minority of unreachable
//!   servers never fails an acquire
//! - **Fail-open**: without a configured backend every acquire returns a
//!   no-op handle and work runs unprotected
//! - **Reference counting**: the manager counts locks held per resource
//! - **Graceful drain**: on shutdown new locks are refused, held ones are
//!   waited for, then backend connections are closed exactly once
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use courier_lock::prelude::*;
//! use courier_core::config::LockSettings;
//!
//! # tokio_test::block_on(async {
//! let manager = DistributedLockManager::new();
//! manager.startup(vec![Arc::new(MemoryLockBackend::default())], &LockSettings::default()).unwrap();
//!
//! let sent = manager
//!     .with_lock("digest:env:subscriber:template", Duration::from_secs(5), || async { 42 })
//!     .await
//!     .unwrap();
//! assert_eq!(sent, 42);
//! assert_eq!(manager.lock_count("digest:env:subscriber:template"), 0);
//! # });
//! ```

pub mod backend;
pub mod counter;
pub mod error;
pub mod manager;
pub mod redlock;

pub use backend::{LockBackend, MemoryLockBackend};
pub use counter::LockCounter;
pub use error::{LockError, LockResult};
pub use manager::{DistributedLockManager, LockClient, LockHandle, LockManagerState, DRAIN_POLL_INTERVAL};
pub use redlock::{quorum, Lease, Redlock, RedlockSettings};

#[cfg(feature = "redis")]
pub use backend::RedisLockBackend;

pub mod prelude {
    pub use crate::backend::{LockBackend, MemoryLockBackend};
    pub use crate::error::{LockError, LockResult};
    pub use crate::manager::{DistributedLockManager, LockHandle, LockManagerState};
}
