use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::RwLock;
use tracing::{debug, error, info, instrument, warn};

use courier_core::config::LockSettings;

use crate::backend::LockBackend;
use crate::counter::LockCounter;
use crate::redlock::{Lease, Redlock, RedlockSettings};
use crate::{LockError, LockResult};

/// Interval between counter checks while draining
pub const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockManagerState {
    Uninitialized,
    Ready,
    Draining,
    Stopped,
}

impl fmt::Display for LockManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Ready => "ready",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Lock client, or the lack of one.
///
/// A disabled client hands out no-op handles, so callers run unprotected
/// instead of failing when no lock backend is configured.
#[derive(Clone)]
pub enum LockClient {
    Enabled(Arc<Redlock>),
    Disabled,
}

/// A lock held by this process. Call [`LockHandle::release`] when done.
///
/// Dropping a handle without releasing it gives its slot back to the drain
/// counter; the backend lock itself then lapses when its TTL runs out.
#[must_use = "a held lock must be released"]
pub struct LockHandle {
    resource: String,
    held: Option<Held>,
}

struct Held {
    client: Arc<Redlock>,
    lease: Lease,
    counter: LockCounter,
}

impl LockHandle {
    fn noop(resource: &str) -> Self {
        Self {
            resource: resource.to_string(),
            held: None,
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Whether this handle guards anything (false when locking is disabled)
    pub fn is_held(&self) -> bool {
        self.held.is_some()
    }

    pub fn lease(&self) -> Option<&Lease> {
        self.held.as_ref().map(|held| &held.lease)
    }

    pub async fn release(mut self) -> LockResult<()> {
        let Some(held) = self.held.take() else {
            return Ok(());
        };
        let result = held.client.release(&held.lease).await;
        held.counter.decrement(&self.resource);
        let released = result?;
        debug!(resource = %self.resource, released, "Lock released");
        Ok(())
    }
}

impl fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockHandle")
            .field("resource", &self.resource)
            .field("held", &self.held.is_some())
            .finish()
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if let Some(held) = self.held.take() {
            held.counter.decrement(&self.resource);
            warn!(resource = %self.resource, "Lock handle dropped without release; it lapses after its TTL");
        }
    }
}

/// Process-wide entry point for distributed locks.
///
/// Lifecycle: `Uninitialized -> Ready -> Draining -> Stopped`. New locks are
/// refused once draining starts; drain waits for every held lock to be
/// released before closing the backend connections.
pub struct DistributedLockManager {
    client: RwLock<LockClient>,
    state: RwLock<LockManagerState>,
    counter: LockCounter,
    draining: AtomicBool,
    default_ttl: Duration,
    drain_interval: Duration,
}

impl Default for DistributedLockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl DistributedLockManager {
    pub fn new() -> Self {
        Self {
            client: RwLock::new(LockClient::Disabled),
            state: RwLock::new(LockManagerState::Uninitialized),
            counter: LockCounter::new(),
            draining: AtomicBool::new(false),
            default_ttl: LockSettings::default().default_ttl,
            drain_interval: DRAIN_POLL_INTERVAL,
        }
    }

    /// Shorter drain polling, for tests
    pub fn with_drain_interval(mut self, interval: Duration) -> Self {
        self.drain_interval = interval;
        self
    }

    /// Build the quorum client over `backends`. A second call while ready is a
    /// no-op; an empty backend list leaves locking disabled.
    pub fn startup(&self, backends: Vec<Arc<dyn LockBackend>>, settings: &LockSettings) -> LockResult<()> {
        let mut state = self.state.write();
        match *state {
            LockManagerState::Ready => {
                debug!("Lock manager already started");
                return Ok(());
            }
            LockManagerState::Draining | LockManagerState::Stopped => {
                return Err(LockError::ShuttingDown {
                    resource: "lock manager".to_string(),
                });
            }
            LockManagerState::Uninitialized => {}
        }

        let client = if backends.is_empty() {
            info!("No lock backend configured, running without distributed locks");
            LockClient::Disabled
        } else {
            let servers = backends.len();
            let redlock = Redlock::new(backends, RedlockSettings::from(settings))?.with_error_observer(Arc::new(
                |backend: &str, err: &LockError| warn!(backend, "Lock backend error (tolerated): {}", err),
            ));
            info!(servers, quorum = redlock.quorum(), "Distributed locks enabled");
            LockClient::Enabled(Arc::new(redlock))
        };

        *self.client.write() = client;
        *state = LockManagerState::Ready;
        Ok(())
    }

    /// Connect one Redis backend per configured endpoint, then start up.
    #[cfg(feature = "redis")]
    pub async fn connect(&self, settings: &LockSettings) -> LockResult<()> {
        let mut backends: Vec<Arc<dyn LockBackend>> = Vec::with_capacity(settings.endpoints.len());
        for endpoint in &settings.endpoints {
            let backend = crate::backend::RedisLockBackend::connect(endpoint, settings.connect_timeout).await?;
            backends.push(Arc::new(backend));
        }
        self.startup(backends, settings)
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn is_enabled(&self) -> bool {
        matches!(*self.client.read(), LockClient::Enabled(_))
    }

    pub fn state(&self) -> LockManagerState {
        *self.state.read()
    }

    /// Locks currently held on `resource` by this process
    pub fn lock_count(&self, resource: &str) -> usize {
        self.counter.get(resource)
    }

    pub fn counter(&self) -> &LockCounter {
        &self.counter
    }

    /// Acquire `resource` for `ttl`.
    ///
    /// Returns a no-op handle when locking is disabled. The resource is
    /// counted before the quorum round starts so a concurrent drain waits
    /// for acquisitions already in flight.
    #[instrument(skip(self))]
    pub async fn acquire(&self, resource: &str, ttl: Duration) -> LockResult<LockHandle> {
        let client = match self.state() {
            LockManagerState::Draining | LockManagerState::Stopped => {
                return Err(LockError::ShuttingDown {
                    resource: resource.to_string(),
                });
            }
            LockManagerState::Uninitialized => return Ok(LockHandle::noop(resource)),
            LockManagerState::Ready => match &*self.client.read() {
                LockClient::Enabled(client) => client.clone(),
                LockClient::Disabled => return Ok(LockHandle::noop(resource)),
            },
        };

        self.counter.increment(resource);
        if self.state() != LockManagerState::Ready {
            self.counter.decrement(resource);
            return Err(LockError::ShuttingDown {
                resource: resource.to_string(),
            });
        }

        match client.acquire(resource, ttl).await {
            Ok(lease) => Ok(LockHandle {
                resource: resource.to_string(),
                held: Some(Held {
                    client,
                    lease,
                    counter: self.counter.clone(),
                }),
            }),
            Err(e) => {
                self.counter.decrement(resource);
                Err(e)
            }
        }
    }

    /// Run `body` while holding `resource`.
    ///
    /// The lock is released exactly once whether the body returns or panics.
    /// Release failures are logged; the body's outcome always wins.
    pub async fn with_lock<F, Fut, T>(&self, resource: &str, ttl: Duration, body: F) -> LockResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let handle = self.acquire(resource, ttl).await?;
        let outcome = AssertUnwindSafe(async move { body().await }).catch_unwind().await;

        if let Err(e) = handle.release().await {
            warn!(resource, "Failed to release lock: {}", e);
        }

        match outcome {
            Ok(value) => Ok(value),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    /// Stop handing out locks, wait for held ones to be released and close
    /// the backend connections. Concurrent callers all return once stopped;
    /// only one of them closes the connections.
    pub async fn drain(&self) -> LockResult<()> {
        {
            let mut state = self.state.write();
            if *state == LockManagerState::Stopped {
                return Ok(());
            }
            *state = LockManagerState::Draining;
        }

        if self.draining.swap(true, Ordering::SeqCst) {
            while self.state() != LockManagerState::Stopped {
                tokio::time::sleep(self.drain_interval).await;
            }
            return Ok(());
        }

        info!("Draining distributed locks");
        while !self.counter.is_idle() {
            debug!(held = self.counter.total(), "Waiting for held locks to be released");
            tokio::time::sleep(self.drain_interval).await;
        }

        let client = self.client.read().clone();
        let result = match client {
            LockClient::Enabled(client) => client.quit().await,
            LockClient::Disabled => Ok(()),
        };
        if let Err(e) = &result {
            error!("Failed to close lock backend connections: {}", e);
        }

        *self.state.write() = LockManagerState::Stopped;
        info!("Distributed locks drained");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryLockBackend;

    fn fast_settings() -> LockSettings {
        LockSettings {
            retry_count: 0,
            retry_delay: Duration::from_millis(1),
            retry_jitter: Duration::ZERO,
            ..LockSettings::default()
        }
    }

    #[tokio::test]
    async fn uninitialized_manager_fails_open() {
        let manager = DistributedLockManager::new();

        let handle = manager.acquire("r", Duration::from_secs(1)).await.unwrap();

        assert!(!handle.is_held());
        assert_eq!(manager.lock_count("r"), 0);
        handle.release().await.unwrap();
    }

    #[tokio::test]
    async fn startup_is_idempotent() {
        let manager = DistributedLockManager::new();
        let first = MemoryLockBackend::new("first");
        let second = MemoryLockBackend::new("second");

        manager.startup(vec![Arc::new(first.clone())], &fast_settings()).unwrap();
        manager.startup(vec![Arc::new(second.clone())], &fast_settings()).unwrap();

        let handle = manager.acquire("r", Duration::from_secs(5)).await.unwrap();
        assert!(first.holder("r").is_some());
        assert!(second.holder("r").is_none());
        handle.release().await.unwrap();
    }

    #[tokio::test]
    async fn dropped_handle_returns_its_count() {
        let manager = DistributedLockManager::new();
        manager
            .startup(vec![Arc::new(MemoryLockBackend::default())], &fast_settings())
            .unwrap();

        let handle = manager.acquire("r", Duration::from_secs(5)).await.unwrap();
        assert_eq!(manager.lock_count("r"), 1);
        drop(handle);

        assert_eq!(manager.lock_count("r"), 0);
    }

    #[tokio::test]
    async fn failed_acquire_leaves_no_count() {
        let manager = DistributedLockManager::new();
        let backend = MemoryLockBackend::default();
        manager.startup(vec![Arc::new(backend.clone())], &fast_settings()).unwrap();

        let held = manager.acquire("r", Duration::from_secs(5)).await.unwrap();
        let err = manager.acquire("r", Duration::from_secs(5)).await.unwrap_err();

        assert!(matches!(err, LockError::QuorumNotReached { .. }));
        assert_eq!(manager.lock_count("r"), 1);
        held.release().await.unwrap();
        assert_eq!(manager.lock_count("r"), 0);
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn minority_backend_errors_are_logged_not_fatal() {
        let manager = DistributedLockManager::new();
        let healthy = [MemoryLockBackend::new("a"), MemoryLockBackend::new("b")];
        let broken = MemoryLockBackend::new("c");
        broken.set_unavailable(true);
        let backends: Vec<Arc<dyn LockBackend>> = vec![
            Arc::new(healthy[0].clone()),
            Arc::new(healthy[1].clone()),
            Arc::new(broken),
        ];
        manager.startup(backends, &fast_settings()).unwrap();

        let handle = manager.acquire("r", Duration::from_secs(5)).await.unwrap();

        assert!(handle.is_held());
        assert!(logs_contain("Lock backend error (tolerated)"));
        handle.release().await.unwrap();
    }

    struct Unresponsive;

    #[async_trait::async_trait]
    impl LockBackend for Unresponsive {
        fn name(&self) -> &str {
            "unresponsive"
        }

        async fn try_lock(&self, _resource: &str, _value: &str, _ttl: Duration) -> LockResult<bool> {
            std::future::pending().await
        }

        async fn unlock(&self, _resource: &str, _value: &str) -> LockResult<bool> {
            std::future::pending().await
        }

        async fn quit(&self) -> LockResult<()> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn unresponsive_minority_does_not_block_acquire_or_drain() {
        let manager = DistributedLockManager::new().with_drain_interval(Duration::from_millis(5));
        let healthy = [MemoryLockBackend::new("a"), MemoryLockBackend::new("b")];
        let backends: Vec<Arc<dyn LockBackend>> = vec![
            Arc::new(healthy[0].clone()),
            Arc::new(healthy[1].clone()),
            Arc::new(Unresponsive),
        ];
        let settings = LockSettings {
            backend_timeout: Duration::from_millis(50),
            ..fast_settings()
        };
        manager.startup(backends, &settings).unwrap();

        // Act
        let handle = tokio::time::timeout(Duration::from_secs(3), manager.acquire("r", Duration::from_secs(5)))
            .await
            .expect("acquire must finish with two healthy backends")
            .unwrap();
        assert!(handle.is_held());
        assert_eq!(manager.lock_count("r"), 1);
        handle.release().await.unwrap();

        // Assert
        assert_eq!(manager.lock_count("r"), 0);
        let drained = tokio::time::timeout(Duration::from_secs(3), manager.drain()).await;
        assert!(matches!(drained, Ok(Err(LockError::Timeout(_)))));
        assert_eq!(manager.state(), LockManagerState::Stopped);
    }
}
