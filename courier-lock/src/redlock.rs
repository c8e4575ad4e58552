//! Quorum lock over independent lock servers.
//!
//! A lock is held once a majority (`n / 2 + 1`) of servers granted it and the
//! time left on the TTL, minus the time spent asking and a clock drift
//! allowance, is still positive. Each server gets `backend_timeout` to
//! answer; a silent server counts as a denial. Failed rounds give back every
//! partial vote before retrying after `retry_delay` plus a random jitter.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use rand::Rng;
use tracing::{debug, warn};
use uuid::Uuid;

use courier_core::config::LockSettings;

use crate::backend::LockBackend;
use crate::{LockError, LockResult};

/// Fixed part of the drift allowance, on top of `ttl * drift_factor`
const DRIFT_CONSTANT: Duration = Duration::from_millis(2);

/// Receives every backend error seen while locking or unlocking
pub type ErrorObserver = Arc<dyn Fn(&str, &LockError) + Send + Sync>;

/// Minimum number of servers that must agree for a lock to be held
pub fn quorum(servers: usize) -> usize {
    if servers == 0 {
        return 0;
    }
    servers / 2 + 1
}

#[derive(Debug, Clone, PartialEq)]
pub struct RedlockSettings {
    pub drift_factor: f64,
    /// Rounds after the first one
    pub retry_count: u32,
    pub retry_delay: Duration,
    pub retry_jitter: Duration,
    /// Per-server limit on one lock, unlock or quit call
    pub backend_timeout: Duration,
}

impl Default for RedlockSettings {
    fn default() -> Self {
        Self::from(&LockSettings::default())
    }
}

impl From<&LockSettings> for RedlockSettings {
    fn from(settings: &LockSettings) -> Self {
        Self {
            drift_factor: settings.drift_factor,
            retry_count: settings.retry_count,
            retry_delay: settings.retry_delay,
            retry_jitter: settings.retry_jitter,
            backend_timeout: settings.backend_timeout,
        }
    }
}

/// A lock held on a quorum of servers
#[derive(Debug, Clone)]
pub struct Lease {
    pub resource: String,
    pub value: String,
    /// Instant after which the lock can no longer be trusted
    pub valid_until: Instant,
    /// Round that won the quorum, starting at 1
    pub attempts: u32,
}

impl Lease {
    pub fn is_valid(&self) -> bool {
        Instant::now() < self.valid_until
    }
}

pub struct Redlock {
    backends: Vec<Arc<dyn LockBackend>>,
    settings: RedlockSettings,
    quorum: usize,
    observer: ErrorObserver,
}

impl Redlock {
    pub fn new(backends: Vec<Arc<dyn LockBackend>>, settings: RedlockSettings) -> LockResult<Self> {
        if backends.is_empty() {
            return Err(LockError::NoBackends);
        }
        let quorum = quorum(backends.len());
        Ok(Self {
            backends,
            settings,
            quorum,
            observer: Arc::new(|backend: &str, error: &LockError| warn!(backend, "Lock backend error: {}", error)),
        })
    }

    pub fn with_error_observer(mut self, observer: ErrorObserver) -> Self {
        self.observer = observer;
        self
    }

    pub fn quorum(&self) -> usize {
        self.quorum
    }

    pub fn settings(&self) -> &RedlockSettings {
        &self.settings
    }

    /// Try to lock `resource` for `ttl`, retrying per the configured policy.
    pub async fn acquire(&self, resource: &str, ttl: Duration) -> LockResult<Lease> {
        let value = Uuid::new_v4().to_string();
        let rounds = self.settings.retry_count.saturating_add(1);

        for attempt in 1..=rounds {
            let started = Instant::now();
            let granted = self.vote(resource, &value, ttl).await;

            let drift = ttl.mul_f64(self.settings.drift_factor) + DRIFT_CONSTANT;
            let validity = ttl.checked_sub(started.elapsed() + drift).unwrap_or(Duration::ZERO);

            if granted >= self.quorum && !validity.is_zero() {
                debug!(resource, attempt, granted, "Lock acquired");
                return Ok(Lease {
                    resource: resource.to_string(),
                    value,
                    valid_until: started + validity,
                    attempts: attempt,
                });
            }

            debug!(resource, attempt, granted, quorum = self.quorum, "Lock round failed");
            self.unlock_all(resource, &value).await;

            if attempt < rounds {
                tokio::time::sleep(self.retry_pause()).await;
            }
        }

        Err(LockError::QuorumNotReached {
            resource: resource.to_string(),
            attempts: rounds,
        })
    }

    /// Release a lease on every server. Returns how many servers released it.
    pub async fn release(&self, lease: &Lease) -> LockResult<usize> {
        let released = self.unlock_all(&lease.resource, &lease.value).await;
        if released == 0 && !lease.is_valid() {
            return Err(LockError::Expired {
                resource: lease.resource.clone(),
            });
        }
        Ok(released)
    }

    /// Close every server connection. All servers are asked even when some fail.
    pub async fn quit(&self) -> LockResult<()> {
        let results = join_all(self.backends.iter().map(|backend| self.bounded(backend.quit()))).await;
        let mut first_error = None;
        for (backend, result) in self.backends.iter().zip(results) {
            if let Err(e) = result {
                (self.observer)(backend.name(), &e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn vote(&self, resource: &str, value: &str, ttl: Duration) -> usize {
        let votes = join_all(
            self.backends
                .iter()
                .map(|backend| self.bounded(backend.try_lock(resource, value, ttl))),
        )
        .await;
        let mut granted = 0;
        for (backend, vote) in self.backends.iter().zip(votes) {
            match vote {
                Ok(true) => granted += 1,
                Ok(false) => {}
                Err(e) => (self.observer)(backend.name(), &e),
            }
        }
        granted
    }

    async fn unlock_all(&self, resource: &str, value: &str) -> usize {
        let results = join_all(
            self.backends
                .iter()
                .map(|backend| self.bounded(backend.unlock(resource, value))),
        )
        .await;
        let mut released = 0;
        for (backend, result) in self.backends.iter().zip(results) {
            match result {
                Ok(true) => released += 1,
                Ok(false) => {}
                Err(e) => (self.observer)(backend.name(), &e),
            }
        }
        released
    }

    async fn bounded<T>(&self, call: impl Future<Output = LockResult<T>>) -> LockResult<T> {
        let limit = self.settings.backend_timeout;
        tokio::time::timeout(limit, call)
            .await
            .unwrap_or(Err(LockError::Timeout(limit)))
    }

    fn retry_pause(&self) -> Duration {
        let jitter_ms = self.settings.retry_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        self.settings.retry_delay + Duration::from_millis(jitter)
    }
}
