use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::LockBackend;
use crate::{LockError, LockResult};

#[derive(Debug, Clone)]
struct Held {
    value: String,
    expires_at: Instant,
}

/// In-process lock server for tests and single-node deployments
#[derive(Clone)]
pub struct MemoryLockBackend {
    name: String,
    held: Arc<Mutex<HashMap<String, Held>>>,
    unavailable: Arc<AtomicBool>,
    quit_calls: Arc<AtomicUsize>,
}

impl MemoryLockBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            held: Arc::new(Mutex::new(HashMap::new())),
            unavailable: Arc::new(AtomicBool::new(false)),
            quit_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Make every call fail as if the server went away (test helper)
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Token currently holding `resource` (test helper)
    pub fn holder(&self, resource: &str) -> Option<String> {
        let now = Instant::now();
        self.held
            .lock()
            .get(resource)
            .filter(|held| held.expires_at > now)
            .map(|held| held.value.clone())
    }

    /// Number of live locks on this server (test helper)
    pub fn held_count(&self) -> usize {
        let now = Instant::now();
        self.held.lock().values().filter(|held| held.expires_at > now).count()
    }

    /// How many times `quit` was called (test helper)
    pub fn quit_calls(&self) -> usize {
        self.quit_calls.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> LockResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(LockError::Unavailable(format!("{} marked unavailable", self.name)));
        }
        Ok(())
    }
}

impl Default for MemoryLockBackend {
    fn default() -> Self {
        Self::new("memory")
    }
}

#[async_trait]
impl LockBackend for MemoryLockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn try_lock(&self, resource: &str, value: &str, ttl: Duration) -> LockResult<bool> {
        self.check_available()?;
        let now = Instant::now();
        let mut held = self.held.lock();
        if held.get(resource).is_some_and(|current| current.expires_at > now) {
            return Ok(false);
        }
        held.insert(
            resource.to_string(),
            Held {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn unlock(&self, resource: &str, value: &str) -> LockResult<bool> {
        self.check_available()?;
        let mut held = self.held.lock();
        match held.get(resource) {
            Some(current) if current.value == value => {
                held.remove(resource);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn quit(&self) -> LockResult<()> {
        self.quit_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn only_the_token_owner_can_unlock() {
        let backend = MemoryLockBackend::default();

        assert!(backend.try_lock("r", "a", Duration::from_secs(5)).await.unwrap());
        assert!(!backend.try_lock("r", "b", Duration::from_secs(5)).await.unwrap());
        assert!(!backend.unlock("r", "b").await.unwrap());
        assert_eq!(backend.holder("r").as_deref(), Some("a"));

        assert!(backend.unlock("r", "a").await.unwrap());
        assert_eq!(backend.holder("r"), None);
    }

    #[tokio::test]
    async fn expired_locks_can_be_taken_over() {
        let backend = MemoryLockBackend::default();

        assert!(backend.try_lock("r", "a", Duration::from_millis(1)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert!(backend.try_lock("r", "b", Duration::from_secs(5)).await.unwrap());
        assert_eq!(backend.holder("r").as_deref(), Some("b"));
    }
}
