use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{BatchOp, CacheBackend, CacheBatch, ScanPage};
use crate::{CacheError, CacheResult};

#[derive(Debug, Clone)]
enum StoredValue {
    Text(String),
    Set(BTreeSet<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: StoredValue,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// In-process cache backend for tests and single-node deployments.
///
/// Keys are kept ordered so scans can resume from the last key they returned,
/// which keeps cursors stable while keys are deleted mid-iteration.
#[derive(Clone, Default)]
pub struct MemoryCacheBackend {
    entries: Arc<Mutex<BTreeMap<String, Entry>>>,
    calls: Arc<AtomicU64>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryCacheBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of backend calls served so far
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Make every call fail as if the server went away (test helper)
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Remaining time to live of a key (test helper)
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let entries = self.entries.lock();
        let entry = entries.get(key).filter(|e| e.is_live(now))?;
        entry.expires_at.map(|at| at.saturating_duration_since(now))
    }

    /// Live keys matching a glob pattern (test helper)
    pub fn keys(&self, pattern: &str) -> Vec<String> {
        let now = Instant::now();
        self.entries
            .lock()
            .iter()
            .filter(|(key, entry)| entry.is_live(now) && glob_match(pattern, key))
            .map(|(key, _)| key.clone())
            .collect()
    }

    fn enter(&self) -> CacheResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable("memory backend marked unavailable".to_string()));
        }
        Ok(())
    }

    fn expiry(ttl_secs: u64) -> Option<Instant> {
        Some(Instant::now() + Duration::from_secs(ttl_secs))
    }
}

fn purge_expired(entries: &mut BTreeMap<String, Entry>, now: Instant) {
    entries.retain(|_, entry| entry.is_live(now));
}

fn check_batch(entries: &BTreeMap<String, Entry>, batch: &CacheBatch) -> CacheResult<()> {
    for op in &batch.ops {
        if let BatchOp::SAdd { key, .. } = op {
            if let Some(Entry {
                value: StoredValue::Text(_),
                ..
            }) = entries.get(key)
            {
                return Err(CacheError::WrongType(key.clone()));
            }
        }
    }
    Ok(())
}

#[async_trait]
impl CacheBackend for MemoryCacheBackend {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        self.enter()?;
        let now = Instant::now();
        match self.entries.lock().get(key).filter(|e| e.is_live(now)) {
            None => Ok(None),
            Some(Entry {
                value: StoredValue::Text(value),
                ..
            }) => Ok(Some(value.clone())),
            Some(_) => Err(CacheError::WrongType(key.to_string())),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: u64) -> CacheResult<()> {
        self.enter()?;
        self.entries.lock().insert(
            key.to_string(),
            Entry {
                value: StoredValue::Text(value.to_string()),
                expires_at: Self::expiry(ttl_secs),
            },
        );
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> CacheResult<u64> {
        self.enter()?;
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let removed = keys
            .iter()
            .filter_map(|key| entries.remove(key))
            .filter(|entry| entry.is_live(now))
            .count();
        Ok(removed as u64)
    }

    async fn smembers(&self, key: &str) -> CacheResult<Vec<String>> {
        self.enter()?;
        let now = Instant::now();
        match self.entries.lock().get(key).filter(|e| e.is_live(now)) {
            None => Ok(Vec::new()),
            Some(Entry {
                value: StoredValue::Set(members),
                ..
            }) => Ok(members.iter().cloned().collect()),
            Some(_) => Err(CacheError::WrongType(key.to_string())),
        }
    }

    async fn exec(&self, batch: CacheBatch) -> CacheResult<()> {
        self.enter()?;
        let now = Instant::now();
        let mut entries = self.entries.lock();
        purge_expired(&mut entries, now);
        check_batch(&entries, &batch)?;

        for op in batch.ops {
            match op {
                BatchOp::Set { key, value, ttl_secs } => {
                    entries.insert(
                        key,
                        Entry {
                            value: StoredValue::Text(value),
                            expires_at: Self::expiry(ttl_secs),
                        },
                    );
                }
                BatchOp::SAdd { key, member } => {
                    let entry = entries.entry(key).or_insert_with(|| Entry {
                        value: StoredValue::Set(BTreeSet::new()),
                        expires_at: None,
                    });
                    if let StoredValue::Set(members) = &mut entry.value {
                        members.insert(member);
                    }
                }
                BatchOp::Expire { key, ttl_secs } => {
                    if let Some(entry) = entries.get_mut(&key) {
                        entry.expires_at = Self::expiry(ttl_secs);
                    }
                }
                BatchOp::Del { keys } => {
                    for key in keys {
                        entries.remove(&key);
                    }
                }
            }
        }
        Ok(())
    }

    async fn scan(&self, cursor: Option<&str>, pattern: &str, count: usize) -> CacheResult<ScanPage> {
        self.enter()?;
        let now = Instant::now();
        let entries = self.entries.lock();
        let lower = match cursor {
            Some(last) => Bound::Excluded(last.to_string()),
            None => Bound::Unbounded,
        };

        let examined: Vec<(&String, &Entry)> = entries
            .range((lower, Bound::Unbounded))
            .take(count.max(1))
            .collect();

        let keys = examined
            .iter()
            .filter(|(key, entry)| entry.is_live(now) && glob_match(pattern, key))
            .map(|(key, _)| (*key).clone())
            .collect();

        let next_cursor = match examined.last() {
            Some((last, _)) if examined.len() == count.max(1) => Some((*last).clone()),
            _ => None,
        };

        Ok(ScanPage { keys, next_cursor })
    }

    async fn flush_all(&self) -> CacheResult<()> {
        self.enter()?;
        self.entries.lock().clear();
        Ok(())
    }
}

/// Redis-style glob matching supporting `*`, `?` and `\` escapes.
pub(crate) fn glob_match(pattern: &str, key: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let key: Vec<char> = key.chars().collect();

    let (mut p, mut k) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while k < key.len() {
        match pattern.get(p) {
            Some('*') => {
                backtrack = Some((p, k));
                p += 1;
            }
            Some('?') => {
                p += 1;
                k += 1;
            }
            Some('\\') if p + 1 < pattern.len() && pattern[p + 1] == key[k] => {
                p += 2;
                k += 1;
            }
            Some(c) if *c != '\\' && *c == key[k] => {
                p += 1;
                k += 1;
            }
            _ => match backtrack {
                Some((star_p, star_k)) => {
                    p = star_p + 1;
                    k = star_k + 1;
                    backtrack = Some((star_p, star_k + 1));
                }
                None => return false,
            },
        }
    }

    pattern[p..].iter().all(|c| *c == '*')
}
