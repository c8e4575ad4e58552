use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// Per-resource count of locks held by this process.
///
/// Counts never go below zero and a resource disappears from the map when
/// its count reaches zero, so an idle counter is an empty map.
#[derive(Debug, Clone, Default)]
pub struct LockCounter {
    counts: Arc<DashMap<String, usize>>,
}

impl LockCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one more holder of `resource`, returning the new count
    pub fn increment(&self, resource: &str) -> usize {
        let mut count = self.counts.entry(resource.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Count one holder less, returning the remaining count
    pub fn decrement(&self, resource: &str) -> usize {
        match self.counts.entry(resource.to_string()) {
            Entry::Occupied(mut entry) => {
                let count = entry.get_mut();
                *count = count.saturating_sub(1);
                let remaining = *count;
                if remaining == 0 {
                    entry.remove();
                }
                remaining
            }
            Entry::Vacant(_) => 0,
        }
    }

    pub fn get(&self, resource: &str) -> usize {
        self.counts.get(resource).map_or(0, |count| *count)
    }

    /// Locks held across every resource
    pub fn total(&self) -> usize {
        self.counts.iter().map(|entry| *entry.value()).sum()
    }

    pub fn is_idle(&self) -> bool {
        self.counts.is_empty()
    }
}
