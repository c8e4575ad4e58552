use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;

/// Execution samples kept per queue
const MAX_SAMPLES: usize = 1000;

/// Live counters for queue operations, shared by the adapter and its workers
#[derive(Default)]
pub struct LiveMetrics {
    jobs_enqueued: AtomicU64,
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_retried: AtomicU64,

    per_queue: RwLock<HashMap<String, QueueMetrics>>,
    execution_times: RwLock<HashMap<String, VecDeque<Duration>>>,
}

impl LiveMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_jobs_enqueued(&self, queue: &str) {
        self.jobs_enqueued.fetch_add(1, Ordering::Relaxed);
        self.per_queue.write().entry(queue.to_string()).or_default().enqueued += 1;
    }

    pub fn increment_jobs_completed(&self, queue: &str) {
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
        self.per_queue.write().entry(queue.to_string()).or_default().completed += 1;
    }

    pub fn increment_jobs_failed(&self, queue: &str) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
        self.per_queue.write().entry(queue.to_string()).or_default().failed += 1;
    }

    pub fn increment_jobs_retried(&self, queue: &str) {
        self.jobs_retried.fetch_add(1, Ordering::Relaxed);
        self.per_queue.write().entry(queue.to_string()).or_default().retried += 1;
    }

    pub fn jobs_enqueued(&self) -> u64 {
        self.jobs_enqueued.load(Ordering::Relaxed)
    }

    pub fn jobs_completed(&self) -> u64 {
        self.jobs_completed.load(Ordering::Relaxed)
    }

    pub fn jobs_failed(&self) -> u64 {
        self.jobs_failed.load(Ordering::Relaxed)
    }

    pub fn jobs_retried(&self) -> u64 {
        self.jobs_retried.load(Ordering::Relaxed)
    }

    pub fn queue_metrics(&self, queue: &str) -> Option<QueueMetrics> {
        self.per_queue.read().get(queue).cloned()
    }

    pub fn record_execution_time(&self, queue: &str, duration: Duration) {
        let mut times = self.execution_times.write();
        let samples = times.entry(queue.to_string()).or_default();
        samples.push_back(duration);
        if samples.len() > MAX_SAMPLES {
            samples.pop_front();
        }
    }

    /// Mean of the recent execution times of `queue`
    pub fn average_execution_time(&self, queue: &str) -> Option<Duration> {
        let times = self.execution_times.read();
        let samples = times.get(queue).filter(|samples| !samples.is_empty())?;
        let total: Duration = samples.iter().sum();
        Some(total / samples.len() as u32)
    }
}

/// Counters for one queue
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueMetrics {
    pub enqueued: u64,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
}

impl QueueMetrics {
    /// Success rate as a percentage of finished jobs
    pub fn success_rate(&self) -> f64 {
        let total_processed = self.completed + self.failed;
        if total_processed == 0 {
            100.0
        } else {
            (self.completed as f64 / total_processed as f64) * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_per_queue() {
        let metrics = LiveMetrics::new();
        metrics.increment_jobs_enqueued("standard");
        metrics.increment_jobs_completed("standard");
        metrics.increment_jobs_failed("standard");
        metrics.increment_jobs_retried("other");

        let standard = metrics.queue_metrics("standard").unwrap();
        assert_eq!(standard.enqueued, 1);
        assert_eq!(standard.success_rate(), 50.0);
        assert_eq!(metrics.jobs_retried(), 1);
        assert!(metrics.queue_metrics("missing").is_none());
    }

    #[test]
    fn execution_samples_are_bounded() {
        let metrics = LiveMetrics::new();
        for _ in 0..MAX_SAMPLES + 10 {
            metrics.record_execution_time("standard", Duration::from_millis(4));
        }

        assert_eq!(metrics.average_execution_time("standard"), Some(Duration::from_millis(4)));
        assert_eq!(metrics.execution_times.read()["standard"].len(), MAX_SAMPLES);
        assert_eq!(metrics.average_execution_time("other"), None);
    }
}
