use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::backend::QueueBackend;
use crate::types::{QueueRecord, ReclaimOutcome};
use crate::QueueResult;

pub const DEFAULT_REAPER_INTERVAL: Duration = Duration::from_secs(30);

/// Lease expiry reaper for reclaiming jobs of crashed or stalled workers
pub struct LeaseReaper {
    backend: Arc<dyn QueueBackend>,
    queue: String,
    interval: Duration,
}

impl LeaseReaper {
    pub fn new(backend: Arc<dyn QueueBackend>, queue: impl Into<String>) -> Self {
        Self {
            backend,
            queue: queue.into(),
            interval: DEFAULT_REAPER_INTERVAL,
        }
    }

    /// Create reaper with custom interval
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Run until the task is aborted. Every job that failed for good on an
    /// expired lease is passed to `on_failed`.
    pub async fn start<F, Fut>(self, mut on_failed: F)
    where
        F: FnMut(QueueRecord) -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut ticker = interval(self.interval);

        info!(queue = %self.queue, "Starting lease reaper with interval: {:?}", self.interval);

        loop {
            ticker.tick().await;

            match self.reap_expired_leases().await {
                Ok(outcome) if outcome.is_empty() => debug!("No expired leases found"),
                Ok(outcome) => {
                    info!(
                        requeued = outcome.requeued.len(),
                        failed = outcome.failed.len(),
                        "Reclaimed {} expired leases",
                        outcome.total()
                    );
                    for record in outcome.failed {
                        on_failed(record).await;
                    }
                }
                Err(e) => warn!("Error during lease reaping: {}", e),
            }
        }
    }

    /// Run one reaper cycle
    pub async fn reap_expired_leases(&self) -> QueueResult<ReclaimOutcome> {
        self.backend.reclaim_expired(&self.queue).await
    }
}
