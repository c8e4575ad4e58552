pub mod memory;

#[cfg(feature = "redis")]
pub mod redis;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_core::Stream;
use std::pin::Pin;
use std::time::Duration;

use courier_core::ids::JobId;

use crate::types::{ClaimedJob, LeaseToken, QueueCounts, QueueEvent, QueueMessage, QueueRecord, ReclaimOutcome};
use crate::QueueResult;

pub use memory::{LeaseReaper, MemoryQueueBackend};

#[cfg(feature = "redis")]
pub use self::redis::RedisQueueBackend;

/// Error recorded when an expired lease is given back for another attempt
pub const LEASE_EXPIRED: &str = "Lease expired";

/// Error recorded when an expired lease used up the job's last attempt
pub const LEASE_EXPIRED_FINAL: &str = "Max attempts exceeded due to lease expiry";

/// Type alias for boxed streams (stable Rust compatible)
pub type BoxStream<T> = Pin<Box<dyn Stream<Item = T> + Send + 'static>>;

/// Backend trait for durable queue storage primitives.
///
/// Backends own the claim semantics: a job is handed to at most one worker
/// at a time, identified by the lease token it must present to ack. Retry
/// delays are computed by the adapter and passed in as `retry_at`.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Add a job. Adding an id that is still live returns it unchanged.
    async fn add(&self, message: QueueMessage) -> QueueResult<JobId>;

    /// Lease the next eligible job of `queue` for `lease`, counting the attempt
    async fn claim(&self, queue: &str, lease: Duration) -> QueueResult<Option<ClaimedJob>>;

    /// Renew a running attempt's lease for another `lease` from now.
    /// Fails like an ack when the caller no longer owns a live lease.
    async fn extend_lease(
        &self,
        job_id: &JobId,
        lease_token: &LeaseToken,
        lease: Duration,
    ) -> QueueResult<DateTime<Utc>>;

    /// Acknowledge completion; removes the record when the message asks for it
    async fn ack_complete(&self, job_id: &JobId, lease_token: &LeaseToken) -> QueueResult<()>;

    /// Acknowledge a failed attempt. The job is delayed until `retry_at` when
    /// given and attempts remain, otherwise it fails for good.
    async fn ack_fail(
        &self,
        job_id: &JobId,
        lease_token: &LeaseToken,
        error: String,
        retry_at: Option<DateTime<Utc>>,
    ) -> QueueResult<()>;

    async fn get_record(&self, job_id: &JobId) -> QueueResult<QueueRecord>;

    async fn counts(&self, queue: &str) -> QueueResult<QueueCounts>;

    /// Give jobs whose lease ran out back to the queue. Jobs without
    /// attempts left fail for good and are returned so their owner can be told.
    async fn reclaim_expired(&self, queue: &str) -> QueueResult<ReclaimOutcome>;

    /// Event stream for observability (boxed for stable Rust)
    fn event_stream(&self) -> BoxStream<QueueEvent>;
}
