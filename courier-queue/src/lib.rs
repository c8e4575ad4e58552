//! # courier-queue: durable job queue and worker pool
//!
//! - **Lease-based claims**: a claimed job belongs to one worker until it is
//!   acknowledged or its lease runs out; the lease reaper gives stalled jobs
//!   back to the queue
//! - **Backoff strategies**: a closed set of named policies, chosen when a
//!   job is enqueued and stored with it
//! - **Bounded concurrency**: one worker runs up to `concurrency` jobs at a
//!   time; shutdown stops claiming and waits for the jobs in flight
//! - **Callbacks**: [`JobProcessor::on_completed`] and
//!   [`JobProcessor::on_failed`] run after the queue has recorded the outcome
//!
//! ```rust
//! use std::sync::Arc;
//! use courier_queue::prelude::*;
//! use courier_core::ids::{EnvironmentId, JobId, OrganizationId, SubscriberId};
//!
//! # tokio_test::block_on(async {
//! let adapter = QueueAdapter::new(MemoryQueueBackend::new(), QueueConfig::default());
//! let data = JobData {
//!     job_id: JobId::new(),
//!     environment_id: EnvironmentId::new(),
//!     organization_id: OrganizationId::new(),
//!     subscriber_id: SubscriberId::new(),
//! };
//!
//! let options = EnqueueOptions::new().with_backoff_named("webhook_filter").unwrap();
//! let job_id = adapter.enqueue(data, options).await.unwrap();
//! let counts = adapter.backend().counts("standard").await.unwrap();
//! assert_eq!(counts.waiting, 1);
//! # let _ = job_id;
//! # });
//! ```

pub mod adapter;
pub mod backend;
pub mod backoff;
pub mod error;
pub mod observability;
pub mod types;

pub use adapter::{EnqueueOptions, FailureInfo, JobProcessor, QueueAdapter, QueueConfig, WorkerHandle};
pub use backend::{BoxStream, LeaseReaper, MemoryQueueBackend, QueueBackend};
pub use backoff::BackoffStrategy;
pub use error::{JobError, QueueError, QueueResult};
pub use observability::{LiveMetrics, QueueMetrics};
pub use types::{
    ClaimedJob, JobData, LeaseToken, QueueCounts, QueueEvent, QueueMessage, QueueRecord, QueueStatus,
    ReclaimOutcome,
};

#[cfg(feature = "redis")]
pub use backend::RedisQueueBackend;

pub mod prelude {
    pub use crate::adapter::{EnqueueOptions, FailureInfo, JobProcessor, QueueAdapter, QueueConfig, WorkerHandle};
    pub use crate::backend::{MemoryQueueBackend, QueueBackend};
    pub use crate::backoff::BackoffStrategy;
    pub use crate::error::{JobError, QueueError, QueueResult};
    pub use crate::types::{JobData, QueueEvent, QueueRecord, QueueStatus};
}
