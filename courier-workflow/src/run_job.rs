use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, instrument, warn};

use courier_cache::keys::{feed_scope, message_count_scope};
use courier_cache::InvalidateCacheService;
use courier_core::entities::{ExecutionDetail, ExecutionDetailStatus, JobEntity, JobStatus};
use courier_core::repository::Repositories;
use courier_core::{CourierError, CourierResult};
use courier_lock::DistributedLockManager;
use courier_queue::{FailureInfo, JobData, JobError, JobProcessor, QueueRecord};

use crate::executor::StepExecutor;
use crate::queue_service::WorkflowQueueService;

/// Lock resource guarding a job's step.
///
/// Digest jobs share one resource per subscriber digest window so merges
/// into the window serialize; other jobs only lock themselves.
pub fn lock_resource(job: &JobEntity) -> String {
    if job.step_type().is_digest() {
        let key = job.digest_key_value().unwrap_or_default();
        format!(
            "digest:{}:{}:{}:{}",
            job.environment_id, job.subscriber_id, job.template_id, key
        )
    } else {
        format!("job:{}:{}", job.environment_id, job.id)
    }
}

/// Map an engine error onto the queue's retry classification
pub fn to_job_error(err: CourierError) -> JobError {
    if err.is_retryable() {
        JobError::retryable(err.to_string())
    } else {
        JobError::permanent(err.to_string())
    }
}

/// Queue processor for workflow jobs
pub struct RunJob {
    repositories: Repositories,
    executor: Arc<dyn StepExecutor>,
    locks: Arc<DistributedLockManager>,
    invalidate: InvalidateCacheService,
    queue_service: Arc<WorkflowQueueService>,
}

impl RunJob {
    pub fn new(
        repositories: Repositories,
        executor: Arc<dyn StepExecutor>,
        locks: Arc<DistributedLockManager>,
        invalidate: InvalidateCacheService,
        queue_service: Arc<WorkflowQueueService>,
    ) -> Self {
        Self {
            repositories,
            executor,
            locks,
            invalidate,
            queue_service,
        }
    }

    /// Execute the job's step under its lock, then drop the subscriber's
    /// cached feed and counters.
    #[instrument(skip_all, fields(job_id = %data.job_id))]
    pub async fn run(&self, data: &JobData) -> CourierResult<()> {
        let jobs = &self.repositories.jobs;
        let job = jobs.find_by_id(&data.environment_id, &data.job_id).await?;
        if job.status == JobStatus::Completed {
            debug!("Job already completed");
            return Ok(());
        }
        jobs.update_status(&job.environment_id, &job.id, JobStatus::Running)
            .await?;

        let resource = lock_resource(&job);
        let outcome = self
            .locks
            .with_lock(&resource, self.locks.default_ttl(), || self.executor.execute(&job))
            .await;
        match outcome {
            Ok(result) => result?,
            Err(e) => {
                let detail =
                    ExecutionDetail::for_job(&job, ExecutionDetailStatus::Warning, format!("Could not lock {resource}"))
                        .with_raw(e.to_string());
                if let Err(err) = self.repositories.execution_details.create(detail).await {
                    warn!("Failed to record execution detail: {}", err);
                }
                return Err(e.into());
            }
        }

        self.invalidate
            .invalidate_query(&feed_scope(&job.environment_id, &job.subscriber_id))
            .await;
        self.invalidate
            .invalidate_query(&message_count_scope(&job.environment_id, &job.subscriber_id))
            .await;
        Ok(())
    }
}

#[async_trait]
impl JobProcessor for RunJob {
    async fn process(&self, job: &QueueRecord) -> Result<(), JobError> {
        self.run(&job.message.data).await.map_err(to_job_error)
    }

    async fn on_completed(&self, job: &QueueRecord) {
        if let Err(e) = self.queue_service.on_job_completed(&job.message.data).await {
            error!(job_id = %job.job_id, "Failed to complete job: {}", e);
        }
    }

    async fn on_failed(&self, job: &QueueRecord, error: &JobError, info: &FailureInfo) {
        if let Err(e) = self.queue_service.on_job_failed(&job.message.data, error, info).await {
            error!(job_id = %job.job_id, "Failed to record job failure: {}", e);
        }
    }
}
