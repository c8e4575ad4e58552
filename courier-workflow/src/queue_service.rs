use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use courier_core::entities::{ExecutionDetail, ExecutionDetailStatus, JobEntity, JobStatus};
use courier_core::ids::JobId;
use courier_core::repository::Repositories;
use courier_core::{CourierError, CourierResult};
use courier_queue::{BackoffStrategy, EnqueueOptions, FailureInfo, JobData, JobError, QueueAdapter};

/// Attempt ceiling for jobs retried with a backoff strategy
pub const DEFAULT_ATTEMPTS: u32 = 3;

/// Whether a failed attempt is an expected hold worth backing off for,
/// rather than a terminal error.
pub fn should_backoff(error: &JobError) -> bool {
    error.is_retryable()
}

/// Enqueues workflow jobs and applies their outcomes to job storage.
pub struct WorkflowQueueService {
    queue: QueueAdapter,
    repositories: Repositories,
    backoff: BackoffStrategy,
}

impl WorkflowQueueService {
    pub fn new(queue: QueueAdapter, repositories: Repositories) -> Self {
        Self {
            queue,
            repositories,
            backoff: BackoffStrategy::WebhookFilter,
        }
    }

    /// Strategy attached to webhook-gated jobs
    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn queue(&self) -> &QueueAdapter {
        &self.queue
    }

    pub fn repositories(&self) -> &Repositories {
        &self.repositories
    }

    /// Submit `job` to the queue, optionally after `delay`.
    ///
    /// Jobs behind a webhook filter get the backoff strategy and the attempt
    /// ceiling; everything else runs with the queue defaults.
    #[instrument(skip(self, job), fields(job_id = %job.id, step = %job.step_type()))]
    pub async fn enqueue_job(&self, job: &JobEntity, delay: Option<Duration>) -> CourierResult<JobId> {
        let mut options = EnqueueOptions::new().with_group(job.organization_id.as_str());
        if let Some(delay) = delay {
            options = options.with_delay(delay);
        }
        if job.step.has_webhook_filter() {
            options = options.with_backoff(self.backoff.clone()).with_attempts(DEFAULT_ATTEMPTS);
        }

        let data = JobData {
            job_id: job.id.clone(),
            environment_id: job.environment_id.clone(),
            organization_id: job.organization_id.clone(),
            subscriber_id: job.subscriber_id.clone(),
        };
        self.queue
            .enqueue(data, options)
            .await
            .map_err(|e| CourierError::BackendTransient(format!("Failed to enqueue job {}: {}", job.id, e)))
    }

    /// Enqueue the pending job that follows `job`, if any.
    pub async fn queue_next_job(&self, job: &JobEntity) -> CourierResult<Option<JobId>> {
        let next = self.repositories.jobs.find_next(&job.environment_id, &job.id).await?;
        let Some(next) = next else {
            debug!(job_id = %job.id, "No next job in chain");
            return Ok(None);
        };

        let queued = self.enqueue_job(&next, next.step.queue_delay()).await?;
        debug!(job_id = %job.id, next_job_id = %queued, "Queued next job");
        Ok(Some(queued))
    }

    /// Mark the job completed and continue the chain. A job that is already
    /// completed is left alone, so the chain advances once.
    #[instrument(skip_all, fields(job_id = %data.job_id))]
    pub async fn on_job_completed(&self, data: &JobData) -> CourierResult<()> {
        let jobs = &self.repositories.jobs;
        let mut job = jobs.find_by_id(&data.environment_id, &data.job_id).await?;
        if job.status == JobStatus::Completed {
            debug!("Job already completed");
            return Ok(());
        }

        jobs.update_status(&data.environment_id, &data.job_id, JobStatus::Completed)
            .await?;
        job.status = JobStatus::Completed;
        self.record_detail(ExecutionDetail::for_job(&job, ExecutionDetailStatus::Success, "Job completed"))
            .await;
        self.queue_next_job(&job).await?;
        Ok(())
    }

    /// Apply a failed attempt to job storage.
    ///
    /// A scheduled retry only records the error. A final failure marks the
    /// job failed, writes a failed execution detail with the raw error and
    /// moves on to the next job unless the step stops on failure.
    #[instrument(skip_all, fields(job_id = %data.job_id, attempt = info.attempts_made))]
    pub async fn on_job_failed(&self, data: &JobData, error: &JobError, info: &FailureInfo) -> CourierResult<()> {
        let repositories = &self.repositories;
        let job = repositories.jobs.find_by_id(&data.environment_id, &data.job_id).await?;
        repositories
            .jobs
            .record_failure(&data.environment_id, &data.job_id, error.message())
            .await?;

        if should_backoff(error) && info.will_retry {
            repositories
                .jobs
                .update_status(&data.environment_id, &data.job_id, JobStatus::Pending)
                .await?;
            let detail = ExecutionDetail::for_job(&job, ExecutionDetailStatus::Warning, "Job will be retried")
                .with_raw(error.message())
                .retry();
            self.record_detail(detail).await;
            return Ok(());
        }

        repositories
            .jobs
            .update_status(&data.environment_id, &data.job_id, JobStatus::Failed)
            .await?;
        let detail = ExecutionDetail::for_job(&job, ExecutionDetailStatus::Failed, "Job failed")
            .with_raw(error.message());
        self.record_detail(detail).await;

        if job.step.should_stop_on_fail {
            info!("Step stops on failure, not continuing the workflow");
            return Ok(());
        }
        self.queue_next_job(&job).await?;
        Ok(())
    }

    async fn record_detail(&self, detail: ExecutionDetail) {
        if let Err(e) = self.repositories.execution_details.create(detail).await {
            warn!("Failed to record execution detail: {}", e);
        }
    }
}
