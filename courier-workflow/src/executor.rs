use async_trait::async_trait;
use tracing::info;

use courier_core::entities::JobEntity;
use courier_core::CourierResult;

/// Delivers one job's step (renders and hands it to a channel provider).
///
/// Errors that are worth retrying must be retryable [`courier_core::CourierError`]
/// kinds, e.g. `BackendTransient` while a webhook filter cannot be evaluated.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(&self, job: &JobEntity) -> CourierResult<()>;
}

/// Logs each step instead of delivering it
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingStepExecutor;

#[async_trait]
impl StepExecutor for LoggingStepExecutor {
    async fn execute(&self, job: &JobEntity) -> CourierResult<()> {
        info!(
            job_id = %job.id,
            step = %job.step_type(),
            provider = job.provider_id.as_deref().unwrap_or("-"),
            subscriber_id = %job.subscriber_id,
            "Executing step"
        );
        Ok(())
    }
}
