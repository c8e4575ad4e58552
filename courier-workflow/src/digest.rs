use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use courier_core::entities::{JobEntity, NotificationEntity, StepDefinition};
use courier_core::repository::JobRepository;
use courier_core::CourierResult;

/// Decides which steps of a triggered workflow still need jobs once a
/// digest step is involved.
#[async_trait]
pub trait DigestFilter: Send + Sync {
    /// `steps` starts at the digest step and holds every active step after
    /// it, in template order. The result replaces them.
    async fn filter(&self, notification: &NotificationEntity, steps: Vec<StepDefinition>)
        -> CourierResult<Vec<StepDefinition>>;
}

/// Keeps every step
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThroughDigestFilter;

#[async_trait]
impl DigestFilter for PassThroughDigestFilter {
    async fn filter(&self, _notification: &NotificationEntity, steps: Vec<StepDefinition>) -> CourierResult<Vec<StepDefinition>> {
        Ok(steps)
    }
}

/// Merges a trigger into a digest that is already collecting events.
///
/// When a pending digest job exists for the same subscriber, template and
/// digest key, that job will deliver the digested steps, so this trigger
/// drops the digest and everything after it. Otherwise the trigger opens a
/// new digest window and keeps every step.
pub struct MergingDigestFilter {
    jobs: Arc<dyn JobRepository>,
}

impl MergingDigestFilter {
    pub fn new(jobs: Arc<dyn JobRepository>) -> Self {
        Self { jobs }
    }
}

#[async_trait]
impl DigestFilter for MergingDigestFilter {
    async fn filter(&self, notification: &NotificationEntity, steps: Vec<StepDefinition>) -> CourierResult<Vec<StepDefinition>> {
        let Some(digest_step) = steps.first() else {
            return Ok(steps);
        };

        // The key value is read the same way the pending job exposes it.
        let probe = JobEntity::for_step(notification, digest_step.clone());
        let key_value = probe.digest_key_value();

        let pending = self
            .jobs
            .find_pending_digest(
                &notification.environment_id,
                &notification.subscriber_id,
                &notification.template_id,
                key_value.as_deref(),
            )
            .await?;

        if let Some(pending) = pending {
            debug!(
                digest_job_id = %pending.id,
                notification_id = %notification.id,
                "Merging trigger into pending digest"
            );
            return Ok(Vec::new());
        }
        Ok(steps)
    }
}
