use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use courier_core::entities::{ChannelType, JobEntity, NotificationEntity, StepDefinition, Subscriber, WorkflowTemplate};
use courier_core::ids::{EnvironmentId, JobId, NotificationId, OrganizationId, SubscriberId, TransactionId};
use courier_core::repository::NotificationRepository;
use courier_core::{CourierError, CourierResult};

use crate::digest::DigestFilter;

/// Provider integration to use per delivery channel
pub type TemplateProviderIds = HashMap<ChannelType, String>;

/// One trigger of a workflow for one subscriber
#[derive(Debug, Clone)]
pub struct TriggerRequest {
    pub environment_id: EnvironmentId,
    pub organization_id: OrganizationId,
    pub transaction_id: TransactionId,
    pub payload: Value,
    pub overrides: Value,
    pub actor_id: Option<SubscriberId>,
}

impl TriggerRequest {
    pub fn new(environment_id: EnvironmentId, organization_id: OrganizationId, payload: Value) -> Self {
        Self {
            environment_id,
            organization_id,
            transaction_id: TransactionId::new(),
            payload,
            overrides: Value::Null,
            actor_id: None,
        }
    }

    pub fn with_transaction_id(mut self, transaction_id: TransactionId) -> Self {
        self.transaction_id = transaction_id;
        self
    }

    pub fn with_overrides(mut self, overrides: Value) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn with_actor(mut self, actor_id: SubscriberId) -> Self {
        self.actor_id = Some(actor_id);
        self
    }
}

/// Expands a workflow template into the notification and its ordered jobs.
///
/// Jobs come back linked (`parent_id` points at the previous job) but not
/// stored; storing and enqueueing them is up to the caller.
pub struct NotificationJobBuilder {
    notifications: Arc<dyn NotificationRepository>,
    digest_filter: Arc<dyn DigestFilter>,
}

impl NotificationJobBuilder {
    pub fn new(notifications: Arc<dyn NotificationRepository>, digest_filter: Arc<dyn DigestFilter>) -> Self {
        Self {
            notifications,
            digest_filter,
        }
    }

    #[instrument(skip_all, fields(template_id = %template.id, transaction_id = %trigger.transaction_id))]
    pub async fn build(
        &self,
        trigger: &TriggerRequest,
        template: &WorkflowTemplate,
        subscriber: &Subscriber,
        template_provider_ids: &TemplateProviderIds,
    ) -> CourierResult<(NotificationEntity, Vec<JobEntity>)> {
        let mut steps: Vec<StepDefinition> = template.steps.iter().filter(|step| step.active).cloned().collect();

        let notification = NotificationEntity {
            id: NotificationId::new(),
            environment_id: trigger.environment_id.clone(),
            organization_id: trigger.organization_id.clone(),
            subscriber_id: subscriber.id.clone(),
            template_id: template.id.clone(),
            transaction_id: trigger.transaction_id.clone(),
            channels: steps.iter().map(|step| step.step_type).collect(),
            payload: trigger.payload.clone(),
            created_at: Utc::now(),
        };
        let notification = self
            .notifications
            .create(notification)
            .await
            .map_err(|e| CourierError::api(format!("Failed to create notification: {e}")))?;

        let digest_steps = steps.iter().filter(|step| step.step_type.is_digest()).count();
        if digest_steps > 1 {
            warn!(digest_steps, "Template has several digest steps; only the first one is honored");
        }
        if let Some(digest_index) = steps.iter().position(|step| step.step_type.is_digest()) {
            let tail = steps.split_off(digest_index);
            let filtered = self.digest_filter.filter(&notification, tail).await?;
            steps.extend(filtered);
        }

        let mut jobs = Vec::with_capacity(steps.len());
        let mut parent_id: Option<JobId> = None;
        for step in steps {
            let Some(template_ref) = &step.template else {
                return Err(CourierError::api(format!("Step template was not found for step {}", step.id)));
            };
            let provider_id = step
                .step_type
                .channel()
                .or_else(|| template_ref.step_type.channel())
                .and_then(|channel| template_provider_ids.get(&channel).cloned());

            let mut job = JobEntity::for_step(&notification, step);
            job.parent_id = parent_id.replace(job.id.clone());
            job.provider_id = provider_id;
            job.overrides = trigger.overrides.clone();
            job.actor_id = trigger.actor_id.clone();
            jobs.push(job);
        }

        debug!(notification_id = %notification.id, jobs = jobs.len(), "Built notification jobs");
        Ok((notification, jobs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::PassThroughDigestFilter;
    use async_trait::async_trait;
    use courier_core::entities::StepType;
    use courier_core::error::{RepositoryError, RepositoryResult};
    use courier_core::repository::MemoryNotificationRepository;

    struct BrokenNotifications;

    #[async_trait]
    impl NotificationRepository for BrokenNotifications {
        async fn create(&self, _notification: NotificationEntity) -> RepositoryResult<NotificationEntity> {
            Err(RepositoryError::Backend("connection reset".into()))
        }

        async fn find_by_id(
            &self,
            _environment_id: &EnvironmentId,
            id: &NotificationId,
        ) -> RepositoryResult<NotificationEntity> {
            Err(RepositoryError::not_found("Notification", id.as_str()))
        }
    }

    fn fixtures() -> (TriggerRequest, Subscriber) {
        let environment_id = EnvironmentId::new();
        let organization_id = OrganizationId::new();
        let subscriber = Subscriber::new("user-1", environment_id.clone(), organization_id.clone());
        let trigger = TriggerRequest::new(environment_id, organization_id, serde_json::json!({"name": "Ada"}));
        (trigger, subscriber)
    }

    #[tokio::test]
    async fn notification_failure_builds_no_jobs() {
        let builder = NotificationJobBuilder::new(Arc::new(BrokenNotifications), Arc::new(PassThroughDigestFilter));
        let (trigger, subscriber) = fixtures();
        let template = WorkflowTemplate::new("welcome", "welcome", vec![StepDefinition::new("a", StepType::Email)]);

        let err = builder
            .build(&trigger, &template, &subscriber, &TemplateProviderIds::new())
            .await
            .unwrap_err();

        assert!(matches!(err, CourierError::Api(ref msg) if msg.contains("connection reset")));
    }

    #[tokio::test]
    async fn step_without_template_is_rejected() {
        let notifications = Arc::new(MemoryNotificationRepository::new());
        let builder = NotificationJobBuilder::new(notifications.clone(), Arc::new(PassThroughDigestFilter));
        let (trigger, subscriber) = fixtures();
        let template = WorkflowTemplate::new(
            "welcome",
            "welcome",
            vec![StepDefinition::new("a", StepType::Sms).without_template()],
        );

        let err = builder
            .build(&trigger, &template, &subscriber, &TemplateProviderIds::new())
            .await
            .unwrap_err();

        assert!(matches!(err, CourierError::Api(_)));
        assert_eq!(notifications.len(), 1);
    }

    #[tokio::test]
    async fn jobs_are_chained_and_get_channel_providers() {
        let builder = NotificationJobBuilder::new(
            Arc::new(MemoryNotificationRepository::new()),
            Arc::new(PassThroughDigestFilter),
        );
        let (trigger, subscriber) = fixtures();
        let template = WorkflowTemplate::new(
            "welcome",
            "welcome",
            vec![StepDefinition::new("a", StepType::Email), StepDefinition::new("b", StepType::Sms)],
        );
        let providers = TemplateProviderIds::from([(ChannelType::Email, "sendgrid".to_string())]);

        let (notification, jobs) = builder.build(&trigger, &template, &subscriber, &providers).await.unwrap();

        assert_eq!(notification.channels, vec![StepType::Email, StepType::Sms]);
        assert_eq!(jobs[0].parent_id, None);
        assert_eq!(jobs[1].parent_id.as_ref(), Some(&jobs[0].id));
        assert_eq!(jobs[0].provider_id.as_deref(), Some("sendgrid"));
        assert_eq!(jobs[1].provider_id, None);
        assert!(jobs.iter().all(|job| job.transaction_id == trigger.transaction_id));
        assert!(jobs.iter().all(|job| job.notification_id == notification.id));
    }
}
