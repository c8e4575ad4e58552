use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::notification::NotificationEntity;
use super::step::{StepDefinition, StepType};
use crate::ids::{EnvironmentId, JobId, NotificationId, OrganizationId, SubscriberId, TemplateId, TransactionId};

/// Persistent job lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// One step of one workflow execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEntity {
    pub id: JobId,
    /// Previous job in the chain; the next job is found by this link
    pub parent_id: Option<JobId>,
    pub notification_id: NotificationId,
    pub environment_id: EnvironmentId,
    pub organization_id: OrganizationId,
    pub subscriber_id: SubscriberId,
    pub template_id: TemplateId,
    pub transaction_id: TransactionId,
    pub actor_id: Option<SubscriberId>,
    pub step: StepDefinition,
    pub provider_id: Option<String>,
    pub payload: Value,
    pub overrides: Value,
    pub status: JobStatus,
    pub error: Option<String>,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobEntity {
    /// A pending job for `step`, inheriting ids and payload from its notification.
    pub fn for_step(notification: &NotificationEntity, step: StepDefinition) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            parent_id: None,
            notification_id: notification.id.clone(),
            environment_id: notification.environment_id.clone(),
            organization_id: notification.organization_id.clone(),
            subscriber_id: notification.subscriber_id.clone(),
            template_id: notification.template_id.clone(),
            transaction_id: notification.transaction_id.clone(),
            actor_id: None,
            step,
            provider_id: None,
            payload: notification.payload.clone(),
            overrides: Value::Null,
            status: JobStatus::Pending,
            error: None,
            attempts: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn step_type(&self) -> StepType {
        self.step.step_type
    }

    /// Value of the digest key in the payload, if the step digests by key.
    pub fn digest_key_value(&self) -> Option<String> {
        let key = self.step.digest_metadata()?.digest_key.as_ref()?;
        match self.payload.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }
}
