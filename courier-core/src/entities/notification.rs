use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::step::{StepDefinition, StepType};
use crate::ids::{EnvironmentId, NotificationId, OrganizationId, SubscriberId, TemplateId, TransactionId};

/// One end-to-end workflow execution. Jobs reference it by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEntity {
    pub id: NotificationId,
    pub environment_id: EnvironmentId,
    pub organization_id: OrganizationId,
    pub subscriber_id: SubscriberId,
    pub template_id: TemplateId,
    pub transaction_id: TransactionId,
    pub channels: Vec<StepType>,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

/// Workflow template steps are executed from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    pub id: TemplateId,
    pub name: String,
    pub trigger_identifier: String,
    pub active: bool,
    pub steps: Vec<StepDefinition>,
}

impl WorkflowTemplate {
    pub fn new(name: impl Into<String>, trigger_identifier: impl Into<String>, steps: Vec<StepDefinition>) -> Self {
        Self {
            id: TemplateId::new(),
            name: name.into(),
            trigger_identifier: trigger_identifier.into(),
            active: true,
            steps,
        }
    }
}

/// Recipient of a triggered workflow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscriber {
    pub id: SubscriberId,
    /// Customer supplied identifier
    pub subscriber_id: String,
    pub environment_id: EnvironmentId,
    pub organization_id: OrganizationId,
}

impl Subscriber {
    pub fn new(subscriber_id: impl Into<String>, environment_id: EnvironmentId, organization_id: OrganizationId) -> Self {
        Self {
            id: SubscriberId::new(),
            subscriber_id: subscriber_id.into(),
            environment_id,
            organization_id,
        }
    }
}
