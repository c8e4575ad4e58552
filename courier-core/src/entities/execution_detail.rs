use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::job::JobEntity;
use crate::ids::{EnvironmentId, ExecutionDetailId, JobId, NotificationId, OrganizationId, SubscriberId, TransactionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionDetailStatus {
    Pending,
    Success,
    Warning,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionDetailSource {
    Internal,
    Webhook,
}

/// Audit entry describing something that happened while executing a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionDetail {
    pub id: ExecutionDetailId,
    pub job_id: JobId,
    pub notification_id: NotificationId,
    pub environment_id: EnvironmentId,
    pub organization_id: OrganizationId,
    pub subscriber_id: SubscriberId,
    pub transaction_id: TransactionId,
    pub status: ExecutionDetailStatus,
    pub source: ExecutionDetailSource,
    pub detail: String,
    /// Raw error or provider response
    pub raw: Option<String>,
    pub is_retry: bool,
    pub created_at: DateTime<Utc>,
}

impl ExecutionDetail {
    pub fn for_job(job: &JobEntity, status: ExecutionDetailStatus, detail: impl Into<String>) -> Self {
        Self {
            id: ExecutionDetailId::new(),
            job_id: job.id.clone(),
            notification_id: job.notification_id.clone(),
            environment_id: job.environment_id.clone(),
            organization_id: job.organization_id.clone(),
            subscriber_id: job.subscriber_id.clone(),
            transaction_id: job.transaction_id.clone(),
            status,
            source: ExecutionDetailSource::Internal,
            detail: detail.into(),
            raw: None,
            is_retry: false,
            created_at: Utc::now(),
        }
    }

    pub fn with_raw(mut self, raw: impl Into<String>) -> Self {
        self.raw = Some(raw.into());
        self
    }

    pub fn with_source(mut self, source: ExecutionDetailSource) -> Self {
        self.source = source;
        self
    }

    pub fn retry(mut self) -> Self {
        self.is_retry = true;
        self
    }
}
