use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;

use super::{ExecutionDetailsRepository, JobRepository, NotificationRepository};
use crate::entities::{ExecutionDetail, JobEntity, JobStatus, NotificationEntity, StepType};
use crate::error::{RepositoryError, RepositoryResult};
use crate::ids::{EnvironmentId, JobId, NotificationId, SubscriberId, TemplateId};

#[derive(Default, Clone)]
pub struct MemoryNotificationRepository {
    notifications: Arc<RwLock<HashMap<NotificationId, NotificationEntity>>>,
}

impl MemoryNotificationRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.notifications.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.notifications.read().is_empty()
    }
}

#[async_trait]
impl NotificationRepository for MemoryNotificationRepository {
    async fn create(&self, notification: NotificationEntity) -> RepositoryResult<NotificationEntity> {
        let mut notifications = self.notifications.write();
        if notifications.contains_key(&notification.id) {
            return Err(RepositoryError::validation(
                "Notification",
                format!("duplicate id {}", notification.id),
            ));
        }
        notifications.insert(notification.id.clone(), notification.clone());
        Ok(notification)
    }

    async fn find_by_id(&self, environment_id: &EnvironmentId, id: &NotificationId) -> RepositoryResult<NotificationEntity> {
        self.notifications
            .read()
            .get(id)
            .filter(|n| &n.environment_id == environment_id)
            .cloned()
            .ok_or_else(|| RepositoryError::not_found("Notification", id.as_str()))
    }
}

/// Jobs kept in insertion order so chains read back the way they were built.
#[derive(Default, Clone)]
pub struct MemoryJobRepository {
    jobs: Arc<RwLock<Vec<JobEntity>>>,
}

impl MemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored job, in insertion order.
    pub fn all(&self) -> Vec<JobEntity> {
        self.jobs.read().clone()
    }

    fn with_job<T>(
        &self,
        environment_id: &EnvironmentId,
        id: &JobId,
        f: impl FnOnce(&mut JobEntity) -> T,
    ) -> RepositoryResult<T> {
        let mut jobs = self.jobs.write();
        let job = jobs
            .iter_mut()
            .find(|job| &job.id == id && &job.environment_id == environment_id)
            .ok_or_else(|| RepositoryError::not_found("Job", id.as_str()))?;
        job.updated_at = Utc::now();
        Ok(f(job))
    }
}

#[async_trait]
impl JobRepository for MemoryJobRepository {
    async fn store_jobs(&self, jobs: Vec<JobEntity>) -> RepositoryResult<Vec<JobEntity>> {
        let mut stored = self.jobs.write();
        if let Some(duplicate) = jobs.iter().find(|job| stored.iter().any(|s| s.id == job.id)) {
            return Err(RepositoryError::validation("Job", format!("duplicate id {}", duplicate.id)));
        }
        stored.extend(jobs.iter().cloned());
        Ok(jobs)
    }

    async fn find_by_id(&self, environment_id: &EnvironmentId, id: &JobId) -> RepositoryResult<JobEntity> {
        self.jobs
            .read()
            .iter()
            .find(|job| &job.id == id && &job.environment_id == environment_id)
            .cloned()
            .ok_or_else(|| RepositoryError::not_found("Job", id.as_str()))
    }

    async fn update_status(&self, environment_id: &EnvironmentId, id: &JobId, status: JobStatus) -> RepositoryResult<()> {
        self.with_job(environment_id, id, |job| job.status = status)
    }

    async fn record_failure(&self, environment_id: &EnvironmentId, id: &JobId, error: &str) -> RepositoryResult<()> {
        self.with_job(environment_id, id, |job| {
            job.error = Some(error.to_string());
            job.attempts += 1;
        })
    }

    async fn find_next(&self, environment_id: &EnvironmentId, parent_id: &JobId) -> RepositoryResult<Option<JobEntity>> {
        Ok(self
            .jobs
            .read()
            .iter()
            .find(|job| {
                &job.environment_id == environment_id
                    && job.parent_id.as_ref() == Some(parent_id)
                    && job.status == JobStatus::Pending
            })
            .cloned())
    }

    async fn find_by_notification(
        &self,
        environment_id: &EnvironmentId,
        notification_id: &NotificationId,
    ) -> RepositoryResult<Vec<JobEntity>> {
        Ok(self
            .jobs
            .read()
            .iter()
            .filter(|job| &job.environment_id == environment_id && &job.notification_id == notification_id)
            .cloned()
            .collect())
    }

    async fn find_pending_digest(
        &self,
        environment_id: &EnvironmentId,
        subscriber_id: &SubscriberId,
        template_id: &TemplateId,
        digest_key_value: Option<&str>,
    ) -> RepositoryResult<Option<JobEntity>> {
        Ok(self
            .jobs
            .read()
            .iter()
            .find(|job| {
                job.step_type() == StepType::Digest
                    && job.status == JobStatus::Pending
                    && &job.environment_id == environment_id
                    && &job.subscriber_id == subscriber_id
                    && &job.template_id == template_id
                    && job.digest_key_value().as_deref() == digest_key_value
            })
            .cloned())
    }
}

#[derive(Default, Clone)]
pub struct MemoryExecutionDetailsRepository {
    details: Arc<RwLock<Vec<ExecutionDetail>>>,
}

impl MemoryExecutionDetailsRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<ExecutionDetail> {
        self.details.read().clone()
    }
}

#[async_trait]
impl ExecutionDetailsRepository for MemoryExecutionDetailsRepository {
    async fn create(&self, detail: ExecutionDetail) -> RepositoryResult<ExecutionDetail> {
        if detail.detail.trim().is_empty() {
            return Err(RepositoryError::validation("ExecutionDetail", "detail must not be empty"));
        }
        self.details.write().push(detail.clone());
        Ok(detail)
    }

    async fn find_by_job(&self, environment_id: &EnvironmentId, job_id: &JobId) -> RepositoryResult<Vec<ExecutionDetail>> {
        Ok(self
            .details
            .read()
            .iter()
            .filter(|d| &d.environment_id == environment_id && &d.job_id == job_id)
            .cloned()
            .collect())
    }
}
