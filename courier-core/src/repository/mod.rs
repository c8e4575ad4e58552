//! Persistence contracts for the entities the engine reads and mutates.
//!
//! Storage engines live outside this workspace; the in-memory versions in
//! [`memory`] back the tests and single-process deployments.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;

use crate::entities::{ExecutionDetail, JobEntity, JobStatus, NotificationEntity};
use crate::error::RepositoryResult;
use crate::ids::{EnvironmentId, JobId, NotificationId, SubscriberId, TemplateId};

pub use memory::{MemoryExecutionDetailsRepository, MemoryJobRepository, MemoryNotificationRepository};

#[async_trait]
pub trait NotificationRepository: Send + Sync {
    async fn create(&self, notification: NotificationEntity) -> RepositoryResult<NotificationEntity>;

    async fn find_by_id(&self, environment_id: &EnvironmentId, id: &NotificationId) -> RepositoryResult<NotificationEntity>;
}

#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn store_jobs(&self, jobs: Vec<JobEntity>) -> RepositoryResult<Vec<JobEntity>>;

    async fn find_by_id(&self, environment_id: &EnvironmentId, id: &JobId) -> RepositoryResult<JobEntity>;

    async fn update_status(&self, environment_id: &EnvironmentId, id: &JobId, status: JobStatus) -> RepositoryResult<()>;

    /// Record the latest error and bump the attempt counter.
    async fn record_failure(&self, environment_id: &EnvironmentId, id: &JobId, error: &str) -> RepositoryResult<()>;

    /// The pending child of `parent_id`, if any.
    async fn find_next(&self, environment_id: &EnvironmentId, parent_id: &JobId) -> RepositoryResult<Option<JobEntity>>;

    async fn find_by_notification(
        &self,
        environment_id: &EnvironmentId,
        notification_id: &NotificationId,
    ) -> RepositoryResult<Vec<JobEntity>>;

    /// A pending digest job collecting events for the same subscriber, template
    /// and digest key.
    async fn find_pending_digest(
        &self,
        environment_id: &EnvironmentId,
        subscriber_id: &SubscriberId,
        template_id: &TemplateId,
        digest_key_value: Option<&str>,
    ) -> RepositoryResult<Option<JobEntity>>;
}

#[async_trait]
pub trait ExecutionDetailsRepository: Send + Sync {
    async fn create(&self, detail: ExecutionDetail) -> RepositoryResult<ExecutionDetail>;

    async fn find_by_job(&self, environment_id: &EnvironmentId, job_id: &JobId) -> RepositoryResult<Vec<ExecutionDetail>>;
}

/// The repositories the engine needs, shared across services.
#[derive(Clone)]
pub struct Repositories {
    pub notifications: Arc<dyn NotificationRepository>,
    pub jobs: Arc<dyn JobRepository>,
    pub execution_details: Arc<dyn ExecutionDetailsRepository>,
}

impl Repositories {
    pub fn new(
        notifications: Arc<dyn NotificationRepository>,
        jobs: Arc<dyn JobRepository>,
        execution_details: Arc<dyn ExecutionDetailsRepository>,
    ) -> Self {
        Self {
            notifications,
            jobs,
            execution_details,
        }
    }

    /// In-memory repositories for tests and single-process runs
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryNotificationRepository::new()),
            Arc::new(MemoryJobRepository::new()),
            Arc::new(MemoryExecutionDetailsRepository::new()),
        )
    }
}
