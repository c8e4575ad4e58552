use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use courier_core::ids::{EnvironmentId, JobId, OrganizationId, SubscriberId};

use crate::backoff::BackoffStrategy;

/// Reference payload carried by a queued job. The job itself lives in the
/// job repository; the queue only needs enough to find it again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobData {
    pub job_id: JobId,
    pub environment_id: EnvironmentId,
    pub organization_id: OrganizationId,
    pub subscriber_id: SubscriberId,
}

/// Job message - immutable submission data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    /// Queue-level id; adding the same id twice while it is live is a no-op
    pub job_id: JobId,

    pub data: JobData,

    /// Target queue name
    pub queue: String,

    /// Total attempts allowed, the first run included
    pub attempts: u32,

    /// Retry delay policy; `None` retries immediately
    pub backoff: Option<BackoffStrategy>,

    /// When the job becomes eligible for processing
    pub run_at: DateTime<Utc>,

    /// Drop the record once the job completes
    pub remove_on_complete: bool,

    /// Drop the record once the job fails for good
    pub remove_on_fail: bool,

    /// Fairness group (e.g. an organization) for backends that support it
    pub group: Option<String>,
}

impl QueueMessage {
    pub fn new(data: JobData, queue: impl Into<String>) -> Self {
        Self {
            job_id: data.job_id.clone(),
            data,
            queue: queue.into(),
            attempts: 1,
            backoff: None,
            run_at: Utc::now(),
            remove_on_complete: true,
            remove_on_fail: true,
            group: None,
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn with_run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = run_at;
        self
    }

    pub fn keep_records(mut self) -> Self {
        self.remove_on_complete = false;
        self.remove_on_fail = false;
        self
    }

    /// Check if the job is eligible to run now
    pub fn is_eligible(&self) -> bool {
        self.run_at <= Utc::now()
    }
}
