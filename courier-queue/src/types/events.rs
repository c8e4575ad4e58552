use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use courier_core::ids::JobId;

/// Lifecycle events published by a queue backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QueueEvent {
    Added {
        job_id: JobId,
        queue: String,
        run_at: DateTime<Utc>,
        at: DateTime<Utc>,
    },

    /// Job was claimed by a worker
    Claimed {
        job_id: JobId,
        attempt: u32,
        lease_until: DateTime<Utc>,
        at: DateTime<Utc>,
    },

    Retrying {
        job_id: JobId,
        retry_at: DateTime<Utc>,
        error: String,
        at: DateTime<Utc>,
    },

    Completed {
        job_id: JobId,
        at: DateTime<Utc>,
    },

    /// Job failed for good
    Failed {
        job_id: JobId,
        error: String,
        at: DateTime<Utc>,
    },
}

impl QueueEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Added { .. } => "added",
            Self::Claimed { .. } => "claimed",
            Self::Retrying { .. } => "retrying",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
        }
    }

    pub fn job_id(&self) -> &JobId {
        match self {
            Self::Added { job_id, .. }
            | Self::Claimed { job_id, .. }
            | Self::Retrying { job_id, .. }
            | Self::Completed { job_id, .. }
            | Self::Failed { job_id, .. } => job_id,
        }
    }

    pub fn timestamp(&self) -> &DateTime<Utc> {
        match self {
            Self::Added { at, .. }
            | Self::Claimed { at, .. }
            | Self::Retrying { at, .. }
            | Self::Completed { at, .. }
            | Self::Failed { at, .. } => at,
        }
    }
}
