use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use courier_core::ids::JobId;

use super::{LeaseToken, QueueMessage};
use crate::{QueueError, QueueResult};

/// Queue-side job status lifecycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QueueStatus {
    /// Ready to be claimed
    Waiting,

    /// Scheduled for later, either an initial delay or a backoff retry
    Delayed { run_at: DateTime<Utc> },

    /// Claimed by a worker
    Active { lease_until: DateTime<Utc> },

    Completed { completed_at: DateTime<Utc> },

    /// Failed for good (attempts exhausted or permanent error)
    Failed { failed_at: DateTime<Utc>, error: String },
}

impl QueueStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed { .. })
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active { .. })
    }

    /// Check if the job can be claimed at `now`
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        match self {
            Self::Waiting => true,
            Self::Delayed { run_at } => *run_at <= now,
            _ => false,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Delayed { .. } => "delayed",
            Self::Active { .. } => "active",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
        }
    }
}

/// Job record - mutable runtime state stored by backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueRecord {
    pub job_id: JobId,

    /// Immutable submission data
    pub message: QueueMessage,

    pub status: QueueStatus,

    /// Claims made so far; the running attempt counts once claimed
    pub attempts_made: u32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    pub last_error: Option<String>,

    /// Current lease token (if active)
    pub lease_token: Option<LeaseToken>,

    /// When the current lease expires (if active)
    pub lease_until: Option<DateTime<Utc>>,
}

impl QueueRecord {
    pub fn new(message: QueueMessage) -> Self {
        let now = Utc::now();
        let status = if message.run_at > now {
            QueueStatus::Delayed { run_at: message.run_at }
        } else {
            QueueStatus::Waiting
        };

        Self {
            job_id: message.job_id.clone(),
            message,
            status,
            attempts_made: 0,
            created_at: now,
            updated_at: now,
            last_error: None,
            lease_token: None,
            lease_until: None,
        }
    }

    /// Whether another attempt is allowed after the current one
    pub fn has_attempts_left(&self) -> bool {
        self.attempts_made < self.message.attempts
    }

    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        match (&self.status, &self.lease_until) {
            (QueueStatus::Active { .. }, Some(lease_until)) => *lease_until < now,
            _ => false,
        }
    }

    /// Claim the record for one attempt
    pub fn start_attempt(&mut self, lease_token: LeaseToken, lease_until: DateTime<Utc>) {
        self.attempts_made += 1;
        self.lease_token = Some(lease_token);
        self.lease_until = Some(lease_until);
        self.update_status(QueueStatus::Active { lease_until });
    }

    /// Push the running attempt's lease out to `lease_until`
    pub fn extend_lease(&mut self, lease_until: DateTime<Utc>) {
        self.lease_until = Some(lease_until);
        self.update_status(QueueStatus::Active { lease_until });
    }

    pub fn complete(&mut self) {
        self.clear_lease();
        self.update_status(QueueStatus::Completed {
            completed_at: Utc::now(),
        });
    }

    pub fn schedule_retry(&mut self, run_at: DateTime<Utc>, error: String) {
        self.clear_lease();
        self.last_error = Some(error);
        self.update_status(QueueStatus::Delayed { run_at });
    }

    pub fn fail(&mut self, error: String) {
        self.clear_lease();
        self.last_error = Some(error.clone());
        self.update_status(QueueStatus::Failed {
            failed_at: Utc::now(),
            error,
        });
    }

    /// Give an expired claim back to the queue without counting it as a failure
    pub fn release_lease(&mut self) {
        self.clear_lease();
        self.update_status(QueueStatus::Waiting);
    }

    /// Check that `token` owns the current lease
    pub fn owns_lease(&self, token: &LeaseToken) -> bool {
        self.lease_token.as_ref() == Some(token)
    }

    /// Check an ack: the job must be live and `token` must hold an unexpired lease
    pub fn check_lease(&self, token: &LeaseToken, now: DateTime<Utc>) -> QueueResult<()> {
        if self.status.is_terminal() {
            return Err(QueueError::JobAlreadyTerminal);
        }
        if !self.owns_lease(token) {
            return Err(QueueError::InvalidLeaseToken);
        }
        if self.lease_expired(now) {
            return Err(QueueError::LeaseExpired);
        }
        Ok(())
    }

    fn clear_lease(&mut self) {
        self.lease_token = None;
        self.lease_until = None;
    }

    fn update_status(&mut self, status: QueueStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

/// A job claimed by a worker, with the lease it must present to ack
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub record: QueueRecord,
    pub lease_token: LeaseToken,
    pub lease_until: DateTime<Utc>,
}

/// What one reaper pass did with expired leases
#[derive(Debug, Clone, Default)]
pub struct ReclaimOutcome {
    /// Jobs put back on the waiting list for another attempt
    pub requeued: Vec<JobId>,

    /// Jobs that ran out of attempts, as they were when they failed
    pub failed: Vec<QueueRecord>,
}

impl ReclaimOutcome {
    pub fn total(&self) -> usize {
        self.requeued.len() + self.failed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// Job counts per status for one queue
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub waiting: usize,
    pub delayed: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

impl QueueCounts {
    /// Jobs not yet in a terminal state
    pub fn pending(&self) -> usize {
        self.waiting + self.delayed + self.active
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::JobData;
    use chrono::Duration;
    use courier_core::ids::{EnvironmentId, OrganizationId, SubscriberId};

    fn message() -> QueueMessage {
        QueueMessage::new(
            JobData {
                job_id: JobId::new(),
                environment_id: EnvironmentId::new(),
                organization_id: OrganizationId::new(),
                subscriber_id: SubscriberId::new(),
            },
            "standard",
        )
        .with_attempts(2)
    }

    #[test]
    fn future_run_at_starts_delayed() {
        let record = QueueRecord::new(message().with_run_at(Utc::now() + Duration::seconds(60)));
        assert_eq!(record.status.name(), "delayed");
        assert!(!record.status.is_eligible(Utc::now()));
    }

    #[test]
    fn attempts_are_counted_on_claim() {
        let mut record = QueueRecord::new(message());
        assert!(record.has_attempts_left());

        record.start_attempt(LeaseToken::new(), Utc::now() + Duration::seconds(30));
        record.schedule_retry(Utc::now(), "hold".into());
        record.start_attempt(LeaseToken::new(), Utc::now() + Duration::seconds(30));

        assert_eq!(record.attempts_made, 2);
        assert!(!record.has_attempts_left());
        assert_eq!(record.last_error.as_deref(), Some("hold"));
    }

    #[test]
    fn expired_lease_is_detected_only_while_active() {
        let mut record = QueueRecord::new(message());
        let token = LeaseToken::new();
        record.start_attempt(token.clone(), Utc::now() - Duration::seconds(1));

        assert!(record.owns_lease(&token));
        assert!(record.lease_expired(Utc::now()));

        record.release_lease();
        assert!(!record.lease_expired(Utc::now()));
        assert_eq!(record.status, QueueStatus::Waiting);
    }
}
