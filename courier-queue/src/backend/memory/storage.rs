use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::broadcast;

use courier_core::ids::JobId;

use crate::backend::{BoxStream, QueueBackend, LEASE_EXPIRED, LEASE_EXPIRED_FINAL};
use crate::types::{
    ClaimedJob, LeaseToken, QueueCounts, QueueEvent, QueueMessage, QueueRecord, QueueStatus, ReclaimOutcome,
};
use crate::{QueueError, QueueResult};

/// Terminal outcomes per queue; records may be gone once removed
#[derive(Debug, Default, Clone, Copy)]
struct Finished {
    completed: usize,
    failed: usize,
}

#[derive(Default)]
struct State {
    /// Job records indexed by job id
    jobs: HashMap<JobId, QueueRecord>,

    /// Queue name -> job ids in arrival order
    queues: HashMap<String, VecDeque<JobId>>,

    finished: HashMap<String, Finished>,
}

/// In-memory backend for testing and development
#[derive(Clone)]
pub struct MemoryQueueBackend {
    state: Arc<RwLock<State>>,

    /// Event broadcaster for observability
    event_broadcaster: broadcast::Sender<QueueEvent>,
}

impl MemoryQueueBackend {
    pub fn new() -> Self {
        let (event_broadcaster, _) = broadcast::channel(1000);

        Self {
            state: Arc::new(RwLock::new(State::default())),
            event_broadcaster,
        }
    }

    fn emit(&self, event: QueueEvent) {
        let _ = self.event_broadcaster.send(event);
    }

    /// Push an active job's lease into the past (test helper)
    pub fn force_lease_expiry(&self, job_id: &JobId) {
        let mut state = self.state.write();
        if let Some(record) = state.jobs.get_mut(job_id) {
            if let QueueStatus::Active { ref mut lease_until } = record.status {
                let expired = Utc::now() - chrono::Duration::seconds(1);
                *lease_until = expired;
                record.lease_until = Some(expired);
                record.updated_at = Utc::now();
            }
        }
    }

    /// Make a delayed job eligible now (test helper)
    pub fn promote_delayed(&self, job_id: &JobId) {
        let mut state = self.state.write();
        if let Some(record) = state.jobs.get_mut(job_id) {
            if let QueueStatus::Delayed { ref mut run_at } = record.status {
                *run_at = Utc::now();
            }
        }
    }

    /// Number of records still stored, terminal ones included
    pub fn stored_records(&self) -> usize {
        self.state.read().jobs.len()
    }
}

impl Default for MemoryQueueBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Find the record behind an ack and check the caller still owns its lease.
fn leased_record<'a>(
    jobs: &'a mut HashMap<JobId, QueueRecord>,
    job_id: &JobId,
    lease_token: &LeaseToken,
    now: DateTime<Utc>,
) -> QueueResult<&'a mut QueueRecord> {
    let record = jobs
        .get_mut(job_id)
        .ok_or_else(|| QueueError::JobNotFound(job_id.to_string()))?;
    record.check_lease(lease_token, now)?;
    Ok(record)
}

#[async_trait]
impl QueueBackend for MemoryQueueBackend {
    async fn add(&self, message: QueueMessage) -> QueueResult<JobId> {
        let mut state = self.state.write();

        if let Some(existing) = state.jobs.get(&message.job_id) {
            if !existing.status.is_terminal() {
                return Ok(existing.job_id.clone());
            }
        }

        let job_id = message.job_id.clone();
        let queue = message.queue.clone();
        let run_at = message.run_at;
        let record = QueueRecord::new(message);

        state.jobs.insert(job_id.clone(), record);
        let ids = state.queues.entry(queue.clone()).or_default();
        ids.retain(|id| id != &job_id);
        ids.push_back(job_id.clone());
        drop(state);

        self.emit(QueueEvent::Added {
            job_id: job_id.clone(),
            queue,
            run_at,
            at: Utc::now(),
        });
        Ok(job_id)
    }

    async fn claim(&self, queue: &str, lease: Duration) -> QueueResult<Option<ClaimedJob>> {
        let now = Utc::now();
        let lease = chrono::Duration::from_std(lease).map_err(|e| QueueError::InvalidConfig(e.to_string()))?;
        let mut guard = self.state.write();
        let state = &mut *guard;

        let Some(ids) = state.queues.get_mut(queue) else {
            return Ok(None);
        };
        let position = ids.iter().position(|id| {
            state
                .jobs
                .get(id)
                .map_or(false, |record| record.status.is_eligible(now))
        });
        let Some(job_id) = position.and_then(|index| ids.remove(index)) else {
            return Ok(None);
        };
        let Some(record) = state.jobs.get_mut(&job_id) else {
            return Ok(None);
        };

        let lease_token = LeaseToken::new();
        let lease_until = now + lease;
        record.start_attempt(lease_token.clone(), lease_until);
        let claimed = ClaimedJob {
            record: record.clone(),
            lease_token,
            lease_until,
        };
        drop(guard);

        self.emit(QueueEvent::Claimed {
            job_id,
            attempt: claimed.record.attempts_made,
            lease_until,
            at: now,
        });
        Ok(Some(claimed))
    }

    async fn extend_lease(
        &self,
        job_id: &JobId,
        lease_token: &LeaseToken,
        lease: Duration,
    ) -> QueueResult<DateTime<Utc>> {
        let now = Utc::now();
        let lease_until =
            now + chrono::Duration::from_std(lease).map_err(|e| QueueError::InvalidConfig(e.to_string()))?;
        let mut state = self.state.write();

        let record = leased_record(&mut state.jobs, job_id, lease_token, now)?;
        record.extend_lease(lease_until);
        Ok(lease_until)
    }

    async fn ack_complete(&self, job_id: &JobId, lease_token: &LeaseToken) -> QueueResult<()> {
        let now = Utc::now();
        let mut guard = self.state.write();
        let state = &mut *guard;

        let record = leased_record(&mut state.jobs, job_id, lease_token, now)?;
        record.complete();
        let queue = record.message.queue.clone();
        let remove = record.message.remove_on_complete;

        state.finished.entry(queue).or_default().completed += 1;
        if remove {
            state.jobs.remove(job_id);
        }
        drop(guard);

        self.emit(QueueEvent::Completed {
            job_id: job_id.clone(),
            at: now,
        });
        Ok(())
    }

    async fn ack_fail(
        &self,
        job_id: &JobId,
        lease_token: &LeaseToken,
        error: String,
        retry_at: Option<DateTime<Utc>>,
    ) -> QueueResult<()> {
        let now = Utc::now();
        let mut guard = self.state.write();
        let state = &mut *guard;

        let record = leased_record(&mut state.jobs, job_id, lease_token, now)?;
        let queue = record.message.queue.clone();

        let event = match retry_at {
            Some(retry_at) if record.has_attempts_left() => {
                record.schedule_retry(retry_at, error.clone());
                state.queues.entry(queue).or_default().push_back(job_id.clone());
                QueueEvent::Retrying {
                    job_id: job_id.clone(),
                    retry_at,
                    error,
                    at: now,
                }
            }
            _ => {
                record.fail(error.clone());
                let remove = record.message.remove_on_fail;
                state.finished.entry(queue).or_default().failed += 1;
                if remove {
                    state.jobs.remove(job_id);
                }
                QueueEvent::Failed {
                    job_id: job_id.clone(),
                    error,
                    at: now,
                }
            }
        };
        drop(guard);

        self.emit(event);
        Ok(())
    }

    async fn get_record(&self, job_id: &JobId) -> QueueResult<QueueRecord> {
        self.state
            .read()
            .jobs
            .get(job_id)
            .cloned()
            .ok_or_else(|| QueueError::JobNotFound(job_id.to_string()))
    }

    async fn counts(&self, queue: &str) -> QueueResult<QueueCounts> {
        let state = self.state.read();
        let finished = state.finished.get(queue).copied().unwrap_or_default();
        let mut counts = QueueCounts {
            completed: finished.completed,
            failed: finished.failed,
            ..QueueCounts::default()
        };

        for record in state.jobs.values().filter(|record| record.message.queue == queue) {
            match record.status {
                QueueStatus::Waiting => counts.waiting += 1,
                QueueStatus::Delayed { .. } => counts.delayed += 1,
                QueueStatus::Active { .. } => counts.active += 1,
                QueueStatus::Completed { .. } | QueueStatus::Failed { .. } => {}
            }
        }
        Ok(counts)
    }

    async fn reclaim_expired(&self, queue: &str) -> QueueResult<ReclaimOutcome> {
        let now = Utc::now();
        let mut outcome = ReclaimOutcome::default();
        {
            let mut guard = self.state.write();
            let state = &mut *guard;

            for record in state
                .jobs
                .values_mut()
                .filter(|record| record.message.queue == queue && record.lease_expired(now))
            {
                if record.has_attempts_left() {
                    record.release_lease();
                    state
                        .queues
                        .entry(queue.to_string())
                        .or_default()
                        .push_back(record.job_id.clone());
                    outcome.requeued.push(record.job_id.clone());
                } else {
                    record.fail(LEASE_EXPIRED_FINAL.to_string());
                    state.finished.entry(queue.to_string()).or_default().failed += 1;
                    outcome.failed.push(record.clone());
                }
            }

            // Failed records are kept or dropped the same way an ack would.
            for failed in outcome.failed.iter().filter(|record| record.message.remove_on_fail) {
                state.jobs.remove(&failed.job_id);
            }
        }

        for job_id in &outcome.requeued {
            self.emit(QueueEvent::Retrying {
                job_id: job_id.clone(),
                retry_at: now,
                error: LEASE_EXPIRED.to_string(),
                at: now,
            });
        }
        for record in &outcome.failed {
            self.emit(QueueEvent::Failed {
                job_id: record.job_id.clone(),
                error: LEASE_EXPIRED_FINAL.to_string(),
                at: now,
            });
        }
        Ok(outcome)
    }

    fn event_stream(&self) -> BoxStream<QueueEvent> {
        let receiver = self.event_broadcaster.subscribe();
        use tokio_stream::{wrappers::BroadcastStream, StreamExt};
        let stream = BroadcastStream::new(receiver).filter_map(|result| result.ok());

        Box::pin(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::JobData;
    use courier_core::ids::{EnvironmentId, OrganizationId, SubscriberId};
    use futures::StreamExt;

    fn message(attempts: u32) -> QueueMessage {
        QueueMessage::new(
            JobData {
                job_id: JobId::new(),
                environment_id: EnvironmentId::new(),
                organization_id: OrganizationId::new(),
                subscriber_id: SubscriberId::new(),
            },
            "standard",
        )
        .with_attempts(attempts)
    }

    #[tokio::test]
    async fn claims_in_arrival_order() {
        let backend = MemoryQueueBackend::new();
        let first = backend.add(message(1)).await.unwrap();
        let second = backend.add(message(1)).await.unwrap();

        let a = backend.claim("standard", Duration::from_secs(30)).await.unwrap().unwrap();
        let b = backend.claim("standard", Duration::from_secs(30)).await.unwrap().unwrap();

        assert_eq!(a.record.job_id, first);
        assert_eq!(b.record.job_id, second);
        assert!(backend.claim("standard", Duration::from_secs(30)).await.unwrap().is_none());
        assert!(backend.claim("other", Duration::from_secs(30)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reclaim_respects_remaining_attempts() {
        let backend = MemoryQueueBackend::new();
        let retried = backend.add(message(2)).await.unwrap();
        let exhausted = backend.add(message(1).keep_records()).await.unwrap();
        backend.claim("standard", Duration::from_secs(30)).await.unwrap();
        backend.claim("standard", Duration::from_secs(30)).await.unwrap();
        backend.force_lease_expiry(&retried);
        backend.force_lease_expiry(&exhausted);

        let reclaimed = backend.reclaim_expired("standard").await.unwrap();

        assert_eq!(reclaimed.total(), 2);
        assert_eq!(reclaimed.requeued, vec![retried.clone()]);
        assert_eq!(reclaimed.failed.len(), 1);
        assert_eq!(reclaimed.failed[0].job_id, exhausted);
        assert_eq!(reclaimed.failed[0].last_error.as_deref(), Some(LEASE_EXPIRED_FINAL));
        assert_eq!(backend.get_record(&retried).await.unwrap().status, QueueStatus::Waiting);
        assert!(matches!(
            backend.get_record(&exhausted).await.unwrap().status,
            QueueStatus::Failed { .. }
        ));
    }

    #[tokio::test]
    async fn renewed_lease_survives_the_reaper() {
        let backend = MemoryQueueBackend::new();
        let job_id = backend.add(message(1)).await.unwrap();
        let claimed = backend.claim("standard", Duration::from_secs(30)).await.unwrap().unwrap();
        backend.force_lease_expiry(&job_id);

        // An expired lease cannot be renewed
        assert_eq!(
            backend
                .extend_lease(&job_id, &claimed.lease_token, Duration::from_secs(30))
                .await,
            Err(QueueError::LeaseExpired)
        );

        let job_id = backend.add(message(1)).await.unwrap();
        let claimed = backend.claim("standard", Duration::from_millis(50)).await.unwrap().unwrap();
        let renewed = backend
            .extend_lease(&job_id, &claimed.lease_token, Duration::from_secs(30))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(renewed > claimed.lease_until);
        let reclaimed = backend.reclaim_expired("standard").await.unwrap();
        assert!(!reclaimed.requeued.contains(&job_id));
        assert!(reclaimed.failed.iter().all(|record| record.job_id != job_id));
        backend.ack_complete(&job_id, &claimed.lease_token).await.unwrap();
    }

    #[tokio::test]
    async fn events_follow_the_job() {
        let backend = MemoryQueueBackend::new();
        let mut events = backend.event_stream();

        let job_id = backend.add(message(1)).await.unwrap();
        let claimed = backend.claim("standard", Duration::from_secs(30)).await.unwrap().unwrap();
        backend.ack_complete(&job_id, &claimed.lease_token).await.unwrap();

        let names: Vec<&str> = events.by_ref().take(3).map(|event| event.event_name()).collect().await;
        assert_eq!(names, vec!["added", "claimed", "completed"]);
    }
}
