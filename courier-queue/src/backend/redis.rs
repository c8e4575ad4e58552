use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::Script;
use tokio::sync::broadcast;
use tracing::{debug, info};

use courier_core::config::BackendEndpoint;
use courier_core::ids::JobId;

use crate::backend::{BoxStream, QueueBackend, LEASE_EXPIRED, LEASE_EXPIRED_FINAL};
use crate::types::{
    ClaimedJob, LeaseToken, QueueCounts, QueueEvent, QueueMessage, QueueRecord, QueueStatus, ReclaimOutcome,
};
use crate::{QueueError, QueueResult};

/// Stores a record unless a live one with the same id exists
const ADD_SCRIPT: &str = r#"
local state = redis.call("HGET", KEYS[1], "state")
if state and state ~= "completed" and state ~= "failed" then
    return 0
end
redis.call("DEL", KEYS[1])
redis.call("HSET", KEYS[1], "record", ARGV[1], "state", ARGV[2], "attempts", 0)
if ARGV[2] == "delayed" then
    redis.call("ZADD", KEYS[3], ARGV[3], ARGV[4])
else
    redis.call("RPUSH", KEYS[2], ARGV[4])
end
return 1
"#;

/// Promotes due delayed jobs, then leases the next waiting job: counts the
/// attempt and stores the lease in the job hash before returning it
const CLAIM_SCRIPT: &str = r#"
local due = redis.call("ZRANGEBYSCORE", KEYS[2], "-inf", ARGV[1])
for _, id in ipairs(due) do
    redis.call("ZREM", KEYS[2], id)
    redis.call("RPUSH", KEYS[1], id)
end
while true do
    local id = redis.call("LPOP", KEYS[1])
    if not id then
        return false
    end
    local job = ARGV[4] .. id
    local state = redis.call("HGET", job, "state")
    if state == "waiting" or state == "delayed" then
        local attempts = redis.call("HINCRBY", job, "attempts", 1)
        redis.call("HSET", job, "state", "active", "token", ARGV[3], "lease_until", ARGV[2])
        redis.call("ZADD", KEYS[3], ARGV[2], id)
        return {id, redis.call("HGET", job, "record"), attempts}
    end
end
"#;

/// Checks the caller's lease and moves the job in one step.
///
/// KEYS: job, active set, delayed set, waiting list, counter of the target
/// state. ARGV: token, now, whether the lease must be expired, target state,
/// record, remove flag, job id, score. Target `active` renews the lease.
const SETTLE_SCRIPT: &str = r#"
local current = redis.call("HMGET", KEYS[1], "state", "token", "lease_until")
if not current[1] then
    return -1
end
if current[1] == "completed" or current[1] == "failed" then
    return -2
end
if current[2] ~= ARGV[1] then
    return -3
end
local expired = tonumber(current[3] or "0") < tonumber(ARGV[2])
if expired ~= (ARGV[3] == "1") then
    return -4
end

local target, id = ARGV[4], ARGV[7]
if target == "active" then
    redis.call("HSET", KEYS[1], "lease_until", ARGV[8])
    redis.call("ZADD", KEYS[2], ARGV[8], id)
    return 1
end

redis.call("ZREM", KEYS[2], id)
redis.call("HDEL", KEYS[1], "token", "lease_until")
if target == "delayed" then
    redis.call("ZADD", KEYS[3], ARGV[8], id)
elseif target == "waiting" then
    redis.call("RPUSH", KEYS[4], id)
else
    redis.call("INCR", KEYS[5])
    if ARGV[6] == "1" then
        redis.call("DEL", KEYS[1])
        return 1
    end
end
redis.call("HSET", KEYS[1], "record", ARGV[5], "state", target)
return 1
"#;

/// Which side of its expiry a settled lease must be on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeaseCheck {
    /// Owner acks or renews a live lease
    Live,
    /// Reaper takes back a lease that ran out
    Expired,
}

/// Durable queue over one Redis endpoint.
///
/// Each job is a hash holding its JSON record and status name, plus the
/// attempt count and current lease, which only the scripts change. Per queue
/// there is a waiting list, a delayed set and an active set scored by lease
/// expiry, plus completed/failed counters. Events are only published to
/// subscribers in this process.
#[derive(Clone)]
pub struct RedisQueueBackend {
    conn: ConnectionManager,
    prefix: String,
    add_script: Script,
    claim_script: Script,
    settle_script: Script,
    event_broadcaster: broadcast::Sender<QueueEvent>,
}

impl RedisQueueBackend {
    pub async fn connect(
        endpoint: &BackendEndpoint,
        prefix: impl Into<String>,
        connect_timeout: Duration,
    ) -> QueueResult<Self> {
        let client = redis::Client::open(endpoint.url())?;
        let conn = tokio::time::timeout(connect_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| QueueError::Backend(format!("connect timed out after {:?}", connect_timeout)))??;

        info!("Connected queue backend at {}:{}", endpoint.host, endpoint.port);
        Ok(Self::from_connection(conn, prefix))
    }

    pub fn from_connection(conn: ConnectionManager, prefix: impl Into<String>) -> Self {
        let (event_broadcaster, _) = broadcast::channel(1000);
        Self {
            conn,
            prefix: prefix.into(),
            add_script: Script::new(ADD_SCRIPT),
            claim_script: Script::new(CLAIM_SCRIPT),
            settle_script: Script::new(SETTLE_SCRIPT),
            event_broadcaster,
        }
    }

    fn job_key_prefix(&self) -> String {
        format!("{}:job:", self.prefix)
    }

    fn job_key(&self, job_id: &JobId) -> String {
        format!("{}{}", self.job_key_prefix(), job_id)
    }

    fn queue_key(&self, queue: &str, part: &str) -> String {
        format!("{}:{}:{}", self.prefix, queue, part)
    }

    fn emit(&self, event: QueueEvent) {
        let _ = self.event_broadcaster.send(event);
    }

    /// Read a record with the attempt count and lease the scripts keep
    async fn load(&self, job_id: &JobId) -> QueueResult<Option<QueueRecord>> {
        let mut conn = self.conn.clone();
        let (raw, state, attempts, token, lease_until): (
            Option<String>,
            Option<String>,
            Option<u32>,
            Option<String>,
            Option<i64>,
        ) = redis::cmd("HMGET")
            .arg(self.job_key(job_id))
            .arg("record")
            .arg("state")
            .arg("attempts")
            .arg("token")
            .arg("lease_until")
            .query_async(&mut conn)
            .await?;
        let Some(raw) = raw else {
            return Ok(None);
        };

        let mut record: QueueRecord = serde_json::from_str(&raw)?;
        if let Some(attempts) = attempts {
            record.attempts_made = attempts;
        }
        if let (Some("active"), Some(token), Some(lease_until)) = (state.as_deref(), token, lease_until) {
            activate(&mut record, LeaseToken::from(token), from_millis(lease_until)?);
        }
        Ok(Some(record))
    }

    /// Run the settle script for `record`, which already holds the target state
    async fn settle(
        &self,
        record: &QueueRecord,
        lease_token: &LeaseToken,
        check: LeaseCheck,
        score: Option<DateTime<Utc>>,
    ) -> QueueResult<()> {
        let queue = &record.message.queue;
        let target = record.status.name();
        let remove = match record.status {
            QueueStatus::Completed { .. } => record.message.remove_on_complete,
            QueueStatus::Failed { .. } => record.message.remove_on_fail,
            _ => false,
        };

        let mut conn = self.conn.clone();
        let settled: i64 = self
            .settle_script
            .key(self.job_key(&record.job_id))
            .key(self.queue_key(queue, "active"))
            .key(self.queue_key(queue, "delayed"))
            .key(self.queue_key(queue, "wait"))
            .key(self.queue_key(queue, target))
            .arg(lease_token.as_str())
            .arg(millis(Utc::now()))
            .arg(if check == LeaseCheck::Expired { "1" } else { "0" })
            .arg(target)
            .arg(serde_json::to_string(record)?)
            .arg(if remove { "1" } else { "0" })
            .arg(record.job_id.as_str())
            .arg(score.map_or(0, millis))
            .invoke_async(&mut conn)
            .await?;

        match settled {
            1 => Ok(()),
            -1 => Err(QueueError::JobNotFound(record.job_id.to_string())),
            -2 => Err(QueueError::JobAlreadyTerminal),
            -3 => Err(QueueError::InvalidLeaseToken),
            -4 => Err(QueueError::LeaseExpired),
            other => Err(QueueError::Backend(format!("unexpected settle result {}", other))),
        }
    }

    async fn leased(&self, job_id: &JobId, lease_token: &LeaseToken) -> QueueResult<QueueRecord> {
        let record = self
            .load(job_id)
            .await?
            .ok_or_else(|| QueueError::JobNotFound(job_id.to_string()))?;
        record.check_lease(lease_token, Utc::now())?;
        Ok(record)
    }
}

/// Mirror a lease held in the job hash onto the decoded record
fn activate(record: &mut QueueRecord, lease_token: LeaseToken, lease_until: DateTime<Utc>) {
    record.lease_token = Some(lease_token);
    record.lease_until = Some(lease_until);
    record.status = QueueStatus::Active { lease_until };
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> QueueResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| QueueError::Backend(format!("invalid timestamp {}", ms)))
}

fn lease_deadline(now: DateTime<Utc>, lease: Duration) -> QueueResult<DateTime<Utc>> {
    Ok(now + chrono::Duration::from_std(lease).map_err(|e| QueueError::InvalidConfig(e.to_string()))?)
}

#[async_trait]
impl QueueBackend for RedisQueueBackend {
    async fn add(&self, message: QueueMessage) -> QueueResult<JobId> {
        let record = QueueRecord::new(message);
        let job_id = record.job_id.clone();
        let queue = record.message.queue.clone();
        let run_at = record.message.run_at;

        let mut conn = self.conn.clone();
        let added: i64 = self
            .add_script
            .key(self.job_key(&job_id))
            .key(self.queue_key(&queue, "wait"))
            .key(self.queue_key(&queue, "delayed"))
            .arg(serde_json::to_string(&record)?)
            .arg(record.status.name())
            .arg(millis(run_at))
            .arg(job_id.as_str())
            .invoke_async(&mut conn)
            .await?;

        if added == 1 {
            self.emit(QueueEvent::Added {
                job_id: job_id.clone(),
                queue,
                run_at,
                at: Utc::now(),
            });
        } else {
            debug!("Job {} is already queued", job_id);
        }
        Ok(job_id)
    }

    async fn claim(&self, queue: &str, lease: Duration) -> QueueResult<Option<ClaimedJob>> {
        let now = Utc::now();
        let lease_until = lease_deadline(now, lease)?;
        let lease_token = LeaseToken::new();

        let mut conn = self.conn.clone();
        let claimed: Option<(String, String, u32)> = self
            .claim_script
            .key(self.queue_key(queue, "wait"))
            .key(self.queue_key(queue, "delayed"))
            .key(self.queue_key(queue, "active"))
            .arg(millis(now))
            .arg(millis(lease_until))
            .arg(lease_token.as_str())
            .arg(self.job_key_prefix())
            .invoke_async(&mut conn)
            .await?;
        let Some((job_id, raw, attempts)) = claimed else {
            return Ok(None);
        };

        let mut record: QueueRecord = serde_json::from_str(&raw)?;
        record.attempts_made = attempts;
        activate(&mut record, lease_token.clone(), lease_until);

        self.emit(QueueEvent::Claimed {
            job_id: JobId::from(job_id),
            attempt: record.attempts_made,
            lease_until,
            at: now,
        });
        Ok(Some(ClaimedJob {
            record,
            lease_token,
            lease_until,
        }))
    }

    async fn extend_lease(
        &self,
        job_id: &JobId,
        lease_token: &LeaseToken,
        lease: Duration,
    ) -> QueueResult<DateTime<Utc>> {
        let mut record = self.leased(job_id, lease_token).await?;
        let lease_until = lease_deadline(Utc::now(), lease)?;
        record.extend_lease(lease_until);
        self.settle(&record, lease_token, LeaseCheck::Live, Some(lease_until))
            .await?;
        Ok(lease_until)
    }

    async fn ack_complete(&self, job_id: &JobId, lease_token: &LeaseToken) -> QueueResult<()> {
        let mut record = self.leased(job_id, lease_token).await?;
        record.complete();
        self.settle(&record, lease_token, LeaseCheck::Live, None).await?;

        self.emit(QueueEvent::Completed {
            job_id: job_id.clone(),
            at: Utc::now(),
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
        let mut record = self.leased(job_id, lease_token).await?;

        let event = match retry_at {
            Some(retry_at) if record.has_attempts_left() => {
                record.schedule_retry(retry_at, error.clone());
                self.settle(&record, lease_token, LeaseCheck::Live, Some(retry_at))
                    .await?;
                QueueEvent::Retrying {
                    job_id: job_id.clone(),
                    retry_at,
                    error,
                    at: Utc::now(),
                }
            }
            _ => {
                record.fail(error.clone());
                self.settle(&record, lease_token, LeaseCheck::Live, None).await?;
                QueueEvent::Failed {
                    job_id: job_id.clone(),
                    error,
                    at: Utc::now(),
                }
            }
        };

        self.emit(event);
        Ok(())
    }

    async fn get_record(&self, job_id: &JobId) -> QueueResult<QueueRecord> {
        self.load(job_id)
            .await?
            .ok_or_else(|| QueueError::JobNotFound(job_id.to_string()))
    }

    async fn counts(&self, queue: &str) -> QueueResult<QueueCounts> {
        let mut conn = self.conn.clone();
        let (waiting, delayed, active, completed, failed): (usize, usize, usize, Option<usize>, Option<usize>) =
            redis::pipe()
                .cmd("LLEN")
                .arg(self.queue_key(queue, "wait"))
                .cmd("ZCARD")
                .arg(self.queue_key(queue, "delayed"))
                .cmd("ZCARD")
                .arg(self.queue_key(queue, "active"))
                .cmd("GET")
                .arg(self.queue_key(queue, "completed"))
                .cmd("GET")
                .arg(self.queue_key(queue, "failed"))
                .query_async(&mut conn)
                .await?;

        Ok(QueueCounts {
            waiting,
            delayed,
            active,
            completed: completed.unwrap_or(0),
            failed: failed.unwrap_or(0),
        })
    }

    async fn reclaim_expired(&self, queue: &str) -> QueueResult<ReclaimOutcome> {
        let now = Utc::now();
        let mut conn = self.conn.clone();
        let expired: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.queue_key(queue, "active"))
            .arg("-inf")
            .arg(millis(now))
            .query_async(&mut conn)
            .await?;

        let mut outcome = ReclaimOutcome::default();
        for id in expired {
            let job_id = JobId::from(id);
            let Some(mut record) = self.load(&job_id).await? else {
                let _: () = redis::cmd("ZREM")
                    .arg(self.queue_key(queue, "active"))
                    .arg(job_id.as_str())
                    .query_async(&mut conn)
                    .await?;
                continue;
            };
            let Some(lease_token) = record.lease_token.clone() else {
                continue;
            };

            if record.has_attempts_left() {
                record.release_lease();
            } else {
                record.fail(LEASE_EXPIRED_FINAL.to_string());
            }

            // Refused when the owner acked or renewed in the meantime
            if let Err(e) = self.settle(&record, &lease_token, LeaseCheck::Expired, None).await {
                debug!("Skipped reclaiming job {}: {}", job_id, e);
                continue;
            }

            if record.status.is_terminal() {
                self.emit(QueueEvent::Failed {
                    job_id,
                    error: LEASE_EXPIRED_FINAL.to_string(),
                    at: now,
                });
                outcome.failed.push(record);
            } else {
                self.emit(QueueEvent::Retrying {
                    job_id: job_id.clone(),
                    retry_at: now,
                    error: LEASE_EXPIRED.to_string(),
                    at: now,
                });
                outcome.requeued.push(job_id);
            }
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
