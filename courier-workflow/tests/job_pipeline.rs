//! End-to-end runs of triggered workflows through the engine, the memory
//! queue and in-memory repositories.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use courier_cache::keys::{feed_scope, query_key};
use courier_cache::{CacheStore, MemoryCacheBackend};
use courier_core::config::{CacheSettings, LockSettings};
use courier_core::prelude::*;
use courier_core::repository::{MemoryExecutionDetailsRepository, MemoryJobRepository, MemoryNotificationRepository};
use courier_lock::{DistributedLockManager, LockManagerState, MemoryLockBackend};
use courier_queue::{BackoffStrategy, JobData, MemoryQueueBackend, QueueAdapter, QueueConfig};
use courier_workflow::prelude::*;
use courier_workflow::lock_resource;

#[derive(Clone, Copy)]
enum Outcome {
    Succeed,
    Transient,
    Permanent,
}

/// Executor whose outcome is scripted per step id. Records every call and
/// the lock count seen while running.
#[derive(Default)]
struct ScriptedExecutor {
    outcomes: HashMap<String, Outcome>,
    calls: Mutex<Vec<String>>,
    locks: Option<Arc<DistributedLockManager>>,
    lock_counts: Mutex<Vec<usize>>,
    delay: Option<Duration>,
    started: AtomicBool,
}

impl ScriptedExecutor {
    fn with_outcome(mut self, step: &str, outcome: Outcome) -> Self {
        self.outcomes.insert(step.to_string(), outcome);
        self
    }

    fn calls_for(&self, step: &str) -> usize {
        self.calls.lock().iter().filter(|id| id.as_str() == step).count()
    }
}

#[async_trait]
impl StepExecutor for ScriptedExecutor {
    async fn execute(&self, job: &JobEntity) -> CourierResult<()> {
        self.started.store(true, Ordering::SeqCst);
        self.calls.lock().push(job.step.id.clone());
        if let Some(locks) = &self.locks {
            self.lock_counts.lock().push(locks.lock_count(&lock_resource(job)));
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match self.outcomes.get(&job.step.id).copied().unwrap_or(Outcome::Succeed) {
            Outcome::Succeed => Ok(()),
            Outcome::Transient => Err(CourierError::BackendTransient("webhook filter unavailable".into())),
            Outcome::Permanent => Err(CourierError::validation("provider rejected message")),
        }
    }
}

struct Harness {
    jobs: Arc<MemoryJobRepository>,
    details: Arc<MemoryExecutionDetailsRepository>,
    repositories: Repositories,
    env: EnvironmentId,
    org: OrganizationId,
    subscriber: Subscriber,
}

impl Harness {
    fn new() -> Self {
        let jobs = Arc::new(MemoryJobRepository::new());
        let details = Arc::new(MemoryExecutionDetailsRepository::new());
        let repositories = Repositories::new(
            Arc::new(MemoryNotificationRepository::new()),
            jobs.clone(),
            details.clone(),
        );
        let env = EnvironmentId::new();
        let org = OrganizationId::new();
        let subscriber = Subscriber::new("subscriber-1", env.clone(), org.clone());
        Self {
            jobs,
            details,
            repositories,
            env,
            org,
            subscriber,
        }
    }

    fn queue_config() -> QueueConfig {
        QueueConfig {
            poll_interval: Duration::from_millis(10),
            ..QueueConfig::default()
        }
    }

    fn queue(&self) -> QueueAdapter {
        QueueAdapter::new(MemoryQueueBackend::new(), Self::queue_config())
    }

    fn engine(&self, executor: Arc<ScriptedExecutor>) -> NotificationEngine {
        self.engine_on(executor, Self::queue_config())
    }

    fn engine_on(&self, executor: Arc<ScriptedExecutor>, config: QueueConfig) -> NotificationEngine {
        let locks = Arc::new(DistributedLockManager::new().with_drain_interval(Duration::from_millis(10)));
        let queue = QueueAdapter::new(MemoryQueueBackend::new(), config);
        NotificationEngine::new(self.repositories.clone(), executor, queue, CacheStore::disabled(), locks)
            .with_backoff(BackoffStrategy::fixed(Duration::from_millis(5)))
    }

    fn job(&self, step: &str) -> JobEntity {
        self.jobs.all().into_iter().find(|job| job.step.id == step).unwrap()
    }

    async fn trigger(&self, engine: &NotificationEngine, steps: Vec<StepDefinition>) -> Vec<JobEntity> {
        let template = WorkflowTemplate::new("Pipeline", "pipeline", steps);
        let request = TriggerRequest::new(self.env.clone(), self.org.clone(), json!({"thread": "t-1"}));
        let (_, jobs) = engine
            .trigger(&request, &template, &self.subscriber, &HashMap::new())
            .await
            .unwrap();
        jobs
    }

    fn status(&self, step: &str) -> JobStatus {
        self.jobs
            .all()
            .into_iter()
            .find(|job| job.step.id == step)
            .map(|job| job.status)
            .unwrap()
    }

    async fn wait_for_status(&self, step: &str, status: JobStatus) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.status(step) != status {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("step {step} never reached {status:?}"));
    }

    fn details_for(&self, step: &str, status: ExecutionDetailStatus) -> usize {
        let job_id = self.jobs.all().into_iter().find(|job| job.step.id == step).unwrap().id;
        self.details
            .all()
            .iter()
            .filter(|detail| detail.job_id == job_id && detail.status == status)
            .count()
    }
}

fn webhook_gated(id: &str) -> StepDefinition {
    StepDefinition::new(id, StepType::Chat).with_filter(StepFilter::new(vec![FilterCondition {
        on: FilterSource::Webhook,
        field: "isAllowed".into(),
        operator: "EQUAL".into(),
        value: json!(true),
    }]))
}

/// P1. Completing a job queues the next one until the chain is done
#[tokio::test]
async fn chain_runs_every_step_in_order() {
    // Arrange
    let harness = Harness::new();
    let executor = Arc::new(ScriptedExecutor::default());
    let engine = harness.engine(executor.clone());
    engine.start();

    // Act
    harness
        .trigger(
            &engine,
            vec![
                StepDefinition::new("in-app", StepType::InApp),
                StepDefinition::new("email", StepType::Email),
                StepDefinition::new("sms", StepType::Sms),
            ],
        )
        .await;
    harness.wait_for_status("sms", JobStatus::Completed).await;

    // Assert
    assert_eq!(*executor.calls.lock(), vec!["in-app", "email", "sms"]);
    assert_eq!(harness.status("in-app"), JobStatus::Completed);
    assert_eq!(harness.status("email"), JobStatus::Completed);
    assert_eq!(engine.queue().metrics().jobs_enqueued(), 3);
    engine.shutdown().await.unwrap();
}

/// P2. A webhook-gated step is tried three times, then the chain moves on once
#[tokio::test]
async fn backoff_failure_retries_three_times_then_queues_next_once() {
    // Arrange
    let harness = Harness::new();
    let executor = Arc::new(ScriptedExecutor::default().with_outcome("gated", Outcome::Transient));
    let engine = harness.engine(executor.clone());
    engine.start();

    // Act
    harness
        .trigger(&engine, vec![webhook_gated("gated"), StepDefinition::new("email", StepType::Email)])
        .await;
    harness.wait_for_status("email", JobStatus::Completed).await;

    // Assert
    assert_eq!(executor.calls_for("gated"), 3);
    assert_eq!(executor.calls_for("email"), 1);
    assert_eq!(harness.status("gated"), JobStatus::Failed);
    assert_eq!(engine.queue().metrics().jobs_enqueued(), 2);
    assert_eq!(harness.details_for("gated", ExecutionDetailStatus::Warning), 2);
    assert_eq!(harness.details_for("gated", ExecutionDetailStatus::Failed), 1);
    let gated = harness.jobs.all().into_iter().find(|job| job.step.id == "gated").unwrap();
    assert_eq!(gated.attempts, 3);
    assert_eq!(gated.error.as_deref(), Some("Backend unavailable: webhook filter unavailable"));
    engine.shutdown().await.unwrap();
}

/// P3. A failing step that stops on failure ends the workflow
#[tokio::test]
async fn stop_on_fail_halts_the_chain() {
    // Arrange
    let harness = Harness::new();
    let executor = Arc::new(ScriptedExecutor::default().with_outcome("email", Outcome::Permanent));
    let engine = harness.engine(executor.clone());
    engine.start();

    // Act
    harness
        .trigger(
            &engine,
            vec![
                StepDefinition::new("email", StepType::Email).stop_on_fail(),
                StepDefinition::new("sms", StepType::Sms),
            ],
        )
        .await;
    harness.wait_for_status("email", JobStatus::Failed).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Assert
    assert_eq!(executor.calls_for("email"), 1);
    assert_eq!(executor.calls_for("sms"), 0);
    assert_eq!(harness.status("sms"), JobStatus::Pending);
    assert_eq!(engine.queue().metrics().jobs_enqueued(), 1);
    engine.shutdown().await.unwrap();
}

/// P4. A terminal failure of an optional step is not retried and the chain continues
#[tokio::test]
async fn terminal_failure_continues_the_chain() {
    // Arrange
    let harness = Harness::new();
    let executor = Arc::new(ScriptedExecutor::default().with_outcome("email", Outcome::Permanent));
    let engine = harness.engine(executor.clone());
    engine.start();

    // Act
    harness
        .trigger(
            &engine,
            vec![
                StepDefinition::new("email", StepType::Email),
                StepDefinition::new("sms", StepType::Sms),
            ],
        )
        .await;
    harness.wait_for_status("sms", JobStatus::Completed).await;

    // Assert
    assert_eq!(executor.calls_for("email"), 1);
    assert_eq!(harness.status("email"), JobStatus::Failed);
    assert_eq!(harness.details_for("email", ExecutionDetailStatus::Failed), 1);
    engine.shutdown().await.unwrap();
}

/// P5. Steps run under their lock and every lock is released afterwards
#[tokio::test]
async fn steps_hold_their_lock_and_release_it() {
    // Arrange
    let harness = Harness::new();
    let backend = MemoryLockBackend::new("lock-1");
    let settings = LockSettings {
        retry_count: 0,
        retry_delay: Duration::from_millis(1),
        retry_jitter: Duration::ZERO,
        ..LockSettings::default()
    };
    let locks = Arc::new(DistributedLockManager::new().with_drain_interval(Duration::from_millis(10)));
    locks.startup(vec![Arc::new(backend.clone())], &settings).unwrap();
    let executor = Arc::new(ScriptedExecutor {
        locks: Some(locks.clone()),
        ..ScriptedExecutor::default()
    });
    let engine = NotificationEngine::new(
        harness.repositories.clone(),
        executor.clone(),
        harness.queue(),
        CacheStore::disabled(),
        locks.clone(),
    );
    engine.start();

    // Act
    harness
        .trigger(
            &engine,
            vec![
                StepDefinition::new("email", StepType::Email),
                StepDefinition::new("push", StepType::Push),
            ],
        )
        .await;
    harness.wait_for_status("push", JobStatus::Completed).await;
    engine.shutdown().await.unwrap();

    // Assert
    assert_eq!(*executor.lock_counts.lock(), vec![1, 1]);
    assert!(locks.counter().is_idle());
    assert_eq!(backend.held_count(), 0);
    assert_eq!(locks.state(), LockManagerState::Stopped);
    assert_eq!(backend.quit_calls(), 1);
}

/// P6. Shutdown waits for the job in flight
#[tokio::test]
async fn shutdown_waits_for_running_job() {
    // Arrange
    let harness = Harness::new();
    let executor = Arc::new(ScriptedExecutor {
        delay: Some(Duration::from_millis(200)),
        ..ScriptedExecutor::default()
    });
    let engine = harness.engine(executor.clone());
    engine.start();
    engine.start();
    harness
        .trigger(&engine, vec![StepDefinition::new("email", StepType::Email)])
        .await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while !executor.started.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    // Act
    engine.shutdown().await.unwrap();

    // Assert
    assert!(!engine.is_running());
    assert_eq!(harness.status("email"), JobStatus::Completed);
    assert_eq!(engine.locks().state(), LockManagerState::Stopped);
}

/// P7. A completed step drops the subscriber's cached feed
#[tokio::test]
async fn completed_step_invalidates_subscriber_feed() {
    // Arrange
    let harness = Harness::new();
    let cache_backend = Arc::new(MemoryCacheBackend::new());
    let cache = CacheStore::new(cache_backend.clone(), &CacheSettings::default());
    let scope = feed_scope(&harness.env, &harness.subscriber.id);
    cache.set_query(&query_key(&scope, "page=0"), "[]", None).await.unwrap();
    assert!(!cache_backend.keys("*").is_empty());

    let executor = Arc::new(ScriptedExecutor::default());
    let locks = Arc::new(DistributedLockManager::new());
    let engine = NotificationEngine::new(harness.repositories.clone(), executor, harness.queue(), cache, locks);
    engine.start();

    // Act
    harness
        .trigger(&engine, vec![StepDefinition::new("in-app", StepType::InApp)])
        .await;
    harness.wait_for_status("in-app", JobStatus::Completed).await;

    // Assert
    assert!(cache_backend.keys("*").is_empty());
    engine.shutdown().await.unwrap();
}

/// P8. A step that waits for a digest window is queued with its delay
#[tokio::test]
async fn digest_step_is_delayed_by_its_window() {
    // Arrange
    let harness = Harness::new();
    let executor = Arc::new(ScriptedExecutor::default());
    let engine = harness.engine(executor.clone());

    // Act
    harness
        .trigger(
            &engine,
            vec![StepDefinition::digest("digest", DigestMetadata::new(10, TimeUnit::Minutes))],
        )
        .await;
    let counts = engine.queue().backend().counts("standard").await.unwrap();

    // Assert
    assert_eq!(counts.delayed, 1);
    assert_eq!(counts.waiting, 0);
}

/// P9. Completing the same job twice advances the chain once
#[tokio::test]
async fn repeated_completion_queues_next_once() {
    // Arrange
    let harness = Harness::new();
    let engine = harness.engine(Arc::new(ScriptedExecutor::default()));
    harness
        .trigger(
            &engine,
            vec![
                StepDefinition::new("email", StepType::Email),
                StepDefinition::new("sms", StepType::Sms),
            ],
        )
        .await;
    let email = harness.job("email");
    let data = JobData {
        job_id: email.id.clone(),
        environment_id: email.environment_id.clone(),
        organization_id: email.organization_id.clone(),
        subscriber_id: email.subscriber_id.clone(),
    };

    // Act
    engine.queue_service().on_job_completed(&data).await.unwrap();
    engine.queue_service().on_job_completed(&data).await.unwrap();

    // Assert: the worker never ran, so both jobs are waiting
    assert_eq!(harness.status("email"), JobStatus::Completed);
    assert_eq!(harness.status("sms"), JobStatus::Pending);
    assert_eq!(engine.queue().metrics().jobs_enqueued(), 2);
    let counts = engine.queue().backend().counts("standard").await.unwrap();
    assert_eq!(counts.waiting, 2);
    assert_eq!(harness.details_for("email", ExecutionDetailStatus::Success), 1);
}

/// P10. A step running longer than its lease runs once and the chain continues
#[tokio::test]
async fn slow_step_outliving_its_lease_runs_once() {
    // Arrange
    let harness = Harness::new();
    let executor = Arc::new(ScriptedExecutor {
        delay: Some(Duration::from_millis(300)),
        ..ScriptedExecutor::default()
    });
    let config = QueueConfig {
        lease_duration: Duration::from_millis(100),
        reaper_interval: Duration::from_millis(20),
        ..Harness::queue_config()
    };
    let engine = harness.engine_on(executor.clone(), config);
    engine.start();

    // Act
    harness
        .trigger(
            &engine,
            vec![
                StepDefinition::new("slow", StepType::Email),
                StepDefinition::new("next", StepType::Sms),
            ],
        )
        .await;
    harness.wait_for_status("next", JobStatus::Completed).await;

    // Assert
    assert_eq!(*executor.calls.lock(), vec!["slow", "next"]);
    assert_eq!(harness.status("slow"), JobStatus::Completed);
    assert_eq!(engine.queue().metrics().jobs_retried(), 0);
    engine.shutdown().await.unwrap();
}

/// P11. A job abandoned on its last attempt is failed and the chain continues
#[tokio::test]
async fn abandoned_job_fails_and_chain_continues() {
    // Arrange
    let harness = Harness::new();
    let executor = Arc::new(ScriptedExecutor::default());
    let config = QueueConfig {
        default_attempts: 1,
        reaper_interval: Duration::from_millis(20),
        ..Harness::queue_config()
    };
    let engine = harness.engine_on(executor.clone(), config);
    harness
        .trigger(
            &engine,
            vec![
                StepDefinition::new("lost", StepType::Email),
                StepDefinition::new("next", StepType::Sms),
            ],
        )
        .await;

    // A worker that claimed the first job went away
    engine
        .queue()
        .backend()
        .claim("standard", Duration::from_millis(1))
        .await
        .unwrap()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    // Act
    engine.start();
    harness.wait_for_status("next", JobStatus::Completed).await;

    // Assert
    assert_eq!(harness.status("lost"), JobStatus::Failed);
    assert_eq!(executor.calls_for("lost"), 0);
    assert_eq!(harness.details_for("lost", ExecutionDetailStatus::Failed), 1);
    assert_eq!(
        harness.job("lost").error.as_deref(),
        Some("Max attempts exceeded due to lease expiry")
    );
    engine.shutdown().await.unwrap();
}
