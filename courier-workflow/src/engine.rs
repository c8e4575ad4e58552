use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, instrument};

use courier_cache::{CacheStore, InvalidateCacheService};
use courier_core::config::EngineSettings;
use courier_core::entities::{JobEntity, NotificationEntity, Subscriber, WorkflowTemplate};
use courier_core::repository::Repositories;
use courier_core::CourierResult;
use courier_lock::DistributedLockManager;
use courier_queue::{BackoffStrategy, MemoryQueueBackend, QueueAdapter, QueueConfig, WorkerHandle};

use crate::builder::{NotificationJobBuilder, TemplateProviderIds, TriggerRequest};
use crate::digest::{DigestFilter, MergingDigestFilter};
use crate::executor::StepExecutor;
use crate::queue_service::WorkflowQueueService;
use crate::run_job::RunJob;

/// Wires the job builder, queue, locks and cache into one engine.
///
/// ```rust
/// use std::sync::Arc;
/// use courier_core::config::EngineSettings;
/// use courier_core::repository::Repositories;
/// use courier_workflow::{LoggingStepExecutor, NotificationEngine};
///
/// # tokio_test::block_on(async {
/// let engine = NotificationEngine::in_memory(
///     &EngineSettings::default(),
///     Repositories::in_memory(),
///     Arc::new(LoggingStepExecutor),
/// )
/// .unwrap();
/// engine.start();
/// engine.shutdown().await.unwrap();
/// # });
/// ```
pub struct NotificationEngine {
    repositories: Repositories,
    executor: Arc<dyn StepExecutor>,
    invalidate: InvalidateCacheService,
    locks: Arc<DistributedLockManager>,
    builder: NotificationJobBuilder,
    queue_service: Arc<WorkflowQueueService>,
    run_job: Arc<RunJob>,
    worker: Mutex<Option<WorkerHandle>>,
}

impl NotificationEngine {
    pub fn new(
        repositories: Repositories,
        executor: Arc<dyn StepExecutor>,
        queue: QueueAdapter,
        cache: CacheStore,
        locks: Arc<DistributedLockManager>,
    ) -> Self {
        let digest_filter: Arc<dyn DigestFilter> = Arc::new(MergingDigestFilter::new(repositories.jobs.clone()));
        let builder = NotificationJobBuilder::new(repositories.notifications.clone(), digest_filter);
        let invalidate = InvalidateCacheService::new(cache);
        let queue_service = Arc::new(WorkflowQueueService::new(queue, repositories.clone()));
        let run_job = Arc::new(RunJob::new(
            repositories.clone(),
            executor.clone(),
            locks.clone(),
            invalidate.clone(),
            queue_service.clone(),
        ));

        Self {
            repositories,
            executor,
            invalidate,
            locks,
            builder,
            queue_service,
            run_job,
            worker: Mutex::new(None),
        }
    }

    /// Memory queue, no cache and no distributed locks
    pub fn in_memory(
        settings: &EngineSettings,
        repositories: Repositories,
        executor: Arc<dyn StepExecutor>,
    ) -> CourierResult<Self> {
        let locks = Arc::new(DistributedLockManager::new().with_default_ttl(settings.lock.default_ttl));
        locks.startup(Vec::new(), &settings.lock)?;
        let queue = QueueAdapter::new(MemoryQueueBackend::new(), QueueConfig::from(&settings.queue));
        Ok(Self::new(repositories, executor, queue, CacheStore::disabled(), locks))
    }

    /// Connect the configured Redis backends. The queue falls back to memory
    /// and the cache to disabled when they have no endpoint.
    #[cfg(feature = "redis")]
    pub async fn connect(
        settings: &EngineSettings,
        repositories: Repositories,
        executor: Arc<dyn StepExecutor>,
    ) -> CourierResult<Self> {
        use courier_core::CourierError;
        use courier_queue::RedisQueueBackend;

        let cache = CacheStore::from_settings(&settings.cache)
            .await
            .map_err(|e| CourierError::BackendTransient(format!("cache: {e}")))?
            .with_runtime_env(settings.env);

        let locks = Arc::new(DistributedLockManager::new().with_default_ttl(settings.lock.default_ttl));
        locks.connect(&settings.lock).await?;

        let config = QueueConfig::from(&settings.queue);
        let queue = match &settings.queue.endpoint {
            Some(endpoint) => {
                let backend = RedisQueueBackend::connect(
                    endpoint,
                    settings.queue.key_prefix.clone(),
                    settings.cache.connect_timeout,
                )
                .await
                .map_err(|e| CourierError::BackendTransient(format!("queue: {e}")))?;
                QueueAdapter::new(backend, config)
            }
            None => QueueAdapter::new(MemoryQueueBackend::new(), config),
        };

        Ok(Self::new(repositories, executor, queue, cache, locks))
    }

    /// Backoff for webhook-gated jobs. Call before [`NotificationEngine::start`].
    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        let queue = self.queue_service.queue().clone();
        self.queue_service =
            Arc::new(WorkflowQueueService::new(queue, self.repositories.clone()).with_backoff(backoff));
        self.run_job = Arc::new(RunJob::new(
            self.repositories.clone(),
            self.executor.clone(),
            self.locks.clone(),
            self.invalidate.clone(),
            self.queue_service.clone(),
        ));
        self
    }

    pub fn with_digest_filter(mut self, digest_filter: Arc<dyn DigestFilter>) -> Self {
        self.builder = NotificationJobBuilder::new(self.repositories.notifications.clone(), digest_filter);
        self
    }

    pub fn repositories(&self) -> &Repositories {
        &self.repositories
    }

    pub fn queue(&self) -> &QueueAdapter {
        self.queue_service.queue()
    }

    pub fn queue_service(&self) -> &Arc<WorkflowQueueService> {
        &self.queue_service
    }

    pub fn locks(&self) -> &Arc<DistributedLockManager> {
        &self.locks
    }

    pub fn run_job(&self) -> &Arc<RunJob> {
        &self.run_job
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().is_some()
    }

    /// Build, store and start the jobs of one notification.
    ///
    /// Only the first job is enqueued; each job queues its successor when it
    /// settles.
    #[instrument(skip_all, fields(trigger = %template.trigger_identifier, subscriber = %subscriber.subscriber_id))]
    pub async fn trigger(
        &self,
        request: &TriggerRequest,
        template: &WorkflowTemplate,
        subscriber: &Subscriber,
        provider_ids: &TemplateProviderIds,
    ) -> CourierResult<(NotificationEntity, Vec<JobEntity>)> {
        let (notification, jobs) = self.builder.build(request, template, subscriber, provider_ids).await?;
        if jobs.is_empty() {
            info!(notification_id = %notification.id, "Nothing to run for notification");
            return Ok((notification, jobs));
        }

        let jobs = self.repositories.jobs.store_jobs(jobs).await?;
        if let Some(first) = jobs.first() {
            self.queue_service.enqueue_job(first, first.step.queue_delay()).await?;
        }
        info!(notification_id = %notification.id, jobs = jobs.len(), "Notification triggered");
        Ok((notification, jobs))
    }

    /// Start the worker. A second call is a no-op.
    pub fn start(&self) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            debug!("Engine worker already running");
            return;
        }
        *worker = Some(self.queue_service.queue().start_worker(self.run_job.clone()));
        info!("Notification engine started");
    }

    /// Stop claiming jobs, wait for the ones in flight, then drain the locks.
    pub async fn shutdown(&self) -> CourierResult<()> {
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.shutdown().await {
                error!("Worker did not stop cleanly: {}", e);
            }
        }
        self.locks.drain().await?;
        info!("Notification engine stopped");
        Ok(())
    }
}
