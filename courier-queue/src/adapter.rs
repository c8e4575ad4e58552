use std::convert::Infallible;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::{oneshot, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

use courier_core::config::QueueSettings;
use courier_core::ids::JobId;

use crate::backend::{LeaseReaper, QueueBackend, LEASE_EXPIRED_FINAL};
use crate::backoff::BackoffStrategy;
use crate::observability::LiveMetrics;
use crate::types::{ClaimedJob, JobData, LeaseToken, QueueMessage, QueueRecord};
use crate::{JobError, QueueError, QueueResult};

/// Pause after a backend error before claiming again
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Configuration for queue adapter
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub queue_name: String,
    /// Maximum number of jobs processed at once
    pub concurrency: usize,
    /// Lease duration for claimed jobs. Running jobs renew it every half
    /// lease, so it only bounds how long a crashed worker holds a job.
    pub lease_duration: Duration,
    /// Wait between claims when the queue is empty
    pub poll_interval: Duration,
    /// Attempts given to jobs enqueued without an explicit count
    pub default_attempts: u32,
    pub reaper_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::from(&QueueSettings::default())
    }
}

impl From<&QueueSettings> for QueueConfig {
    fn from(settings: &QueueSettings) -> Self {
        Self {
            queue_name: settings.name.clone(),
            concurrency: settings.concurrency.max(1),
            lease_duration: settings.lease_duration,
            poll_interval: settings.poll_interval,
            default_attempts: settings.default_attempts.max(1),
            reaper_interval: Duration::from_secs(30),
        }
    }
}

/// Per-job submission options
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    pub delay: Option<Duration>,
    /// Fairness group, usually the organization
    pub group: Option<String>,
    pub backoff: Option<BackoffStrategy>,
    /// Total attempts; the queue default applies when unset
    pub attempts: Option<u32>,
    pub remove_on_complete: bool,
    pub remove_on_fail: bool,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            delay: None,
            group: None,
            backoff: None,
            attempts: None,
            remove_on_complete: true,
            remove_on_fail: true,
        }
    }
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay).filter(|delay| !delay.is_zero());
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Attach a strategy by name. Unknown names are rejected here, before
    /// anything reaches the queue.
    pub fn with_backoff_named(self, name: &str) -> QueueResult<Self> {
        Ok(self.with_backoff(name.parse()?))
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts.max(1));
        self
    }

    /// Keep terminal records around for inspection
    pub fn keep_records(mut self) -> Self {
        self.remove_on_complete = false;
        self.remove_on_fail = false;
        self
    }
}

/// What the worker decided about a failed attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureInfo {
    pub attempts_made: u32,
    pub max_attempts: u32,
    /// Another attempt has been scheduled
    pub will_retry: bool,
    pub retry_at: Option<DateTime<Utc>>,
}

impl FailureInfo {
    pub fn is_final(&self) -> bool {
        !self.will_retry
    }
}

/// Business logic run for every claimed job.
///
/// `process` decides the attempt's outcome; the callbacks run after the
/// queue has recorded it.
#[async_trait]
pub trait JobProcessor: Send + Sync + 'static {
    async fn process(&self, job: &QueueRecord) -> Result<(), JobError>;

    async fn on_completed(&self, _job: &QueueRecord) {}

    async fn on_failed(&self, _job: &QueueRecord, _error: &JobError, _info: &FailureInfo) {}
}

/// Handle for managing worker lifecycle
pub struct WorkerHandle {
    shutdown_tx: oneshot::Sender<()>,
    join_handle: JoinHandle<QueueResult<()>>,
}

impl WorkerHandle {
    /// Stop claiming, wait for in-flight jobs and return
    pub async fn shutdown(self) -> QueueResult<()> {
        let _ = self.shutdown_tx.send(());
        self.join_handle
            .await
            .map_err(|e| QueueError::Internal(format!("Worker join error: {}", e)))?
    }

    pub fn is_finished(&self) -> bool {
        self.join_handle.is_finished()
    }
}

/// Queue front-end: submits jobs and runs the worker pool
#[derive(Clone)]
pub struct QueueAdapter {
    backend: Arc<dyn QueueBackend>,
    metrics: Arc<LiveMetrics>,
    config: QueueConfig,
}

impl QueueAdapter {
    pub fn new<B: QueueBackend + 'static>(backend: B, config: QueueConfig) -> Self {
        Self::from_shared(Arc::new(backend), config)
    }

    pub fn from_shared(backend: Arc<dyn QueueBackend>, config: QueueConfig) -> Self {
        Self {
            backend,
            metrics: Arc::new(LiveMetrics::new()),
            config,
        }
    }

    pub fn backend(&self) -> &Arc<dyn QueueBackend> {
        &self.backend
    }

    pub fn metrics(&self) -> &LiveMetrics {
        &self.metrics
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Submit a job for processing
    #[instrument(skip(self, data, options), fields(job_id = %data.job_id, queue = %self.config.queue_name))]
    pub async fn enqueue(&self, data: JobData, options: EnqueueOptions) -> QueueResult<JobId> {
        let run_at = match options.delay {
            Some(delay) => {
                Utc::now() + chrono::Duration::from_std(delay).map_err(|e| QueueError::InvalidConfig(e.to_string()))?
            }
            None => Utc::now(),
        };

        let message = QueueMessage {
            job_id: data.job_id.clone(),
            data,
            queue: self.config.queue_name.clone(),
            attempts: options.attempts.unwrap_or(self.config.default_attempts),
            backoff: options.backoff,
            run_at,
            remove_on_complete: options.remove_on_complete,
            remove_on_fail: options.remove_on_fail,
            group: options.group,
        };

        let job_id = self.backend.add(message).await?;
        self.metrics.increment_jobs_enqueued(&self.config.queue_name);

        debug!("Enqueued job {}", job_id);
        Ok(job_id)
    }

    /// Start the worker pool for the configured queue
    pub fn start_worker<P: JobProcessor>(&self, processor: Arc<P>) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let worker = Worker {
            runner: Arc::new(Runner {
                backend: self.backend.clone(),
                metrics: self.metrics.clone(),
                processor,
                queue: self.config.queue_name.clone(),
                lease: self.config.lease_duration,
            }),
            config: self.config.clone(),
        };

        let join_handle = tokio::spawn(worker.run(shutdown_rx));

        info!(
            queue = %self.config.queue_name,
            concurrency = self.config.concurrency,
            "Started queue worker"
        );

        WorkerHandle {
            shutdown_tx,
            join_handle,
        }
    }
}

/// Claims jobs and hands them to runners, at most `concurrency` at a time
struct Worker<P> {
    runner: Arc<Runner<P>>,
    config: QueueConfig,
}

impl<P: JobProcessor> Worker<P> {
    async fn run(self, mut shutdown_rx: oneshot::Receiver<()>) -> QueueResult<()> {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let mut in_flight = JoinSet::new();
        let backend = self.runner.backend.clone();
        let queue = self.config.queue_name.as_str();

        let reaper_runner = self.runner.clone();
        let reaper = tokio::spawn(
            LeaseReaper::new(backend.clone(), queue)
                .with_interval(self.config.reaper_interval)
                .start(move |record| {
                    let runner = reaper_runner.clone();
                    async move { runner.lease_lost(record).await }
                }),
        );

        info!("Worker started for queue: {}", queue);

        loop {
            while let Some(joined) = in_flight.try_join_next() {
                if let Err(e) = joined {
                    error!("Job task aborted: {}", e);
                }
            }

            let permit = tokio::select! {
                _ = &mut shutdown_rx => break,
                permit = semaphore.clone().acquire_owned() => {
                    permit.map_err(|_| QueueError::WorkerShutdown)?
                }
            };

            let pause = match backend.claim(queue, self.config.lease_duration).await {
                Ok(Some(job)) => {
                    let runner = self.runner.clone();
                    in_flight.spawn(async move {
                        let _permit = permit;
                        runner.execute(job).await;
                    });
                    continue;
                }
                Ok(None) => self.config.poll_interval,
                Err(e) => {
                    error!("Error claiming job: {}", e);
                    ERROR_BACKOFF
                }
            };

            drop(permit);
            tokio::select! {
                _ = &mut shutdown_rx => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        reaper.abort();
        info!(in_flight = in_flight.len(), "Worker shutdown requested, draining in-flight jobs");
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!("Job task aborted: {}", e);
            }
        }

        info!("Worker stopped");
        Ok(())
    }
}

/// Runs one claimed job and records its outcome
struct Runner<P> {
    backend: Arc<dyn QueueBackend>,
    metrics: Arc<LiveMetrics>,
    processor: Arc<P>,
    queue: String,
    lease: Duration,
}

impl<P: JobProcessor> Runner<P> {
    async fn execute(&self, job: ClaimedJob) {
        let span = info_span!(
            "queue.job",
            job_id = %job.record.job_id,
            queue = %self.queue,
            attempt = job.record.attempts_made,
        );
        self.execute_inner(job).instrument(span).await
    }

    async fn execute_inner(&self, job: ClaimedJob) {
        let ClaimedJob {
            record, lease_token, ..
        } = job;
        let job_id = record.job_id.clone();

        let started = Instant::now();
        let work = AssertUnwindSafe(self.processor.process(&record)).catch_unwind();
        let outcome = tokio::select! {
            outcome = work => outcome.unwrap_or_else(|_| Err(JobError::permanent("job handler panicked"))),
            never = self.keep_lease(&job_id, &lease_token) => match never {},
        };
        self.metrics.record_execution_time(&self.queue, started.elapsed());

        match outcome {
            Ok(()) => {
                if let Err(e) = self.backend.ack_complete(&job_id, &lease_token).await {
                    error!("Failed to acknowledge completion of job {}: {}", job_id, e);
                    return;
                }
                self.metrics.increment_jobs_completed(&self.queue);
                info!("Job {} completed", job_id);
                self.processor.on_completed(&record).await;
            }
            Err(job_error) => {
                let will_retry = job_error.is_retryable() && record.has_attempts_left();
                let retry_at = will_retry.then(|| retry_time(&record, &job_error));

                if let Err(e) = self
                    .backend
                    .ack_fail(&job_id, &lease_token, job_error.message().to_string(), retry_at)
                    .await
                {
                    error!("Failed to acknowledge failure of job {}: {}", job_id, e);
                    return;
                }

                if will_retry {
                    self.metrics.increment_jobs_retried(&self.queue);
                    warn!("Job {} failed, will retry: {}", job_id, job_error);
                } else {
                    self.metrics.increment_jobs_failed(&self.queue);
                    error!("Job {} failed permanently: {}", job_id, job_error);
                }

                let info = FailureInfo {
                    attempts_made: record.attempts_made,
                    max_attempts: record.message.attempts,
                    will_retry,
                    retry_at,
                };
                self.processor.on_failed(&record, &job_error, &info).await;
            }
        }
    }
}

impl<P: JobProcessor> Runner<P> {
    /// Renew the lease every half lease while the job runs. Stops renewing
    /// once the lease is lost; the ack will then be refused.
    async fn keep_lease(&self, job_id: &JobId, lease_token: &LeaseToken) -> Infallible {
        let mut ticker = tokio::time::interval((self.lease / 2).max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match self.backend.extend_lease(job_id, lease_token, self.lease).await {
                Ok(lease_until) => debug!("Renewed lease of job {} until {}", job_id, lease_until),
                Err(e) => {
                    warn!("Lost lease of job {}: {}", job_id, e);
                    return std::future::pending().await;
                }
            }
        }
    }

    /// Report a job the reaper failed because its last lease ran out
    async fn lease_lost(&self, record: QueueRecord) {
        let message = record
            .last_error
            .clone()
            .unwrap_or_else(|| LEASE_EXPIRED_FINAL.to_string());
        self.metrics.increment_jobs_failed(&self.queue);
        error!("Job {} failed permanently: {}", record.job_id, message);

        let info = FailureInfo {
            attempts_made: record.attempts_made,
            max_attempts: record.message.attempts,
            will_retry: false,
            retry_at: None,
        };
        self.processor
            .on_failed(&record, &JobError::permanent(message), &info)
            .await;
    }
}

/// When the next attempt may run; immediately without a backoff strategy
fn retry_time(record: &QueueRecord, error: &JobError) -> DateTime<Utc> {
    let delay = record
        .message
        .backoff
        .as_ref()
        .map_or(Duration::ZERO, |strategy| strategy.delay(record.attempts_made, error, record));
    Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero())
}
