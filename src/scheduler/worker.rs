//! Evaluation worker.
//!
//! A worker runs one job at a time:
//!
//! 1. claim a job through [`EvaluationQueueManager::dequeue`]
//! 2. run the injected [`JobExecutor`] under the job's own timeout
//! 3. report the outcome with `complete` or `fail`
//!
//! Store errors never end the loop. The worker sleeps with a doubling backoff
//! and tries again. Executor errors, panics and timeouts are all recorded as
//! failures against the job, which the manager then retries or dead-letters.
//!
//! Shutdown is cooperative. A [`ShutdownToken`] is checked once per
//! iteration, so the job in flight always finishes and gets reported before
//! the loop exits.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use super::config::EvaluationQueueConfig;
use super::job::EvaluationJob;
use super::queue::{EvaluationQueueManager, FailOutcome};
use super::worker_pool::SharedPoolStats;
use crate::error::{ExecutionError, QueueError};
use crate::metrics::MetricsCollector;

/// How many times an outcome report is retried on store errors.
const REPORT_ATTEMPTS: u32 = 3;

/// First delay after a store error.
const INITIAL_ERROR_BACKOFF: Duration = Duration::from_millis(500);

/// Runs the evaluation described by a job.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Returns the job's result payload.
    async fn execute(&self, job: &EvaluationJob) -> Result<Value, ExecutionError>;
}

/// Adapts an async closure into a [`JobExecutor`].
pub struct FnExecutor<F> {
    func: F,
}

/// Wraps `func` as an executor.
///
/// ```ignore
/// let executor = executor_fn(|job: EvaluationJob| async move {
///     Ok(serde_json::json!({"model": job.model_id}))
/// });
/// ```
pub fn executor_fn<F, Fut>(func: F) -> FnExecutor<F>
where
    F: Fn(EvaluationJob) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, ExecutionError>> + Send,
{
    FnExecutor { func }
}

#[async_trait]
impl<F, Fut> JobExecutor for FnExecutor<F>
where
    F: Fn(EvaluationJob) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, ExecutionError>> + Send,
{
    async fn execute(&self, job: &EvaluationJob) -> Result<Value, ExecutionError> {
        (self.func)(job.clone()).await
    }
}

struct ShutdownState {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Clonable stop flag shared by workers.
///
/// Cancelling wakes any idle sleep immediately. A running job is never
/// interrupted.
#[derive(Clone)]
pub struct ShutdownToken {
    state: Arc<ShutdownState>,
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self {
            state: Arc::new(ShutdownState {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Requests a stop.
    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::SeqCst);
        self.state.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.state.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Sleeps for `duration` or until cancelled. Returns `true` if cancelled.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => self.is_cancelled(),
            _ = self.cancelled() => true,
        }
    }
}

/// Loop settings for one worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Sleep between polls when nothing is claimable.
    pub poll_interval: Duration,
    /// Ceiling for the store-error backoff.
    pub error_backoff_max: Duration,
    /// Only claim jobs for this model.
    pub model_id: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::from(&EvaluationQueueConfig::default())
    }
}

impl From<&EvaluationQueueConfig> for WorkerConfig {
    fn from(config: &EvaluationQueueConfig) -> Self {
        Self {
            poll_interval: config.poll_interval,
            error_backoff_max: config.error_backoff_max,
            model_id: None,
        }
    }
}

impl WorkerConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_error_backoff_max(mut self, max: Duration) -> Self {
        self.error_backoff_max = max;
        self
    }

    pub fn with_model(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = Some(model_id.into());
        self
    }
}

/// What one loop iteration did.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// Nothing was claimable.
    Idle,
    Completed {
        job_id: String,
        elapsed: Duration,
    },
    /// The job failed. `outcome` is `None` if the manager ignored the report
    /// because the job had already left ACTIVE.
    Failed {
        job_id: String,
        error: String,
        outcome: Option<FailOutcome>,
    },
}

/// Polls the queue and executes claimed jobs.
pub struct EvaluationWorker {
    id: String,
    queue: Arc<EvaluationQueueManager>,
    executor: Arc<dyn JobExecutor>,
    config: WorkerConfig,
    stats: Arc<SharedPoolStats>,
    metrics: MetricsCollector,
}

impl EvaluationWorker {
    pub fn new(
        id: impl Into<String>,
        queue: Arc<EvaluationQueueManager>,
        executor: Arc<dyn JobExecutor>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            id: id.into(),
            queue,
            executor,
            config,
            stats: Arc::new(SharedPoolStats::new()),
            metrics: MetricsCollector::new(),
        }
    }

    /// Shares job statistics with a pool.
    pub(crate) fn with_stats(mut self, stats: Arc<SharedPoolStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Main worker loop. Returns once `shutdown` is cancelled.
    pub async fn run(&self, shutdown: ShutdownToken) {
        info!(worker_id = %self.id, model = ?self.config.model_id, "Worker started");

        let mut backoff = self.initial_backoff();
        while !shutdown.is_cancelled() {
            match self.run_once().await {
                Ok(JobOutcome::Idle) => {
                    backoff = self.initial_backoff();
                    debug!(worker_id = %self.id, "No jobs available");
                    shutdown.sleep(self.config.poll_interval).await;
                }
                Ok(_) => backoff = self.initial_backoff(),
                Err(e) => {
                    error!(
                        worker_id = %self.id,
                        error = %e,
                        retry_in_ms = backoff.as_millis() as u64,
                        "Queue operation failed"
                    );
                    shutdown.sleep(backoff).await;
                    backoff = next_backoff(backoff, self.config.error_backoff_max);
                }
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    /// Claims and processes at most one job, without sleeping.
    pub async fn run_once(&self) -> Result<JobOutcome, QueueError> {
        match self.queue.dequeue(self.config.model_id.as_deref()).await? {
            Some(job) => self.process(job).await,
            None => Ok(JobOutcome::Idle),
        }
    }

    async fn process(&self, job: EvaluationJob) -> Result<JobOutcome, QueueError> {
        info!(
            worker_id = %self.id,
            job_id = %job.id,
            model_id = %job.model_id,
            attempt = job.attempt_count + 1,
            "Processing evaluation job"
        );

        self.stats.increment_active();
        self.metrics.inc_jobs_in_progress();
        let started = Instant::now();
        let execution = self.execute(&job).await;
        let elapsed = started.elapsed();
        self.metrics.dec_jobs_in_progress();
        self.stats.decrement_active();

        match execution {
            Ok(result) => {
                let elapsed_ms = elapsed.as_millis() as u64;
                let recorded = self
                    .report(&job.id, || {
                        self.queue.complete(&job.id, result.clone(), Some(elapsed_ms))
                    })
                    .await?;
                if recorded {
                    self.stats.record_completion(elapsed);
                    self.metrics
                        .record_execution(&job.model_id, "completed", elapsed.as_secs_f64());
                } else {
                    warn!(
                        worker_id = %self.id,
                        job_id = %job.id,
                        "Completion ignored, job is no longer active"
                    );
                }

                Ok(JobOutcome::Completed {
                    job_id: job.id,
                    elapsed,
                })
            }
            Err(e) => {
                let message = e.to_string();
                let outcome = self
                    .report(&job.id, || self.queue.fail(&job.id, &message))
                    .await?;
                if outcome.is_some() {
                    self.stats.record_failure(elapsed);
                    self.metrics
                        .record_execution(&job.model_id, "failed", elapsed.as_secs_f64());
                }

                Ok(JobOutcome::Failed {
                    job_id: job.id,
                    error: message,
                    outcome,
                })
            }
        }
    }

    /// Runs the executor under the job's timeout, converting panics to errors.
    async fn execute(&self, job: &EvaluationJob) -> Result<Value, ExecutionError> {
        let timeout = Duration::from_secs(job.timeout_seconds);
        let call = AssertUnwindSafe(self.executor.execute(job)).catch_unwind();

        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => Err(ExecutionError::Panicked(panic_message(panic.as_ref()))),
            Err(_) => Err(ExecutionError::Timeout(timeout)),
        }
    }

    /// Retries an outcome report on store errors.
    ///
    /// If every attempt fails the job stays ACTIVE until the stale-job sweep
    /// picks it up.
    async fn report<T, F, Fut>(&self, job_id: &str, mut call: F) -> Result<T, QueueError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, QueueError>>,
    {
        let mut delay = self.initial_backoff();
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < REPORT_ATTEMPTS => {
                    warn!(
                        worker_id = %self.id,
                        job_id = %job_id,
                        attempt = attempt,
                        error = %e,
                        "Failed to report job outcome, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = next_backoff(delay, self.config.error_backoff_max);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn initial_backoff(&self) -> Duration {
        INITIAL_ERROR_BACKOFF.min(self.config.error_backoff_max)
    }
}

/// Doubles `current`, capped at `max`.
pub fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
