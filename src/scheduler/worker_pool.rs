//! Pool of evaluation workers sharing one queue manager.
//!
//! Each worker runs as an independent async task and claims jobs from the
//! shared store. Workers in other processes coordinate only through the
//! store, so several pools can run against the same queue.
//!
//! # Features
//!
//! - Configurable number of workers
//! - Stale-job recovery on start and on a fixed interval while running
//! - Graceful shutdown through a shared [`ShutdownToken`]
//! - Pool statistics tracking

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::queue::EvaluationQueueManager;
use super::worker::{EvaluationWorker, JobExecutor, ShutdownToken, WorkerConfig};
use crate::error::QueueError;
use crate::metrics::MetricsCollector;

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Pool is already running.
    #[error("Pool is already running")]
    AlreadyRunning,

    /// Pool is not running.
    #[error("Pool is not running")]
    NotRunning,

    /// Shutdown timed out.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks to spawn.
    pub num_workers: usize,
    /// Loop settings shared by every worker.
    pub worker: WorkerConfig,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 4,
            worker: WorkerConfig::default(),
            // Longer than the default job timeout so in-flight jobs can finish.
            shutdown_timeout: Duration::from_secs(1860),
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a new configuration with the specified number of workers.
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    /// Sets the per-worker loop settings.
    pub fn with_worker(mut self, worker: WorkerConfig) -> Self {
        self.worker = worker;
        self
    }

    /// Sets the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub num_workers: usize,
    /// Number of workers currently processing jobs.
    pub active_workers: usize,
    /// Total number of jobs completed successfully.
    pub jobs_completed: u64,
    /// Total number of jobs that failed, timed out or panicked.
    pub jobs_failed: u64,
    /// Average job processing duration.
    pub average_job_duration: Duration,
}

impl PoolStats {
    /// Returns the total number of jobs processed (completed + failed).
    pub fn total_processed(&self) -> u64 {
        self.jobs_completed + self.jobs_failed
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.jobs_completed as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
pub(crate) struct SharedPoolStats {
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    pub(crate) fn new() -> Self {
        Self {
            jobs_completed: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            active_workers: AtomicU64::new(0),
        }
    }

    pub(crate) fn record_completion(&self, duration: Duration) {
        self.jobs_completed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    pub(crate) fn record_failure(&self, duration: Duration) {
        self.jobs_failed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    pub(crate) fn increment_active(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn decrement_active(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let completed = self.jobs_completed.load(Ordering::SeqCst);
        let failed = self.jobs_failed.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);
        let active = self.active_workers.load(Ordering::SeqCst);

        let total_jobs = completed + failed;
        let average_duration = if total_jobs > 0 {
            Duration::from_millis(total_duration_ms / total_jobs)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            active_workers: active as usize,
            jobs_completed: completed,
            jobs_failed: failed,
            average_job_duration: average_duration,
        }
    }
}

/// Worker pool that manages multiple workers processing jobs from a queue.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    queue: Arc<EvaluationQueueManager>,
    executor: Arc<dyn JobExecutor>,
    shutdown: ShutdownToken,
    worker_handles: Vec<JoinHandle<()>>,
    /// Periodic stale-job sweep, if enabled.
    sweeper: Option<JoinHandle<()>>,
    stats: Arc<SharedPoolStats>,
    is_running: AtomicBool,
    metrics: MetricsCollector,
}

impl WorkerPool {
    /// Creates a pool over an existing queue manager.
    pub fn new(
        config: WorkerPoolConfig,
        queue: Arc<EvaluationQueueManager>,
        executor: Arc<dyn JobExecutor>,
    ) -> Self {
        Self {
            config,
            queue,
            executor,
            shutdown: ShutdownToken::new(),
            worker_handles: Vec::new(),
            sweeper: None,
            stats: Arc::new(SharedPoolStats::new()),
            is_running: AtomicBool::new(false),
            metrics: MetricsCollector::new(),
        }
    }

    /// Starts all workers in the pool.
    ///
    /// Jobs left ACTIVE by crashed workers are recovered first. Workers begin
    /// polling immediately, and the sweep repeats every
    /// `recovery_interval` of the queue configuration until shutdown.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool is already running.
    pub async fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }

        match self.queue.recover_stale_jobs().await {
            Ok(recovered) => {
                if recovered > 0 {
                    info!(recovered = recovered, "Recovered stale jobs before starting workers");
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to recover stale jobs");
            }
        }

        self.shutdown = ShutdownToken::new();
        for i in 0..self.config.num_workers {
            let worker = EvaluationWorker::new(
                format!("worker-{}", i),
                Arc::clone(&self.queue),
                Arc::clone(&self.executor),
                self.config.worker.clone(),
            )
            .with_stats(Arc::clone(&self.stats));
            let shutdown = self.shutdown.clone();

            let handle = tokio::spawn(async move {
                worker.run(shutdown).await;
            });

            self.worker_handles.push(handle);
        }
        self.sweeper = self.spawn_sweeper();

        self.is_running.store(true, Ordering::SeqCst);
        self.metrics.update_workers(self.config.num_workers);
        info!(
            num_workers = self.config.num_workers,
            claim_mode = %self.queue.claim_mode(),
            "Worker pool started"
        );

        Ok(())
    }

    /// Gracefully shuts down all workers.
    ///
    /// Workers stop polling and finish the job they are running.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ShutdownTimeout` if workers don't stop within
    /// the configured timeout.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!("Initiating worker pool shutdown");
        self.shutdown.cancel();

        let sweeper = self.sweeper.take();
        let shutdown_future = async {
            for handle in self.worker_handles.drain(..) {
                if let Err(e) = handle.await {
                    error!(error = %e, "Worker task panicked during shutdown");
                }
            }
            if let Some(handle) = sweeper {
                if let Err(e) = handle.await {
                    error!(error = %e, "Stale job sweep panicked during shutdown");
                }
            }
        };

        let result = tokio::time::timeout(self.config.shutdown_timeout, shutdown_future).await;
        self.is_running.store(false, Ordering::SeqCst);
        self.metrics.update_workers(0);

        match result {
            Ok(()) => {
                info!("Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => Err(PoolError::ShutdownTimeout(self.config.shutdown_timeout)),
        }
    }

    /// Spawns the periodic stale-job sweep. Returns `None` when disabled.
    fn spawn_sweeper(&self) -> Option<JoinHandle<()>> {
        let interval = self.queue.config().recovery_interval;
        if interval.is_zero() {
            return None;
        }

        let queue = Arc::clone(&self.queue);
        let shutdown = self.shutdown.clone();
        Some(tokio::spawn(async move {
            while !shutdown.sleep(interval).await {
                if let Err(e) = queue.recover_stale_jobs().await {
                    warn!(error = %e, "Stale job sweep failed");
                }
            }
        }))
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.config.num_workers)
    }

    /// Scales the pool to a new number of workers.
    ///
    /// A running pool is stopped and restarted with the new count. In-flight
    /// jobs finish before the restart.
    pub async fn scale(&mut self, num_workers: usize) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            self.config.num_workers = num_workers;
            return Ok(());
        }

        if num_workers == self.config.num_workers {
            return Ok(());
        }

        info!(
            current = self.config.num_workers,
            target = num_workers,
            "Scaling worker pool"
        );

        self.shutdown().await?;
        self.config.num_workers = num_workers;
        self.start().await?;

        Ok(())
    }

    /// Returns whether the pool is currently running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Returns the number of workers in the pool.
    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }

    /// Token that stops the current generation of workers.
    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown.clone()
    }

    pub fn queue(&self) -> &Arc<EvaluationQueueManager> {
        &self.queue
    }
}

/// Cancels `token` when the process receives Ctrl-C.
pub fn cancel_on_ctrl_c(token: ShutdownToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received interrupt, stopping workers after their current jobs");
                token.cancel();
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for interrupt signal");
            }
        }
    })
}
