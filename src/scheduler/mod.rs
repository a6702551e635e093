//! Distributed evaluation job queue with per-model concurrency caps.
//!
//! This module provides the queue and the workers that drain it:
//!
//! - **EvaluationJob**: the job entity and its two serialized forms
//! - **EvaluationQueueManager**: every job-lifecycle transition, applied
//!   atomically against a shared [`QueueStore`]
//! - **EvaluationWorker** / **WorkerPool**: polling loops that claim jobs,
//!   run an injected executor under a timeout and report the outcome
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │   Producer   │
//!                      └──────┬───────┘
//!                             │ enqueue
//!                      ┌──────▼───────┐
//!                      │    Redis     │  pending / delayed / active sets,
//!                      │    store     │  dead letters, job records
//!                      └──────┬───────┘
//!                             │ atomic claim
//!         ┌───────────────────┼───────────────────┐
//!         ▼                   ▼                   ▼
//!    ┌─────────┐         ┌─────────┐         ┌─────────┐
//!    │ Worker 1│         │ Worker 2│         │ Worker N│
//!    └─────────┘         └─────────┘         └─────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use eval_queue::scheduler::{
//!     executor_fn, EvaluationJob, EvaluationQueueConfig, EvaluationQueueManager, WorkerPool,
//!     WorkerPoolConfig, WorkerConfig,
//! };
//! use std::sync::Arc;
//!
//! let config = EvaluationQueueConfig::from_env()?;
//! let queue = Arc::new(EvaluationQueueManager::connect(config.clone()).await?);
//!
//! let job = EvaluationJob::new("llama-3-8b", serde_json::json!({"benchmark_spec": {"adapter": "exact_match"}}))
//!     .with_priority(10);
//! queue.enqueue(job).await?;
//!
//! let executor = executor_fn(|job| async move { Ok(serde_json::json!({"model": job.model_id})) });
//! let pool_config = WorkerPoolConfig::new(4).with_worker(WorkerConfig::from(&config));
//! let mut pool = WorkerPool::new(pool_config, queue, Arc::new(executor));
//! pool.start().await?;
//!
//! // Graceful shutdown
//! pool.shutdown().await?;
//! ```
//!
//! # Reliability Features
//!
//! - **Atomic claim**: promotion, cap checks and the claim run in one server-side script
//! - **Guarded transitions**: a transition only applies if the job record is unchanged
//! - **Retry with backoff**: failed jobs wait `base * 2^(attempt-1)` in a delayed set
//! - **Dead letter queue**: jobs that exhaust their attempts are kept for inspection
//! - **Crash recovery**: ACTIVE jobs past their timeout are failed on pool start
//! - **Graceful shutdown**: workers finish their current job before stopping

pub mod config;
pub mod job;
pub mod memory_store;
pub mod queue;
pub mod redis_store;
pub mod store;
pub mod worker;
pub mod worker_pool;

pub use config::EvaluationQueueConfig;
pub use job::{EvaluationJob, JobStatus};
pub use memory_store::MemoryStore;
pub use queue::{EvaluationQueueManager, FailOutcome, ModelMetrics, QueueMetrics};
pub use redis_store::RedisStore;
pub use store::{ClaimMode, QueueStore};
pub use worker::{
    executor_fn, EvaluationWorker, FnExecutor, JobExecutor, JobOutcome, ShutdownToken,
    WorkerConfig,
};
pub use worker_pool::{cancel_on_ctrl_c, PoolError, PoolStats, WorkerPool, WorkerPoolConfig};
