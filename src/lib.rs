//! eval-queue: distributed job queue and worker pool for model evaluations.
//!
//! Producers enqueue evaluation jobs scoped to a model. The queue enforces
//! per-model and global concurrency caps, schedules by priority with FIFO
//! tie-break, retries failures with exponential backoff and dead-letters jobs
//! that keep failing. Workers claim jobs atomically from a shared Redis store
//! and run them through a pluggable executor.

pub mod benchmark;
pub mod cli;
pub mod error;
pub mod metrics;
pub mod scheduler;

pub use error::{ConfigError, ExecutionError, QueueError, RecordError};
pub use scheduler::{EvaluationJob, EvaluationQueueConfig, EvaluationQueueManager, JobStatus};
