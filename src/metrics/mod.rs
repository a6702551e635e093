//! Metrics module for Prometheus-based monitoring.
//!
//! Records job transitions, executor latency, queue depth and worker counts.
//! Gauges describing shared queue state are refreshed from
//! [`EvaluationQueueManager::publish_metrics`](crate::scheduler::EvaluationQueueManager::publish_metrics).
//!
//! # Example
//!
//! ```ignore
//! use eval_queue::metrics::{init_metrics, export_metrics};
//!
//! init_metrics().expect("Failed to initialize metrics");
//! queue.publish_metrics().await?;
//! println!("{}", export_metrics());
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    ACTIVE_JOBS, ACTIVE_WORKERS, DEAD_LETTER_SIZE, JOBS_IN_PROGRESS, JOBS_TOTAL, JOB_DURATION,
    QUEUE_DEPTH, REGISTRY,
};
