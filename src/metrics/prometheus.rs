//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by eval-queue and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all eval-queue metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Job lifecycle transitions, labeled by outcome and model.
///
/// Outcomes are `completed`, `retried`, `dead_lettered` and `cancelled`.
pub static JOBS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Executor wall time in seconds, labeled by model and outcome.
pub static JOB_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Number of claimable jobs, labeled by model.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Number of ACTIVE jobs, labeled by model.
pub static ACTIVE_JOBS: OnceLock<GaugeVec> = OnceLock::new();

/// Current length of the dead-letter list.
pub static DEAD_LETTER_SIZE: OnceLock<Gauge> = OnceLock::new();

/// Number of jobs currently executing in this process.
pub static JOBS_IN_PROGRESS: OnceLock<Gauge> = OnceLock::new();

/// Number of running workers in this process.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// This function should be called once at application startup. Later calls
/// build a fresh registry but leave the already-published statics in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    // Job metrics
    let jobs_total = CounterVec::new(
        Opts::new("eval_queue_jobs_total", "Evaluation job transitions"),
        &["outcome", "model"],
    )?;

    let job_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "eval_queue_job_duration_seconds",
            "Evaluation executor duration in seconds",
        )
        .buckets(vec![1.0, 10.0, 30.0, 60.0, 300.0, 900.0, 1800.0, 3600.0]),
        &["model", "outcome"],
    )?;

    // Queue metrics
    let queue_depth = GaugeVec::new(
        Opts::new("eval_queue_depth", "Number of claimable evaluation jobs"),
        &["model"],
    )?;

    let active_jobs = GaugeVec::new(
        Opts::new("eval_queue_active_jobs", "Number of evaluation jobs being processed"),
        &["model"],
    )?;

    let dead_letter_size = Gauge::new(
        "eval_queue_dead_letter_size",
        "Number of jobs in the dead letter queue",
    )?;

    // Worker metrics
    let jobs_in_progress = Gauge::new(
        "eval_queue_jobs_in_progress",
        "Number of jobs executing in this process",
    )?;

    let active_workers = Gauge::new("eval_queue_active_workers", "Number of active workers")?;

    registry.register(Box::new(jobs_total.clone()))?;
    registry.register(Box::new(job_duration.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(active_jobs.clone()))?;
    registry.register(Box::new(dead_letter_size.clone()))?;
    registry.register(Box::new(jobs_in_progress.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = JOBS_TOTAL.set(jobs_total);
    let _ = JOB_DURATION.set(job_duration);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = ACTIVE_JOBS.set(active_jobs);
    let _ = DEAD_LETTER_SIZE.set(dead_letter_size);
    let _ = JOBS_IN_PROGRESS.set(jobs_in_progress);
    let _ = ACTIVE_WORKERS.set(active_workers);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// If the registry has not been initialized or encoding fails, returns a
/// comment line describing the problem.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
