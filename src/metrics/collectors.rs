//! High-level metric recording for queue and worker events.
//!
//! The `MetricsCollector` struct wraps the raw Prometheus metrics and gives
//! the queue manager and workers one call per event. Every method is a no-op
//! until `init_metrics()` has run.

use super::prometheus::{
    ACTIVE_JOBS, ACTIVE_WORKERS, DEAD_LETTER_SIZE, JOBS_IN_PROGRESS, JOBS_TOTAL, JOB_DURATION,
    QUEUE_DEPTH,
};

/// Metrics collector for recording eval-queue operational metrics.
///
/// # Example
///
/// ```ignore
/// use eval_queue::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
///
/// collector.record_transition("completed", "llama-3-8b");
/// collector.record_execution("llama-3-8b", "completed", 42.0);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Create a new MetricsCollector instance.
    pub fn new() -> Self {
        Self
    }

    /// Record a job lifecycle transition.
    ///
    /// `outcome` is one of `completed`, `retried`, `dead_lettered` or
    /// `cancelled`.
    pub fn record_transition(&self, outcome: &str, model: &str) {
        if let Some(jobs_total) = JOBS_TOTAL.get() {
            jobs_total.with_label_values(&[outcome, model]).inc();
        }

        tracing::trace!(outcome = outcome, model = model, "Recorded job transition metric");
    }

    /// Record how long an executor ran for one job.
    pub fn record_execution(&self, model: &str, outcome: &str, duration_secs: f64) {
        if let Some(job_duration) = JOB_DURATION.get() {
            job_duration
                .with_label_values(&[model, outcome])
                .observe(duration_secs);
        }

        tracing::trace!(
            model = model,
            outcome = outcome,
            duration_secs = duration_secs,
            "Recorded job execution metric"
        );
    }

    /// Update the number of claimable jobs for a model.
    pub fn update_queue_depth(&self, model: &str, depth: usize) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            queue_depth.with_label_values(&[model]).set(depth as f64);
        }

        tracing::trace!(model = model, depth = depth, "Updated queue depth metric");
    }

    /// Update the number of ACTIVE jobs for a model.
    pub fn update_active_jobs(&self, model: &str, count: usize) {
        if let Some(active_jobs) = ACTIVE_JOBS.get() {
            active_jobs.with_label_values(&[model]).set(count as f64);
        }
    }

    pub fn update_dead_letter_size(&self, size: usize) {
        if let Some(dead_letter_size) = DEAD_LETTER_SIZE.get() {
            dead_letter_size.set(size as f64);
        }
    }

    /// Update the count of running workers.
    pub fn update_workers(&self, count: usize) {
        if let Some(active_workers) = ACTIVE_WORKERS.get() {
            active_workers.set(count as f64);
        }

        tracing::trace!(count = count, "Updated active workers metric");
    }

    /// Increment the count of jobs in progress by 1.
    pub fn inc_jobs_in_progress(&self) {
        if let Some(jobs_in_progress) = JOBS_IN_PROGRESS.get() {
            jobs_in_progress.inc();
        }
    }

    /// Decrement the count of jobs in progress by 1.
    pub fn dec_jobs_in_progress(&self) {
        if let Some(jobs_in_progress) = JOBS_IN_PROGRESS.get() {
            jobs_in_progress.dec();
        }
    }
}
