//! Evaluation queue manager.
//!
//! The manager owns every job-lifecycle transition. State lives in a shared
//! [`QueueStore`]:
//!
//! - pending sets (global and per model), ordered by priority then arrival
//! - a delayed set holding jobs in retry backoff
//! - active sets (global and per model) whose sizes are the concurrency counts
//! - a dead-letter list of permanently failed jobs
//! - one record per job, plus completion/failure/latency counters
//!
//! # State machine
//!
//! ```text
//! PENDING --dequeue--> ACTIVE --complete--> COMPLETED
//!                        |
//!                        +--fail, attempts left--> PENDING (delayed set) --promotion--> PENDING
//!                        +--fail, exhausted-----> DEAD --retry_dlq_job--> PENDING
//! PENDING / FAILED --cancel--> FAILED
//! ```
//!
//! Each transition reads the record, plans the index moves and the new
//! record, and applies them in one guarded store step. If the record changed
//! in between (for example a cancel raced a claim), the plan is discarded and
//! recomputed from the fresh record.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::config::EvaluationQueueConfig;
use super::job::{
    queue_score, sanitize_error, EvaluationJob, JobStatus, MAX_PRIORITY, PRIORITY_WEIGHT,
};
use super::memory_store::MemoryStore;
use super::redis_store::RedisStore;
use super::store::{ClaimMode, ClaimRequest, Counter, QueueStore, RecordGuard, StoreOp};
use crate::error::QueueError;
use crate::metrics::MetricsCollector;

/// How often a transition is re-planned after losing a race.
const MAX_TRANSITION_ATTEMPTS: usize = 5;

/// Retry delays stop doubling after this many attempts.
const MAX_BACKOFF_EXPONENT: u32 = 16;

/// Upper bound on a single retry delay (one year).
const MAX_RETRY_DELAY_SECONDS: i64 = 365 * 24 * 60 * 60;

/// Error message recorded on cancelled jobs.
pub const CANCELLED_MESSAGE: &str = "cancelled";

/// Result of recording a failure against a job.
#[derive(Debug, Clone, PartialEq)]
pub enum FailOutcome {
    /// The job went back to PENDING and waits in the delayed set.
    Retrying {
        attempt: u32,
        next_retry_at: DateTime<Utc>,
    },
    /// The job exhausted its attempts and was dead-lettered.
    DeadLettered { attempts: u32 },
}

/// Depth and concurrency of one model.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelMetrics {
    pub queue_depth: u64,
    pub active: u64,
}

/// Point-in-time snapshot of queue state.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueMetrics {
    /// Jobs in the global pending set.
    pub queue_depth: u64,
    /// Jobs waiting out a retry backoff.
    pub delayed: u64,
    /// Jobs currently claimed by workers.
    pub active: u64,
    pub completed_total: i64,
    /// Number of recorded failures, retried or not.
    pub failed_total: i64,
    pub dead_lettered_total: i64,
    /// Current length of the dead-letter list.
    pub dead_letter_size: u64,
    pub average_processing_ms: f64,
    pub claim_mode: ClaimMode,
    pub models: BTreeMap<String, ModelMetrics>,
}

/// Owns all job-lifecycle state in the shared store.
pub struct EvaluationQueueManager {
    store: Arc<dyn QueueStore>,
    config: EvaluationQueueConfig,
    metrics: MetricsCollector,
}

impl EvaluationQueueManager {
    /// Creates a manager over an existing store.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Config` if `config` fails validation.
    pub fn new(
        store: Arc<dyn QueueStore>,
        config: EvaluationQueueConfig,
    ) -> Result<Self, QueueError> {
        config.validate()?;
        Ok(Self {
            store,
            config,
            metrics: MetricsCollector::new(),
        })
    }

    /// Connects to the Redis store described by `config`.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Config` for invalid settings and the store's
    /// connection errors otherwise.
    pub async fn connect(config: EvaluationQueueConfig) -> Result<Self, QueueError> {
        config.validate()?;
        let store = RedisStore::connect(&config).await?;
        Self::new(Arc::new(store), config)
    }

    /// Creates a manager backed by an in-process store.
    pub fn in_memory(config: EvaluationQueueConfig) -> Result<Self, QueueError> {
        Self::new(Arc::new(MemoryStore::new()), config)
    }

    pub fn config(&self) -> &EvaluationQueueConfig {
        &self.config
    }

    /// Guarantee offered by the store's claim operation.
    pub fn claim_mode(&self) -> ClaimMode {
        self.store.claim_mode()
    }

    /// Enqueues a job and returns its id.
    ///
    /// Status is reset to PENDING, `updated_at` is stamped, and a zero
    /// `max_attempts` or `timeout_seconds` is replaced by the queue default.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::InvalidJob` if the id or model id is empty or the
    /// priority is out of range, and `QueueError::DuplicateJob` if a job with
    /// the same id was enqueued before.
    pub async fn enqueue(&self, job: EvaluationJob) -> Result<String, QueueError> {
        let job = self.prepare(job, Utc::now())?;
        let job_id = job.id.clone();

        let guard = RecordGuard::absent(job_id.clone());
        if !self.store.apply(&[guard], Self::enqueue_ops(&job)).await? {
            return Err(QueueError::DuplicateJob(job_id));
        }

        info!(
            job_id = %job_id,
            model_id = %job.model_id,
            priority = job.priority,
            "Enqueued evaluation job"
        );
        Ok(job_id)
    }

    /// Enqueues several jobs in a single store step.
    ///
    /// Either every job is enqueued or none is. Fails with
    /// `QueueError::DuplicateJob` if an id repeats within the batch or
    /// already exists in the store.
    pub async fn enqueue_batch(
        &self,
        jobs: Vec<EvaluationJob>,
    ) -> Result<Vec<String>, QueueError> {
        if jobs.is_empty() {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let mut ids = Vec::with_capacity(jobs.len());
        let mut seen = HashSet::with_capacity(jobs.len());
        let mut guards = Vec::with_capacity(jobs.len());
        let mut ops = Vec::new();
        for job in jobs {
            let job = self.prepare(job, now)?;
            if !seen.insert(job.id.clone()) {
                return Err(QueueError::DuplicateJob(job.id));
            }
            guards.push(RecordGuard::absent(job.id.clone()));
            ops.extend(Self::enqueue_ops(&job));
            ids.push(job.id);
        }

        if !self.store.apply(&guards, ops).await? {
            let mut existing = None;
            for id in &ids {
                if self.store.load_record(id).await?.is_some() {
                    existing = Some(id.clone());
                    break;
                }
            }
            return Err(QueueError::DuplicateJob(
                existing.unwrap_or_else(|| ids.join(",")),
            ));
        }
        info!(count = ids.len(), "Enqueued evaluation job batch");
        Ok(ids)
    }

    fn prepare(
        &self,
        mut job: EvaluationJob,
        now: DateTime<Utc>,
    ) -> Result<EvaluationJob, QueueError> {
        if job.id.trim().is_empty() {
            return Err(QueueError::InvalidJob("job id cannot be empty".to_string()));
        }
        if job.model_id.trim().is_empty() {
            return Err(QueueError::InvalidJob(
                "model_id cannot be empty".to_string(),
            ));
        }
        if !(-MAX_PRIORITY..=MAX_PRIORITY).contains(&job.priority) {
            return Err(QueueError::InvalidJob(format!(
                "priority {} is outside -{MAX_PRIORITY}..={MAX_PRIORITY}",
                job.priority
            )));
        }
        let created_ms = job.created_at.timestamp_millis();
        if created_ms < 0 || created_ms as f64 >= PRIORITY_WEIGHT {
            return Err(QueueError::InvalidJob(format!(
                "created_at {} is outside the schedulable range",
                job.created_at
            )));
        }

        if job.max_attempts == 0 {
            job.max_attempts = self.config.max_retries;
        }
        if job.timeout_seconds == 0 {
            job.timeout_seconds = self.config.job_timeout_seconds;
        }
        job.status = JobStatus::Pending;
        job.updated_at = now;
        job.next_retry_at = None;
        job.queue_score = queue_score(job.priority, &job.created_at);
        Ok(job)
    }

    fn enqueue_ops(job: &EvaluationJob) -> Vec<StoreOp> {
        vec![
            StoreOp::put(job),
            StoreOp::AddPending {
                job_id: job.id.clone(),
                model_id: job.model_id.clone(),
                score: job.queue_score,
            },
            StoreOp::RegisterModel {
                model_id: job.model_id.clone(),
            },
        ]
    }

    /// Claims the next eligible job, optionally restricted to one model.
    ///
    /// Due retries are promoted first. Returns `None` when the global cap is
    /// reached or no scanned job's model is below its cap.
    pub async fn dequeue(
        &self,
        model_id: Option<&str>,
    ) -> Result<Option<EvaluationJob>, QueueError> {
        let request = ClaimRequest {
            model_id: model_id.map(str::to_string),
            now: Utc::now(),
            max_global: self.config.max_concurrent_global,
            max_per_model: self.config.max_concurrent_per_model,
            scan_limit: self.config.claim_scan_limit,
        };

        let Some(job_id) = self.store.claim(&request).await? else {
            return Ok(None);
        };

        match self.get_job(&job_id).await? {
            Some(job) => {
                debug!(
                    job_id = %job.id,
                    model_id = %job.model_id,
                    attempt = job.attempt_count + 1,
                    "Claimed evaluation job"
                );
                Ok(Some(job))
            }
            None => {
                warn!(job_id = %job_id, "Claimed job has no record");
                Ok(None)
            }
        }
    }

    /// Marks an ACTIVE job as completed and stores its result.
    ///
    /// `processing_time_ms` defaults to the time since the job was claimed.
    /// Returns `false` without error if the job is unknown or not ACTIVE.
    pub async fn complete(
        &self,
        job_id: &str,
        result: Value,
        processing_time_ms: Option<u64>,
    ) -> Result<bool, QueueError> {
        let outcome = self
            .transition(job_id, &[JobStatus::Active], |job, now| {
                let elapsed_ms = processing_time_ms.unwrap_or_else(|| {
                    let started = job.started_at.unwrap_or(job.updated_at);
                    (now - started).num_milliseconds().max(0) as u64
                });

                let mut done = job.clone();
                done.status = JobStatus::Completed;
                done.completed_at = Some(now);
                done.updated_at = now;
                done.result = Some(result.clone());
                done.error_message = None;

                let ops = vec![
                    StoreOp::RemoveActive {
                        job_id: job.id.clone(),
                        model_id: job.model_id.clone(),
                    },
                    StoreOp::put(&done),
                    StoreOp::Increment {
                        counter: Counter::Completed,
                        by: 1,
                    },
                    StoreOp::Increment {
                        counter: Counter::ProcessingTimeMs,
                        by: elapsed_ms as i64,
                    },
                    StoreOp::Increment {
                        counter: Counter::ProcessingSamples,
                        by: 1,
                    },
                ];
                (ops, elapsed_ms)
            })
            .await?;

        let Some((job, elapsed_ms)) = outcome else {
            return Ok(false);
        };

        self.metrics.record_transition("completed", &job.model_id);
        info!(
            job_id = %job_id,
            model_id = %job.model_id,
            processing_ms = elapsed_ms,
            "Evaluation job completed"
        );
        Ok(true)
    }

    /// Records a failed attempt.
    ///
    /// The error is sanitized before it is stored. The job leaves whichever
    /// active/pending/delayed set holds it and either waits out an exponential
    /// backoff in the delayed set or, once `attempt_count` reaches
    /// `max_attempts`, is dead-lettered. Returns `None` without error if the
    /// job is unknown or already finished.
    pub async fn fail(&self, job_id: &str, error: &str) -> Result<Option<FailOutcome>, QueueError> {
        let message = match sanitize_error(error) {
            m if m.is_empty() => "unknown error".to_string(),
            m => m,
        };
        let base_delay = self.config.retry_base_delay_seconds;

        let outcome = self
            .transition(
                job_id,
                &[JobStatus::Active, JobStatus::Pending],
                |job, now| {
                    let mut next = job.clone();
                    next.attempt_count += 1;
                    next.updated_at = now;
                    next.error_message = Some(message.clone());

                    let mut ops = vec![
                        StoreOp::RemoveActive {
                            job_id: job.id.clone(),
                            model_id: job.model_id.clone(),
                        },
                        StoreOp::RemovePending {
                            job_id: job.id.clone(),
                            model_id: job.model_id.clone(),
                        },
                        StoreOp::RemoveDelayed {
                            job_id: job.id.clone(),
                        },
                        StoreOp::Increment {
                            counter: Counter::Failed,
                            by: 1,
                        },
                    ];

                    let outcome = if next.attempt_count >= next.max_attempts {
                        next.status = JobStatus::Dead;
                        next.next_retry_at = None;
                        ops.push(StoreOp::PushDeadLetter {
                            job_id: job.id.clone(),
                        });
                        ops.push(StoreOp::Increment {
                            counter: Counter::DeadLettered,
                            by: 1,
                        });
                        FailOutcome::DeadLettered {
                            attempts: next.attempt_count,
                        }
                    } else {
                        let due = now + retry_delay(base_delay, next.attempt_count);
                        next.status = JobStatus::Pending;
                        next.next_retry_at = Some(due);
                        ops.push(StoreOp::AddDelayed {
                            job_id: job.id.clone(),
                            due_ms: due.timestamp_millis(),
                        });
                        FailOutcome::Retrying {
                            attempt: next.attempt_count,
                            next_retry_at: due,
                        }
                    };

                    ops.push(StoreOp::put(&next));
                    (ops, outcome)
                },
            )
            .await?;

        let Some((job, outcome)) = outcome else {
            return Ok(None);
        };

        match &outcome {
            FailOutcome::Retrying {
                attempt,
                next_retry_at,
            } => {
                self.metrics.record_transition("retried", &job.model_id);
                warn!(
                    job_id = %job_id,
                    model_id = %job.model_id,
                    attempt = attempt,
                    next_retry_at = %next_retry_at,
                    error = %message,
                    "Evaluation job failed, scheduled for retry"
                );
            }
            FailOutcome::DeadLettered { attempts } => {
                self.metrics.record_transition("dead_lettered", &job.model_id);
                error!(
                    job_id = %job_id,
                    model_id = %job.model_id,
                    attempts = attempts,
                    error = %message,
                    "Evaluation job exhausted its attempts, moved to dead letter queue"
                );
            }
        }
        Ok(Some(outcome))
    }

    /// Cancels a PENDING job.
    ///
    /// Cancelling an already-cancelled job succeeds without change. Returns
    /// `false` for ACTIVE, COMPLETED, DEAD and unknown jobs.
    pub async fn cancel(&self, job_id: &str) -> Result<bool, QueueError> {
        let outcome = self
            .transition(
                job_id,
                &[JobStatus::Pending, JobStatus::Failed],
                |job, now| {
                    if job.status == JobStatus::Failed {
                        return (Vec::new(), false);
                    }

                    let mut cancelled = job.clone();
                    cancelled.status = JobStatus::Failed;
                    cancelled.error_message = Some(CANCELLED_MESSAGE.to_string());
                    cancelled.next_retry_at = None;
                    cancelled.updated_at = now;

                    let ops = vec![
                        StoreOp::RemovePending {
                            job_id: job.id.clone(),
                            model_id: job.model_id.clone(),
                        },
                        StoreOp::RemoveDelayed {
                            job_id: job.id.clone(),
                        },
                        StoreOp::put(&cancelled),
                    ];
                    (ops, true)
                },
            )
            .await?;

        match outcome {
            Some((job, true)) => {
                self.metrics.record_transition("cancelled", &job.model_id);
                info!(job_id = %job_id, model_id = %job.model_id, "Evaluation job cancelled");
                Ok(true)
            }
            Some((_, false)) => Ok(true),
            None => Ok(false),
        }
    }

    /// Moves a DEAD job back to PENDING with a fresh score and zero attempts.
    pub async fn retry_dlq_job(&self, job_id: &str) -> Result<bool, QueueError> {
        let outcome = self
            .transition(job_id, &[JobStatus::Dead], |job, now| {
                let mut revived = job.clone();
                revived.status = JobStatus::Pending;
                revived.attempt_count = 0;
                revived.started_at = None;
                revived.completed_at = None;
                revived.next_retry_at = None;
                revived.updated_at = now;
                revived.queue_score = queue_score(revived.priority, &now);

                let ops = vec![
                    StoreOp::RemoveDeadLetter {
                        job_id: job.id.clone(),
                    },
                    StoreOp::AddPending {
                        job_id: job.id.clone(),
                        model_id: job.model_id.clone(),
                        score: revived.queue_score,
                    },
                    StoreOp::put(&revived),
                ];
                (ops, ())
            })
            .await?;

        if let Some((job, ())) = &outcome {
            info!(job_id = %job_id, model_id = %job.model_id, "Dead-lettered job requeued");
        }
        Ok(outcome.is_some())
    }

    /// Fails ACTIVE jobs whose worker stopped reporting.
    ///
    /// A job is considered abandoned once `started_at + timeout_seconds +
    /// stale_grace` lies in the past. It goes through the normal `fail` path,
    /// so it is retried or dead-lettered like any other failure. Returns the
    /// number of jobs recovered.
    pub async fn recover_stale_jobs(&self) -> Result<usize, QueueError> {
        let now = Utc::now();
        let grace = Duration::from_std(self.config.stale_grace).unwrap_or(Duration::zero());
        let mut recovered = 0;

        for job_id in self.store.active_ids().await? {
            let Some(job) = self.get_job(&job_id).await? else {
                warn!(job_id = %job_id, "Dropping active entry without a job record");
                let drop = StoreOp::DropActive {
                    job_id: job_id.clone(),
                    model_ids: self.store.models().await?,
                };
                let guard = RecordGuard::absent(job_id.clone());
                self.store.apply(&[guard], vec![drop]).await?;
                continue;
            };

            if job.status != JobStatus::Active {
                continue;
            }

            let started = job.started_at.unwrap_or(job.updated_at);
            let deadline = i64::try_from(job.timeout_seconds)
                .ok()
                .and_then(Duration::try_seconds)
                .and_then(|timeout| started.checked_add_signed(timeout))
                .and_then(|deadline| deadline.checked_add_signed(grace));
            match deadline {
                Some(deadline) if deadline < now => {}
                _ => continue,
            }

            let message = format!(
                "Worker lost: job exceeded its {}s timeout while active",
                job.timeout_seconds
            );
            if self.fail(&job_id, &message).await?.is_some() {
                recovered += 1;
            }
        }

        if recovered > 0 {
            info!(recovered = recovered, "Recovered stale active jobs");
        }
        Ok(recovered)
    }

    /// Reads a job.
    pub async fn get_job(&self, job_id: &str) -> Result<Option<EvaluationJob>, QueueError> {
        match self.store.load_record(job_id).await? {
            Some(record) => Ok(Some(EvaluationJob::from_record(&record)?)),
            None => Ok(None),
        }
    }

    /// Reads a job's status.
    pub async fn get_status(&self, job_id: &str) -> Result<Option<JobStatus>, QueueError> {
        Ok(self.get_job(job_id).await?.map(|job| job.status))
    }

    /// Number of claimable jobs, globally or for one model.
    pub async fn get_queue_depth(&self, model_id: Option<&str>) -> Result<u64, QueueError> {
        self.store.pending_count(model_id).await
    }

    /// Number of ACTIVE jobs, globally or for one model.
    pub async fn get_active_count(&self, model_id: Option<&str>) -> Result<u64, QueueError> {
        self.store.active_count(model_id).await
    }

    /// The oldest `limit` dead-lettered jobs.
    pub async fn get_dlq_jobs(&self, limit: usize) -> Result<Vec<EvaluationJob>, QueueError> {
        let mut jobs = Vec::new();
        for job_id in self.store.dead_letters(limit).await? {
            match self.get_job(&job_id).await? {
                Some(job) => jobs.push(job),
                None => warn!(job_id = %job_id, "Dead-letter entry without a job record"),
            }
        }
        Ok(jobs)
    }

    /// Every model that has had a job enqueued.
    pub async fn list_models(&self) -> Result<Vec<String>, QueueError> {
        self.store.models().await
    }

    /// Returns a snapshot of queue state.
    pub async fn get_metrics(&self) -> Result<QueueMetrics, QueueError> {
        let (queue_depth, delayed, active, dead_letter_size, counters, models) = tokio::try_join!(
            self.store.pending_count(None),
            self.store.delayed_count(),
            self.store.active_count(None),
            self.store.dead_letter_len(),
            self.store.counters(),
            self.store.models(),
        )?;

        let mut per_model = BTreeMap::new();
        for model_id in models {
            let (depth, model_active) = tokio::try_join!(
                self.store.pending_count(Some(model_id.as_str())),
                self.store.active_count(Some(model_id.as_str())),
            )?;
            per_model.insert(
                model_id,
                ModelMetrics {
                    queue_depth: depth,
                    active: model_active,
                },
            );
        }

        let samples = counters.get(Counter::ProcessingSamples);
        let average_processing_ms = if samples > 0 {
            counters.get(Counter::ProcessingTimeMs) as f64 / samples as f64
        } else {
            0.0
        };

        Ok(QueueMetrics {
            queue_depth,
            delayed,
            active,
            completed_total: counters.get(Counter::Completed),
            failed_total: counters.get(Counter::Failed),
            dead_lettered_total: counters.get(Counter::DeadLettered),
            dead_letter_size,
            average_processing_ms,
            claim_mode: self.store.claim_mode(),
            models: per_model,
        })
    }

    /// Takes a metrics snapshot and pushes it into the Prometheus gauges.
    pub async fn publish_metrics(&self) -> Result<QueueMetrics, QueueError> {
        let snapshot = self.get_metrics().await?;
        for (model_id, model) in &snapshot.models {
            self.metrics
                .update_queue_depth(model_id, model.queue_depth as usize);
            self.metrics.update_active_jobs(model_id, model.active as usize);
        }
        self.metrics
            .update_dead_letter_size(snapshot.dead_letter_size as usize);
        Ok(snapshot)
    }

    /// Applies a guarded status transition.
    ///
    /// `plan` receives the current job and the transition time and returns
    /// the store ops plus a value handed back to the caller. Returns `None`
    /// if the job is unknown or its status is not in `allowed`.
    async fn transition<T, F>(
        &self,
        job_id: &str,
        allowed: &[JobStatus],
        mut plan: F,
    ) -> Result<Option<(EvaluationJob, T)>, QueueError>
    where
        F: FnMut(&EvaluationJob, DateTime<Utc>) -> (Vec<StoreOp>, T),
    {
        for _ in 0..MAX_TRANSITION_ATTEMPTS {
            let Some(job) = self.get_job(job_id).await? else {
                debug!(job_id = %job_id, "Ignoring transition for unknown job");
                return Ok(None);
            };

            if !allowed.contains(&job.status) {
                debug!(
                    job_id = %job_id,
                    status = %job.status,
                    "Ignoring transition not allowed from current status"
                );
                return Ok(None);
            }

            let guard = RecordGuard::unchanged(&job);
            let (ops, value) = plan(&job, Utc::now());
            if self.store.apply(&[guard], ops).await? {
                return Ok(Some((job, value)));
            }

            debug!(job_id = %job_id, "Job record changed concurrently, re-planning transition");
        }

        Err(QueueError::Conflict(job_id.to_string()))
    }
}

/// Backoff before retry number `attempt` (1-based): `base * 2^(attempt - 1)`.
pub fn retry_delay(base_seconds: u64, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
    let seconds = base_seconds.saturating_mul(1u64 << exponent);
    let seconds = i64::try_from(seconds).unwrap_or(i64::MAX);
    Duration::seconds(seconds.min(MAX_RETRY_DELAY_SECONDS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::{fields, format_timestamp};
    use serde_json::json;
    use std::collections::HashMap;

    fn config() -> EvaluationQueueConfig {
        EvaluationQueueConfig::default()
            .with_max_concurrent_per_model(2)
            .with_max_concurrent_global(3)
    }

    fn manager() -> EvaluationQueueManager {
        EvaluationQueueManager::in_memory(config()).unwrap()
    }

    fn job(model: &str) -> EvaluationJob {
        EvaluationJob::new(model, json!({"benchmark_spec": {"adapter": "unit"}}))
    }

    /// Jobs with strictly increasing arrival times, oldest first.
    fn arrivals(model: &str, priorities: &[i32]) -> Vec<EvaluationJob> {
        let base = Utc::now();
        priorities
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let mut j = job(model).with_priority(*p);
                j.created_at = base + Duration::milliseconds(i as i64 * 5);
                j
            })
            .collect()
    }

    #[tokio::test]
    async fn test_enqueue_registers_pending_job() {
        let queue = manager();
        let id = queue.enqueue(job("m")).await.unwrap();

        assert_eq!(queue.get_status(&id).await.unwrap(), Some(JobStatus::Pending));
        assert_eq!(queue.get_queue_depth(None).await.unwrap(), 1);
        assert_eq!(queue.get_queue_depth(Some("m")).await.unwrap(), 1);
        assert_eq!(queue.get_queue_depth(Some("other")).await.unwrap(), 0);
        assert_eq!(queue.list_models().await.unwrap(), vec!["m".to_string()]);
    }

    #[tokio::test]
    async fn test_enqueue_applies_queue_defaults() {
        let queue = EvaluationQueueManager::in_memory(
            config().with_max_retries(7).with_job_timeout_seconds(90),
        )
        .unwrap();
        let id = queue
            .enqueue(job("m").with_max_attempts(0).with_timeout_seconds(0))
            .await
            .unwrap();

        let stored = queue.get_job(&id).await.unwrap().unwrap();
        assert_eq!(stored.max_attempts, 7);
        assert_eq!(stored.timeout_seconds, 90);
        assert_eq!(stored.queue_score, queue_score(0, &stored.created_at));
    }

    #[test]
    fn test_constructor_rejects_invalid_config() {
        let err = EvaluationQueueManager::in_memory(config().with_claim_scan_limit(0))
            .err()
            .unwrap();
        assert!(matches!(err, QueueError::Config(_)));
    }

    #[tokio::test]
    async fn test_enqueue_rejects_duplicate_id() {
        let queue = manager();
        let id = queue.enqueue(job("m").with_id("dup")).await.unwrap();
        queue.dequeue(Some("m")).await.unwrap().unwrap();

        let err = queue.enqueue(job("m").with_id("dup")).await.unwrap_err();
        assert!(matches!(err, QueueError::DuplicateJob(ref dup) if dup == "dup"));

        // The running job is untouched.
        assert_eq!(queue.get_status(&id).await.unwrap(), Some(JobStatus::Active));
        assert_eq!(queue.get_active_count(Some("m")).await.unwrap(), 1);
        assert_eq!(queue.get_queue_depth(Some("m")).await.unwrap(), 0);
        assert!(queue.complete(&id, json!({"score": 1}), None).await.unwrap());
        assert_eq!(queue.get_active_count(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_enqueue_batch_rejects_duplicates() {
        let queue = manager();
        let err = queue
            .enqueue_batch(vec![job("m").with_id("a"), job("m").with_id("a")])
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::DuplicateJob(_)));
        assert_eq!(queue.get_queue_depth(None).await.unwrap(), 0);

        queue.enqueue(job("m").with_id("b")).await.unwrap();
        let err = queue
            .enqueue_batch(vec![job("m").with_id("c"), job("m").with_id("b")])
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::DuplicateJob(ref dup) if dup == "b"));
        // All or nothing.
        assert!(queue.get_job("c").await.unwrap().is_none());
        assert_eq!(queue.get_queue_depth(None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_enqueue_rejects_out_of_range_priority() {
        let queue = manager();
        for priority in [MAX_PRIORITY + 1, -MAX_PRIORITY - 1, i32::MAX] {
            let err = queue
                .enqueue(job("m").with_priority(priority))
                .await
                .unwrap_err();
            assert!(matches!(err, QueueError::InvalidJob(_)));
        }
        assert_eq!(queue.get_queue_depth(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_max_priority_keeps_fifo_order() {
        let queue = EvaluationQueueManager::in_memory(
            config()
                .with_max_concurrent_per_model(32)
                .with_max_concurrent_global(32),
        )
        .unwrap();
        let base = Utc::now();
        let mut expected = Vec::new();
        for i in 0..20 {
            let mut j = job("m").with_priority(MAX_PRIORITY);
            j.created_at = base + Duration::milliseconds(i);
            expected.push(queue.enqueue(j).await.unwrap());
        }

        let mut order = Vec::new();
        while let Some(claimed) = queue.dequeue(Some("m")).await.unwrap() {
            order.push(claimed.id);
        }
        assert_eq!(order, expected);
    }

    #[tokio::test]
    async fn test_enqueue_rejects_empty_model() {
        let queue = manager();
        let err = queue.enqueue(job("  ")).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidJob(_)));
    }

    #[tokio::test]
    async fn test_enqueue_batch() {
        let queue = manager();
        let ids = queue
            .enqueue_batch(vec![job("a"), job("b"), job("b")])
            .await
            .unwrap();

        assert_eq!(ids.len(), 3);
        assert_eq!(queue.get_queue_depth(Some("b")).await.unwrap(), 2);
        assert!(queue.enqueue_batch(Vec::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_higher_priority_dequeued_first() {
        let queue = manager();
        let jobs = arrivals("m", &[1, 20]);
        let j1 = queue.enqueue(jobs[0].clone()).await.unwrap();
        let j2 = queue.enqueue(jobs[1].clone()).await.unwrap();

        assert_eq!(queue.dequeue(Some("m")).await.unwrap().unwrap().id, j2);
        assert_eq!(queue.dequeue(Some("m")).await.unwrap().unwrap().id, j1);
    }

    #[tokio::test]
    async fn test_dequeue_order_priority_then_fifo() {
        let queue = EvaluationQueueManager::in_memory(
            config()
                .with_max_concurrent_per_model(10)
                .with_max_concurrent_global(10),
        )
        .unwrap();
        let jobs = arrivals("m", &[0, 5, 0, 5, -2]);
        for j in &jobs {
            queue.enqueue(j.clone()).await.unwrap();
        }

        let mut order = Vec::new();
        while let Some(claimed) = queue.dequeue(Some("m")).await.unwrap() {
            order.push(claimed.id);
        }

        let expected: Vec<String> = [1, 3, 0, 2, 4].iter().map(|i| jobs[*i].id.clone()).collect();
        assert_eq!(order, expected);
    }

    #[tokio::test]
    async fn test_dequeue_marks_job_active() {
        let queue = manager();
        let id = queue.enqueue(job("m")).await.unwrap();

        let claimed = queue.dequeue(None).await.unwrap().unwrap();
        assert_eq!(claimed.id, id);
        assert_eq!(claimed.status, JobStatus::Active);
        assert!(claimed.started_at.is_some());
        assert_eq!(queue.get_active_count(Some("m")).await.unwrap(), 1);
        assert_eq!(queue.get_queue_depth(None).await.unwrap(), 0);
        assert!(queue.dequeue(None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dequeue_respects_caps() {
        let queue = manager(); // per-model 2, global 3
        for _ in 0..4 {
            queue.enqueue(job("a")).await.unwrap();
        }
        for _ in 0..4 {
            queue.enqueue(job("b")).await.unwrap();
        }

        let mut claimed = 0;
        while queue.dequeue(None).await.unwrap().is_some() {
            claimed += 1;
        }

        assert_eq!(claimed, 3);
        assert!(queue.get_active_count(Some("a")).await.unwrap() <= 2);
        assert!(queue.get_active_count(Some("b")).await.unwrap() <= 2);
        assert_eq!(queue.get_active_count(None).await.unwrap(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_dequeues_never_exceed_caps() {
        let queue = Arc::new(
            EvaluationQueueManager::in_memory(
                config()
                    .with_max_concurrent_per_model(5)
                    .with_max_concurrent_global(8),
            )
            .unwrap(),
        );
        for i in 0..40 {
            let model = if i % 2 == 0 { "a" } else { "b" };
            queue.enqueue(job(model)).await.unwrap();
        }

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let queue = Arc::clone(&queue);
                tokio::spawn(async move { queue.dequeue(None).await })
            })
            .collect();

        let mut claimed = Vec::new();
        for handle in handles {
            if let Some(job) = handle.await.unwrap().unwrap() {
                claimed.push(job.id);
            }
        }

        claimed.sort();
        claimed.dedup();
        assert_eq!(claimed.len(), 8);
        assert!(queue.get_active_count(Some("a")).await.unwrap() <= 5);
        assert!(queue.get_active_count(Some("b")).await.unwrap() <= 5);
        assert_eq!(queue.get_active_count(None).await.unwrap(), 8);
    }

    #[tokio::test]
    async fn test_complete_active_job() {
        let queue = manager();
        let id = queue.enqueue(job("m")).await.unwrap();
        queue.dequeue(None).await.unwrap();

        let done = queue
            .complete(&id, json!({"accuracy": 0.9}), Some(1200))
            .await
            .unwrap();
        assert!(done);

        let stored = queue.get_job(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.result, Some(json!({"accuracy": 0.9})));
        assert!(stored.completed_at.is_some());
        assert!(stored.error_message.is_none());
        assert_eq!(queue.get_active_count(None).await.unwrap(), 0);

        let metrics = queue.get_metrics().await.unwrap();
        assert_eq!(metrics.completed_total, 1);
        assert!((metrics.average_processing_ms - 1200.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_complete_requires_active_job() {
        let queue = manager();
        let id = queue.enqueue(job("m")).await.unwrap();

        assert!(!queue.complete(&id, json!({}), None).await.unwrap());
        assert_eq!(queue.get_status(&id).await.unwrap(), Some(JobStatus::Pending));
    }

    #[tokio::test]
    async fn test_unknown_job_operations_are_noops() {
        let queue = manager();

        assert!(!queue.complete("missing", json!({}), None).await.unwrap());
        assert_eq!(queue.fail("missing", "boom").await.unwrap(), None);
        assert!(!queue.cancel("missing").await.unwrap());
        assert!(!queue.retry_dlq_job("missing").await.unwrap());
        assert_eq!(queue.get_status("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_fail_schedules_retry_with_backoff() {
        let queue = manager();
        let id = queue.enqueue(job("m")).await.unwrap();
        queue.dequeue(None).await.unwrap();

        let before = Utc::now();
        let outcome = queue.fail(&id, "model endpoint returned 502").await.unwrap();
        match outcome {
            Some(FailOutcome::Retrying {
                attempt,
                next_retry_at,
            }) => {
                assert_eq!(attempt, 1);
                assert!(next_retry_at >= before + Duration::seconds(60));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }

        let stored = queue.get_job(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
        assert_eq!(stored.attempt_count, 1);
        assert_eq!(
            stored.error_message.as_deref(),
            Some("model endpoint returned 502")
        );
        assert_eq!(queue.get_active_count(None).await.unwrap(), 0);
        assert_eq!(queue.get_queue_depth(None).await.unwrap(), 0);

        // Still backing off, so not claimable yet.
        assert!(queue.dequeue(None).await.unwrap().is_none());
        assert_eq!(queue.get_metrics().await.unwrap().delayed, 1);
    }

    #[tokio::test]
    async fn test_due_retry_is_promoted_and_claimable() {
        let queue =
            EvaluationQueueManager::in_memory(config().with_retry_base_delay_seconds(0)).unwrap();
        let id = queue.enqueue(job("m")).await.unwrap();
        queue.dequeue(None).await.unwrap();
        queue.fail(&id, "flaky").await.unwrap();

        let again = queue.dequeue(Some("m")).await.unwrap().unwrap();
        assert_eq!(again.id, id);
        assert_eq!(again.attempt_count, 1);
        assert_eq!(again.status, JobStatus::Active);
    }

    #[tokio::test]
    async fn test_fail_until_dead_letters_once() {
        let queue = manager();
        let id = queue.enqueue(job("m").with_max_attempts(3)).await.unwrap();
        queue.dequeue(None).await.unwrap();

        for _ in 0..2 {
            assert!(matches!(
                queue.fail(&id, "boom").await.unwrap(),
                Some(FailOutcome::Retrying { .. })
            ));
        }
        assert_eq!(
            queue.fail(&id, "boom").await.unwrap(),
            Some(FailOutcome::DeadLettered { attempts: 3 })
        );

        // Further failures are ignored.
        assert_eq!(queue.fail(&id, "boom").await.unwrap(), None);

        let stored = queue.get_job(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Dead);
        assert_eq!(stored.attempt_count, 3);

        let dlq: Vec<String> = queue
            .get_dlq_jobs(10)
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(dlq, vec![id]);

        let metrics = queue.get_metrics().await.unwrap();
        assert_eq!(metrics.failed_total, 3);
        assert_eq!(metrics.dead_lettered_total, 1);
        assert_eq!(metrics.dead_letter_size, 1);
        assert_eq!(metrics.delayed, 0);
    }

    #[tokio::test]
    async fn test_single_attempt_job_dead_letters_immediately() {
        let queue = manager();
        let id = queue.enqueue(job("m").with_max_attempts(1)).await.unwrap();
        queue.dequeue(None).await.unwrap();

        queue.fail(&id, "fatal").await.unwrap();

        assert_eq!(queue.get_status(&id).await.unwrap(), Some(JobStatus::Dead));
        let dlq: Vec<String> = queue
            .get_dlq_jobs(10)
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(dlq, vec![id]);
    }

    #[tokio::test]
    async fn test_fail_sanitizes_error() {
        let queue = manager();
        let id = queue.enqueue(job("m")).await.unwrap();
        queue.dequeue(None).await.unwrap();

        let raw = format!("trace:\n{}\u{1b}[0m", "y".repeat(5000));
        queue.fail(&id, &raw).await.unwrap();

        let message = queue.get_job(&id).await.unwrap().unwrap().error_message.unwrap();
        assert!(!message.chars().any(char::is_control));
        assert!(message.chars().count() <= crate::scheduler::job::MAX_ERROR_LENGTH);
    }

    #[tokio::test]
    async fn test_retry_dlq_job_makes_job_claimable() {
        let queue = manager();
        let id = queue.enqueue(job("m").with_max_attempts(1)).await.unwrap();
        queue.dequeue(None).await.unwrap();
        queue.fail(&id, "fatal").await.unwrap();

        assert!(queue.retry_dlq_job(&id).await.unwrap());

        let stored = queue.get_job(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
        assert_eq!(stored.attempt_count, 0);
        assert!(queue.get_dlq_jobs(10).await.unwrap().is_empty());

        let claimed = queue.dequeue(Some("m")).await.unwrap().unwrap();
        assert_eq!(claimed.id, id);

        // Only DEAD jobs can be revived.
        assert!(!queue.retry_dlq_job(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_pending_job() {
        let queue = manager();
        let id = queue.enqueue(job("m")).await.unwrap();
        queue.enqueue(job("m")).await.unwrap();

        assert!(queue.cancel(&id).await.unwrap());
        assert_eq!(queue.get_queue_depth(Some("m")).await.unwrap(), 1);

        let stored = queue.get_job(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.error_message.as_deref(), Some(CANCELLED_MESSAGE));

        // Idempotent for already-cancelled jobs.
        assert!(queue.cancel(&id).await.unwrap());
        // A cancelled job is never claimed.
        let claimed = queue.dequeue(None).await.unwrap().unwrap();
        assert_ne!(claimed.id, id);
    }

    #[tokio::test]
    async fn test_cancel_job_in_retry_backoff() {
        let queue = manager();
        let id = queue.enqueue(job("m")).await.unwrap();
        queue.dequeue(None).await.unwrap();
        queue.fail(&id, "transient").await.unwrap();

        assert!(queue.cancel(&id).await.unwrap());
        assert_eq!(queue.get_metrics().await.unwrap().delayed, 0);
    }

    #[tokio::test]
    async fn test_cancel_refuses_active_and_finished_jobs() {
        let queue = manager();
        let active = queue.enqueue(job("m")).await.unwrap();
        queue.dequeue(None).await.unwrap();

        assert!(!queue.cancel(&active).await.unwrap());
        assert_eq!(queue.get_status(&active).await.unwrap(), Some(JobStatus::Active));

        queue.complete(&active, json!({}), None).await.unwrap();
        assert!(!queue.cancel(&active).await.unwrap());
        assert_eq!(
            queue.get_status(&active).await.unwrap(),
            Some(JobStatus::Completed)
        );
    }

    #[tokio::test]
    async fn test_fail_after_cancel_is_noop() {
        let queue = manager();
        let id = queue.enqueue(job("m")).await.unwrap();
        queue.cancel(&id).await.unwrap();

        assert_eq!(queue.fail(&id, "late failure").await.unwrap(), None);
        assert_eq!(queue.get_status(&id).await.unwrap(), Some(JobStatus::Failed));
    }

    #[tokio::test]
    async fn test_recover_stale_jobs() {
        let store = Arc::new(MemoryStore::new());
        let queue = EvaluationQueueManager::new(
            store.clone(),
            config().with_stale_grace(std::time::Duration::from_secs(5)),
        )
        .unwrap();
        let stale = queue.enqueue(job("m").with_timeout_seconds(10)).await.unwrap();
        let fresh = queue.enqueue(job("m").with_timeout_seconds(10)).await.unwrap();
        queue.dequeue(None).await.unwrap();
        queue.dequeue(None).await.unwrap();

        let long_ago = format_timestamp(&(Utc::now() - Duration::minutes(5)));
        let patch: HashMap<String, String> = [(fields::STARTED_AT.to_string(), long_ago)]
            .into_iter()
            .collect();
        store
            .apply(
                &[],
                vec![StoreOp::PutRecord {
                    job_id: stale.clone(),
                    fields: patch,
                }],
            )
            .await
            .unwrap();

        assert_eq!(queue.recover_stale_jobs().await.unwrap(), 1);

        let recovered = queue.get_job(&stale).await.unwrap().unwrap();
        assert_eq!(recovered.status, JobStatus::Pending);
        assert!(recovered
            .error_message
            .unwrap()
            .starts_with("Worker lost"));
        assert_eq!(queue.get_status(&fresh).await.unwrap(), Some(JobStatus::Active));
        assert_eq!(queue.get_active_count(None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_recover_drops_orphaned_active_entries() {
        let store = Arc::new(MemoryStore::new());
        let queue = EvaluationQueueManager::new(store.clone(), config()).unwrap();
        store
            .apply(
                &[],
                vec![StoreOp::AddActive {
                    job_id: "ghost".to_string(),
                    model_id: "m".to_string(),
                }],
            )
            .await
            .unwrap();
        assert_eq!(queue.get_active_count(Some("m")).await.unwrap(), 1);

        assert_eq!(queue.recover_stale_jobs().await.unwrap(), 0);
        assert_eq!(queue.get_active_count(None).await.unwrap(), 0);
        assert_eq!(queue.get_active_count(Some("m")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_metrics_snapshot() {
        let queue = manager();
        queue.enqueue(job("a")).await.unwrap();
        queue.enqueue(job("a")).await.unwrap();
        queue.enqueue(job("b")).await.unwrap();
        queue.dequeue(Some("b")).await.unwrap();

        let metrics = queue.publish_metrics().await.unwrap();
        assert_eq!(metrics.queue_depth, 2);
        assert_eq!(metrics.active, 1);
        assert_eq!(metrics.claim_mode, ClaimMode::Atomic);
        assert_eq!(metrics.models["a"].queue_depth, 2);
        assert_eq!(metrics.models["b"].active, 1);
        assert_eq!(metrics.average_processing_ms, 0.0);
    }

    #[test]
    fn test_retry_delay_doubles() {
        assert_eq!(retry_delay(60, 1), Duration::seconds(60));
        assert_eq!(retry_delay(60, 2), Duration::seconds(120));
        assert_eq!(retry_delay(60, 3), Duration::seconds(240));
        assert_eq!(retry_delay(0, 5), Duration::zero());
        assert_eq!(retry_delay(u64::MAX, 3), Duration::seconds(MAX_RETRY_DELAY_SECONDS));
    }
}
