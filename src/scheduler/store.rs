//! Store abstraction for queue state.
//!
//! The queue manager never talks to Redis directly. It plans each status
//! transition as a list of [`StoreOp`]s and hands them to a [`QueueStore`],
//! which must apply the whole list as one atomic step. Steps carry
//! [`RecordGuard`]s: the ops are applied only if every guarded record still
//! has the status and `updated_at` the plan was computed from, or, for a new
//! job, does not exist yet.
//!
//! Claiming a job is a separate primitive because it has to inspect several
//! collections before deciding what to move.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::job::{fields, format_timestamp, EvaluationJob};
use crate::error::QueueError;

/// Named counters kept alongside the queue collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Counter {
    Completed,
    Failed,
    DeadLettered,
    ProcessingTimeMs,
    ProcessingSamples,
}

impl Counter {
    pub const ALL: [Counter; 5] = [
        Counter::Completed,
        Counter::Failed,
        Counter::DeadLettered,
        Counter::ProcessingTimeMs,
        Counter::ProcessingSamples,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Counter::Completed => "completed",
            Counter::Failed => "failed",
            Counter::DeadLettered => "dead_lettered",
            Counter::ProcessingTimeMs => "processing_time_ms",
            Counter::ProcessingSamples => "processing_samples",
        }
    }
}

/// One mutation of queue state.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOp {
    /// Write the given record fields, keeping any others.
    PutRecord {
        job_id: String,
        fields: HashMap<String, String>,
    },
    /// Insert into the global and per-model pending sets.
    AddPending {
        job_id: String,
        model_id: String,
        score: f64,
    },
    /// Remove from the global and per-model pending sets.
    RemovePending { job_id: String, model_id: String },
    /// Insert into the delayed set, due at `due_ms` (epoch milliseconds).
    AddDelayed { job_id: String, due_ms: i64 },
    RemoveDelayed { job_id: String },
    /// Insert into the global and per-model active sets, registering the model.
    AddActive { job_id: String, model_id: String },
    /// Remove from the global and per-model active sets.
    RemoveActive { job_id: String, model_id: String },
    /// Remove from the global active set and from each listed model's set.
    DropActive {
        job_id: String,
        model_ids: Vec<String>,
    },
    /// Append to the dead-letter list.
    PushDeadLetter { job_id: String },
    /// Remove every occurrence from the dead-letter list.
    RemoveDeadLetter { job_id: String },
    /// Add a model name to the model registry.
    RegisterModel { model_id: String },
    Increment { counter: Counter, by: i64 },
}

impl StoreOp {
    /// Builds a record write for the given job.
    pub fn put(job: &EvaluationJob) -> Self {
        StoreOp::PutRecord {
            job_id: job.id.clone(),
            fields: job.to_record(),
        }
    }
}

/// Compare-and-set precondition for a store step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordGuard {
    /// No record exists under the id yet.
    Absent { job_id: String },
    /// The record still has the status and `updated_at` it was read with.
    Unchanged {
        job_id: String,
        status: String,
        updated_at: String,
    },
}

impl RecordGuard {
    /// Guards a first write of `job_id`.
    pub fn absent(job_id: impl Into<String>) -> Self {
        RecordGuard::Absent {
            job_id: job_id.into(),
        }
    }

    /// Guards against any change to `job` since it was read.
    pub fn unchanged(job: &EvaluationJob) -> Self {
        RecordGuard::Unchanged {
            job_id: job.id.clone(),
            status: job.status.as_str().to_string(),
            updated_at: format_timestamp(&job.updated_at),
        }
    }

    pub fn job_id(&self) -> &str {
        match self {
            RecordGuard::Absent { job_id } | RecordGuard::Unchanged { job_id, .. } => job_id,
        }
    }

    /// Returns whether the stored record (or its absence) satisfies the guard.
    pub fn matches(&self, record: Option<&HashMap<String, String>>) -> bool {
        match (self, record) {
            (RecordGuard::Absent { .. }, record) => record.is_none(),
            (RecordGuard::Unchanged { .. }, None) => false,
            (
                RecordGuard::Unchanged {
                    status, updated_at, ..
                },
                Some(record),
            ) => {
                record.get(fields::STATUS) == Some(status)
                    && record.get(fields::UPDATED_AT) == Some(updated_at)
            }
        }
    }
}

/// Inputs to one claim attempt.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    /// Restrict the claim to one model's pending set.
    pub model_id: Option<String>,
    pub now: DateTime<Utc>,
    pub max_global: u32,
    pub max_per_model: u32,
    /// Number of pending entries inspected, in score order.
    pub scan_limit: u32,
}

impl ClaimRequest {
    pub fn now_ms(&self) -> i64 {
        self.now.timestamp_millis()
    }

    pub fn now_iso(&self) -> String {
        format_timestamp(&self.now)
    }
}

/// How strongly the store guarantees claim atomicity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimMode {
    /// Promotion, cap checks and the claim run as one indivisible step.
    Atomic,
    /// Multi-step claim. A job is never handed to two workers, but
    /// concurrent claims may briefly exceed the per-model and global caps.
    Relaxed,
}

impl fmt::Display for ClaimMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClaimMode::Atomic => f.write_str("atomic"),
            ClaimMode::Relaxed => f.write_str("relaxed"),
        }
    }
}

/// Snapshot of the named counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CounterSnapshot(pub BTreeMap<Counter, i64>);

impl CounterSnapshot {
    pub fn get(&self, counter: Counter) -> i64 {
        self.0.get(&counter).copied().unwrap_or(0)
    }
}

/// Backend holding all queue state.
///
/// Implementations must apply each `apply` call and each `claim` call as a
/// single step relative to every other mutation they accept, except where
/// `claim_mode` reports [`ClaimMode::Relaxed`].
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Guarantee offered by [`QueueStore::claim`].
    fn claim_mode(&self) -> ClaimMode;

    /// Reads the raw record of one job.
    async fn load_record(&self, job_id: &str)
        -> Result<Option<HashMap<String, String>>, QueueError>;

    /// Applies `ops` atomically. If any guard no longer matches, nothing is
    /// applied and `false` is returned.
    async fn apply(&self, guards: &[RecordGuard], ops: Vec<StoreOp>) -> Result<bool, QueueError>;

    /// Promotes due delayed jobs, then claims the best eligible pending job
    /// within the caps. Returns the claimed job id.
    async fn claim(&self, request: &ClaimRequest) -> Result<Option<String>, QueueError>;

    /// Number of ids in the global or per-model pending set.
    async fn pending_count(&self, model_id: Option<&str>) -> Result<u64, QueueError>;

    /// Number of ids in the delayed set.
    async fn delayed_count(&self) -> Result<u64, QueueError>;

    /// Number of ids in the global or per-model active set.
    async fn active_count(&self, model_id: Option<&str>) -> Result<u64, QueueError>;

    /// Ids in the global active set.
    async fn active_ids(&self) -> Result<Vec<String>, QueueError>;

    /// Oldest `limit` entries of the dead-letter list.
    async fn dead_letters(&self, limit: usize) -> Result<Vec<String>, QueueError>;

    async fn dead_letter_len(&self) -> Result<u64, QueueError>;

    /// Every model that has ever had a job enqueued or claimed, sorted.
    async fn models(&self) -> Result<Vec<String>, QueueError>;

    async fn counters(&self) -> Result<CounterSnapshot, QueueError>;
}

/// A pending entry considered during a claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub job_id: String,
    pub model_id: String,
}

/// Picks the first candidate whose model is below its cap.
///
/// `active_for` reports the current active count of a model.
pub fn pick_candidate<F>(
    candidates: &[Candidate],
    max_per_model: u32,
    mut active_for: F,
) -> Option<usize>
where
    F: FnMut(&str) -> u64,
{
    candidates
        .iter()
        .position(|c| active_for(&c.model_id) < u64::from(max_per_model))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::JobStatus;
    use serde_json::json;

    fn candidate(job: &str, model: &str) -> Candidate {
        Candidate {
            job_id: job.to_string(),
            model_id: model.to_string(),
        }
    }

    #[test]
    fn test_pick_candidate_skips_saturated_models() {
        let candidates = vec![candidate("j1", "a"), candidate("j2", "a"), candidate("j3", "b")];
        let active: HashMap<&str, u64> = [("a", 2), ("b", 0)].into_iter().collect();

        let picked = pick_candidate(&candidates, 2, |m| active.get(m).copied().unwrap_or(0));
        assert_eq!(picked, Some(2));
    }

    #[test]
    fn test_pick_candidate_none_when_all_saturated() {
        let candidates = vec![candidate("j1", "a")];
        assert_eq!(pick_candidate(&candidates, 1, |_| 1), None);
        assert_eq!(pick_candidate(&[], 1, |_| 0), None);
    }

    #[test]
    fn test_record_guard_matches() {
        let job = EvaluationJob::new("m", json!({}));
        let guard = RecordGuard::unchanged(&job);
        let mut record = job.to_record();
        assert!(guard.matches(Some(&record)));
        assert!(!guard.matches(None));

        record.insert("status".to_string(), JobStatus::Active.as_str().to_string());
        assert!(!guard.matches(Some(&record)));
    }

    #[test]
    fn test_absent_guard_matches_missing_record_only() {
        let job = EvaluationJob::new("m", json!({}));
        let guard = RecordGuard::absent(job.id.clone());

        assert_eq!(guard.job_id(), job.id);
        assert!(guard.matches(None));
        assert!(!guard.matches(Some(&job.to_record())));
    }

    #[test]
    fn test_counter_snapshot_defaults_to_zero() {
        let snapshot = CounterSnapshot::default();
        assert_eq!(snapshot.get(Counter::Completed), 0);
    }
}
