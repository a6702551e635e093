//! Job definitions for the evaluation queue.
//!
//! This module defines the core job types used by the queue:
//!
//! - `EvaluationJob`: A model-evaluation request and all of its bookkeeping
//! - `JobStatus`: Lifecycle state of a job
//!
//! A job has two lossless serialization forms: the compact JSON form
//! (`to_json`/`from_json`) and the flat field-to-string record used for store
//! persistence (`to_record`/`from_record`). In the record form structured
//! payloads are JSON text and absent values are empty strings.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::RecordError;

/// Default maximum number of attempts for a job.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default wall-clock budget for a single attempt.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 1800;

/// Multiplier applied to priority when computing the pending-set score.
///
/// Must exceed any realistic `created_at` in epoch milliseconds so that one
/// priority step always outweighs arrival time.
pub const PRIORITY_WEIGHT: f64 = 1e13;

/// Largest accepted priority magnitude.
///
/// Keeps every score within the integers an f64 holds exactly (2^53), so
/// jobs of equal priority still order by arrival millisecond.
pub const MAX_PRIORITY: i32 = 800;

/// Maximum length of a persisted error message, in characters.
pub const MAX_ERROR_LENGTH: usize = 2000;

/// Field names of the flat store record.
pub mod fields {
    pub const ID: &str = "id";
    pub const MODEL_ID: &str = "model_id";
    pub const EVAL_CONFIG: &str = "eval_config";
    pub const PRIORITY: &str = "priority";
    pub const STATUS: &str = "status";
    pub const CREATED_AT: &str = "created_at";
    pub const UPDATED_AT: &str = "updated_at";
    pub const STARTED_AT: &str = "started_at";
    pub const COMPLETED_AT: &str = "completed_at";
    pub const ATTEMPT_COUNT: &str = "attempt_count";
    pub const MAX_ATTEMPTS: &str = "max_attempts";
    pub const TIMEOUT_SECONDS: &str = "timeout_seconds";
    pub const RESULT: &str = "result";
    pub const ERROR_MESSAGE: &str = "error_message";
    pub const METADATA: &str = "metadata";
    pub const NEXT_RETRY_AT: &str = "next_retry_at";
    pub const QUEUE_SCORE: &str = "queue_score";
}

/// Lifecycle state of an evaluation job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting in the pending set or in retry backoff.
    Pending,
    /// Claimed by a worker.
    Active,
    /// Finished successfully.
    Completed,
    /// Cancelled before it ran.
    Failed,
    /// Exhausted its attempts and sits in the dead-letter list.
    Dead,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Dead => "dead",
        }
    }

    /// Returns whether no further automatic transition can happen.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Dead
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "active" => Ok(JobStatus::Active),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "dead" => Ok(JobStatus::Dead),
            other => Err(RecordError::InvalidField {
                field: fields::STATUS,
                message: format!("unknown status '{}'", other),
            }),
        }
    }
}

/// An evaluation request scoped to one target model.
///
/// Once enqueued, only the queue manager mutates status and bookkeeping
/// fields. Workers read the copy returned by `dequeue` and report outcomes
/// back through the manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationJob {
    /// Unique identifier, immutable after creation.
    pub id: String,
    /// Model under evaluation; also the concurrency-cap key.
    pub model_id: String,
    /// What to evaluate. Opaque to the queue.
    pub eval_config: Value,
    /// Higher values are dispatched first.
    pub priority: i32,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// When a job in backoff becomes eligible again.
    #[serde(default)]
    pub next_retry_at: Option<DateTime<Utc>>,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub timeout_seconds: u64,
    /// Executor output, set only on success.
    #[serde(default)]
    pub result: Option<Value>,
    /// Sanitized description of the last failure.
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default = "empty_object")]
    pub metadata: Value,
    /// Pending-set score; assigned by the queue on enqueue.
    #[serde(default)]
    pub queue_score: f64,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

impl EvaluationJob {
    /// Creates a pending job with a fresh UUID and current timestamps.
    pub fn new(model_id: impl Into<String>, eval_config: Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            model_id: model_id.into(),
            eval_config,
            priority: 0,
            status: JobStatus::Pending,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            next_retry_at: None,
            attempt_count: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            result: None,
            error_message: None,
            metadata: empty_object(),
            queue_score: 0.0,
        }
    }

    /// Sets an explicit identifier.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Sets the priority (higher is more urgent, negatives allowed).
    ///
    /// The queue accepts `-MAX_PRIORITY..=MAX_PRIORITY`.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the attempt budget. Zero means "use the queue default".
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Sets the per-attempt timeout. Zero means "use the queue default".
    pub fn with_timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    /// Attaches opaque metadata.
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Returns how many attempts are left before the job is dead-lettered.
    pub fn remaining_attempts(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempt_count)
    }

    /// Serializes to the compact JSON form.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parses the compact JSON form.
    pub fn from_json(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }

    /// Flattens the job into the store record layout.
    pub fn to_record(&self) -> HashMap<String, String> {
        let mut record = HashMap::with_capacity(17);
        let mut put = |field: &str, value: String| {
            record.insert(field.to_string(), value);
        };

        put(fields::ID, self.id.clone());
        put(fields::MODEL_ID, self.model_id.clone());
        put(fields::EVAL_CONFIG, self.eval_config.to_string());
        put(fields::PRIORITY, self.priority.to_string());
        put(fields::STATUS, self.status.as_str().to_string());
        put(fields::CREATED_AT, format_timestamp(&self.created_at));
        put(fields::UPDATED_AT, format_timestamp(&self.updated_at));
        put(fields::STARTED_AT, format_optional_timestamp(&self.started_at));
        put(fields::COMPLETED_AT, format_optional_timestamp(&self.completed_at));
        put(fields::ATTEMPT_COUNT, self.attempt_count.to_string());
        put(fields::MAX_ATTEMPTS, self.max_attempts.to_string());
        put(fields::TIMEOUT_SECONDS, self.timeout_seconds.to_string());
        put(
            fields::RESULT,
            self.result.as_ref().map(Value::to_string).unwrap_or_default(),
        );
        put(
            fields::ERROR_MESSAGE,
            self.error_message.clone().unwrap_or_default(),
        );
        put(fields::METADATA, self.metadata.to_string());
        put(
            fields::NEXT_RETRY_AT,
            format_optional_timestamp(&self.next_retry_at),
        );
        put(fields::QUEUE_SCORE, self.queue_score.to_string());

        record
    }

    /// Rebuilds a job from its store record.
    pub fn from_record(record: &HashMap<String, String>) -> Result<Self, RecordError> {
        let field = |name: &'static str| -> Result<&str, RecordError> {
            record
                .get(name)
                .map(String::as_str)
                .ok_or(RecordError::MissingField(name))
        };

        Ok(Self {
            id: field(fields::ID)?.to_string(),
            model_id: field(fields::MODEL_ID)?.to_string(),
            eval_config: parse_json(fields::EVAL_CONFIG, field(fields::EVAL_CONFIG)?)?,
            priority: parse_number(fields::PRIORITY, field(fields::PRIORITY)?)?,
            status: field(fields::STATUS)?.parse()?,
            created_at: parse_timestamp(fields::CREATED_AT, field(fields::CREATED_AT)?)?,
            updated_at: parse_timestamp(fields::UPDATED_AT, field(fields::UPDATED_AT)?)?,
            started_at: parse_optional_timestamp(fields::STARTED_AT, field(fields::STARTED_AT)?)?,
            completed_at: parse_optional_timestamp(
                fields::COMPLETED_AT,
                field(fields::COMPLETED_AT)?,
            )?,
            next_retry_at: parse_optional_timestamp(
                fields::NEXT_RETRY_AT,
                field(fields::NEXT_RETRY_AT)?,
            )?,
            attempt_count: parse_number(fields::ATTEMPT_COUNT, field(fields::ATTEMPT_COUNT)?)?,
            max_attempts: parse_number(fields::MAX_ATTEMPTS, field(fields::MAX_ATTEMPTS)?)?,
            timeout_seconds: parse_number(
                fields::TIMEOUT_SECONDS,
                field(fields::TIMEOUT_SECONDS)?,
            )?,
            result: match field(fields::RESULT)? {
                "" => None,
                raw => Some(parse_json(fields::RESULT, raw)?),
            },
            error_message: match field(fields::ERROR_MESSAGE)? {
                "" => None,
                raw => Some(raw.to_string()),
            },
            metadata: parse_json(fields::METADATA, field(fields::METADATA)?)?,
            queue_score: parse_number(fields::QUEUE_SCORE, field(fields::QUEUE_SCORE)?)?,
        })
    }
}

/// Pending-set score: priority descending, then arrival ascending.
pub fn queue_score(priority: i32, enqueued_at: &DateTime<Utc>) -> f64 {
    -(f64::from(priority) * PRIORITY_WEIGHT) + enqueued_at.timestamp_millis() as f64
}

/// Strips control characters and caps the length of an error message.
///
/// Whitespace controls (newlines, tabs) become plain spaces so multi-line
/// errors stay readable on one line.
pub fn sanitize_error(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| if c.is_whitespace() { ' ' } else { c })
        .filter(|c| !c.is_control())
        .take(MAX_ERROR_LENGTH)
        .collect();
    cleaned.trim().to_string()
}

/// Formats a timestamp as RFC 3339 with as many fractional digits as needed
/// to round-trip exactly.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn format_optional_timestamp(ts: &Option<DateTime<Utc>>) -> String {
    ts.as_ref().map(format_timestamp).unwrap_or_default()
}

fn parse_timestamp(field: &'static str, raw: &str) -> Result<DateTime<Utc>, RecordError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| RecordError::InvalidField {
            field,
            message: e.to_string(),
        })
}

fn parse_optional_timestamp(
    field: &'static str,
    raw: &str,
) -> Result<Option<DateTime<Utc>>, RecordError> {
    if raw.is_empty() {
        return Ok(None);
    }
    parse_timestamp(field, raw).map(Some)
}

fn parse_json(field: &'static str, raw: &str) -> Result<Value, RecordError> {
    serde_json::from_str(raw).map_err(|e| RecordError::InvalidField {
        field,
        message: e.to_string(),
    })
}

fn parse_number<T>(field: &'static str, raw: &str) -> Result<T, RecordError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    raw.parse().map_err(|e: T::Err| RecordError::InvalidField {
        field,
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn sample_job() -> EvaluationJob {
        EvaluationJob::new("gpt-4o", json!({"benchmark_spec": {"adapter": "mmlu"}}))
            .with_priority(7)
            .with_metadata(json!({"requested_by": "ci"}))
    }

    #[test]
    fn test_job_new_defaults() {
        let job = EvaluationJob::new("m", json!({}));

        assert!(Uuid::parse_str(&job.id).is_ok());
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempt_count, 0);
        assert_eq!(job.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert_eq!(job.timeout_seconds, DEFAULT_TIMEOUT_SECONDS);
        assert_eq!(job.created_at, job.updated_at);
        assert!(job.started_at.is_none());
        assert!(job.result.is_none());
        assert_eq!(job.metadata, json!({}));
    }

    #[test]
    fn test_job_ids_are_unique() {
        let a = EvaluationJob::new("m", json!({}));
        let b = EvaluationJob::new("m", json!({}));
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_job_builder() {
        let job = EvaluationJob::new("m", json!({}))
            .with_id("job-1")
            .with_priority(-3)
            .with_max_attempts(5)
            .with_timeout_seconds(60);

        assert_eq!(job.id, "job-1");
        assert_eq!(job.priority, -3);
        assert_eq!(job.max_attempts, 5);
        assert_eq!(job.remaining_attempts(), 5);
        assert_eq!(job.timeout_seconds, 60);
    }

    #[test]
    fn test_record_round_trip_fresh_job() {
        let job = sample_job();
        let record = job.to_record();

        assert_eq!(record[fields::STARTED_AT], "");
        assert_eq!(record[fields::RESULT], "");
        assert_eq!(record[fields::STATUS], "pending");

        let parsed = EvaluationJob::from_record(&record).expect("record should decode");
        assert_eq!(parsed, job);
    }

    #[test]
    fn test_record_round_trip_populated_job() {
        let mut job = sample_job();
        let now = Utc::now();
        job.status = JobStatus::Completed;
        job.started_at = Some(now);
        job.completed_at = Some(now + Duration::milliseconds(1500));
        job.next_retry_at = Some(now - Duration::seconds(60));
        job.attempt_count = 2;
        job.result = Some(json!({"accuracy": 0.75, "samples": [1, 2, 3]}));
        job.error_message = Some("previous attempt failed".to_string());
        job.queue_score = queue_score(job.priority, &job.created_at);

        let parsed = EvaluationJob::from_record(&job.to_record()).expect("record should decode");
        assert_eq!(parsed, job);
    }

    #[test]
    fn test_json_round_trip() {
        let job = sample_job();
        let parsed = EvaluationJob::from_json(&job.to_json().expect("serialize"))
            .expect("deserialize");
        assert_eq!(parsed, job);
    }

    #[test]
    fn test_from_record_missing_field() {
        let mut record = sample_job().to_record();
        record.remove(fields::MODEL_ID);

        let err = EvaluationJob::from_record(&record).unwrap_err();
        assert!(matches!(err, RecordError::MissingField("model_id")));
    }

    #[test]
    fn test_from_record_invalid_status() {
        let mut record = sample_job().to_record();
        record.insert(fields::STATUS.to_string(), "running".to_string());

        let err = EvaluationJob::from_record(&record).unwrap_err();
        assert!(err.to_string().contains("running"));
    }

    #[test]
    fn test_status_strings() {
        for status in [
            JobStatus::Pending,
            JobStatus::Active,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Dead,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!(JobStatus::Dead.is_terminal());
        assert!(!JobStatus::Active.is_terminal());
    }

    #[test]
    fn test_queue_score_orders_priority_then_arrival() {
        let t0 = Utc::now();
        let t1 = t0 + Duration::seconds(10);

        assert!(queue_score(20, &t1) < queue_score(1, &t0));
        assert!(queue_score(5, &t0) < queue_score(5, &t1));
        assert!(queue_score(-1, &t0) > queue_score(0, &t1));
    }

    #[test]
    fn test_queue_score_exact_at_max_priority() {
        let t0 = Utc::now();
        let t1 = t0 + Duration::milliseconds(1);

        assert!(queue_score(MAX_PRIORITY, &t0) < queue_score(MAX_PRIORITY, &t1));
        assert!(queue_score(-MAX_PRIORITY, &t0) < queue_score(-MAX_PRIORITY, &t1));
        assert!(queue_score(-MAX_PRIORITY, &t1).abs() < 2f64.powi(53));
    }

    #[test]
    fn test_sanitize_error() {
        assert_eq!(sanitize_error("line one\nline\ttwo\u{7}"), "line one line two");
        assert_eq!(sanitize_error("  \u{0}boom\r\n"), "boom");

        let long = "x".repeat(MAX_ERROR_LENGTH * 2);
        assert_eq!(sanitize_error(&long).chars().count(), MAX_ERROR_LENGTH);
    }
}
