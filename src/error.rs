//! Error types for eval-queue operations.
//!
//! Defines error types for the major subsystems:
//! - Queue state and store access
//! - Configuration loading
//! - Store record decoding
//! - Evaluation execution

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Failed to connect to the store.
    #[error("Store connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    /// A stored job record could not be decoded.
    #[error("Invalid job record: {0}")]
    InvalidRecord(#[from] RecordError),

    /// A job was rejected before it reached the store.
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    /// A job with this id is already in the store.
    #[error("Job {0} already exists")]
    DuplicateJob(String),

    /// A job record kept changing underneath a status transition.
    #[error("Job {0} was modified concurrently too many times")]
    Conflict(String),

    /// The store does not support server-side scripting and relaxed claims are disabled.
    #[error("Store does not support atomic claim scripts: {0}")]
    ScriptingUnavailable(String),

    /// Invalid queue configuration.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A key has a value that cannot be parsed.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Errors raised when decoding a job from its flat store record.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("missing field '{0}'")]
    MissingField(&'static str),

    #[error("field '{field}' has invalid value: {message}")]
    InvalidField {
        field: &'static str,
        message: String,
    },
}

/// Errors produced while executing an evaluation job.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// The job's eval_config does not describe a runnable benchmark.
    #[error("Invalid benchmark spec: {0}")]
    InvalidSpec(String),

    /// No adapter is registered under the requested name.
    #[error("Unknown benchmark adapter '{0}'")]
    UnknownAdapter(String),

    /// The adapter or model call failed.
    #[error("Evaluation failed: {0}")]
    Failed(String),

    /// The executor did not finish within the job's deadline.
    #[error("Evaluation timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    /// The executor panicked.
    #[error("Executor panicked: {0}")]
    Panicked(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}
