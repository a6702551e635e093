//! Queue configuration.
//!
//! Limits and timing parameters shared by the queue manager and its workers.
//! Values can be loaded from environment-style key/value pairs.

use std::time::Duration;

use crate::error::ConfigError;

/// Environment keys understood by [`EvaluationQueueConfig::from_vars`].
pub mod keys {
    pub const REDIS_URL: &str = "EVAL_QUEUE_REDIS_URL";
    pub const KEY_PREFIX: &str = "EVAL_QUEUE_KEY_PREFIX";
    pub const MAX_CONCURRENT_PER_MODEL: &str = "EVAL_QUEUE_MAX_CONCURRENT_PER_MODEL";
    pub const MAX_CONCURRENT_GLOBAL: &str = "EVAL_QUEUE_MAX_CONCURRENT_GLOBAL";
    pub const JOB_TIMEOUT_SECONDS: &str = "EVAL_QUEUE_JOB_TIMEOUT_SECONDS";
    pub const MAX_RETRIES: &str = "EVAL_QUEUE_MAX_RETRIES";
    pub const RETRY_BASE_DELAY_SECONDS: &str = "EVAL_QUEUE_RETRY_BASE_DELAY_SECONDS";
    pub const POLL_INTERVAL_SECONDS: &str = "EVAL_QUEUE_POLL_INTERVAL_SECONDS";
    pub const CLAIM_SCAN_LIMIT: &str = "EVAL_QUEUE_CLAIM_SCAN_LIMIT";
    pub const ERROR_BACKOFF_MAX_SECONDS: &str = "EVAL_QUEUE_ERROR_BACKOFF_MAX_SECONDS";
    pub const ALLOW_RELAXED_CLAIM: &str = "EVAL_QUEUE_ALLOW_RELAXED_CLAIM";
    pub const STALE_GRACE_SECONDS: &str = "EVAL_QUEUE_STALE_GRACE_SECONDS";
    pub const RECOVERY_INTERVAL_SECONDS: &str = "EVAL_QUEUE_RECOVERY_INTERVAL_SECONDS";
}

/// Configuration for the evaluation queue.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationQueueConfig {
    // Store settings
    /// Redis connection URL.
    pub redis_url: String,
    /// Namespace prepended to every store key.
    pub key_prefix: String,

    // Concurrency limits
    /// Maximum number of ACTIVE jobs for any single model.
    pub max_concurrent_per_model: u32,
    /// Maximum number of ACTIVE jobs across all models.
    pub max_concurrent_global: u32,
    /// How many pending entries one claim inspects before giving up.
    pub claim_scan_limit: u32,

    // Job defaults
    /// Per-attempt timeout applied to jobs that do not set one.
    pub job_timeout_seconds: u64,
    /// Attempt budget applied to jobs that do not set one.
    pub max_retries: u32,
    /// First retry delay; doubled for each further attempt.
    pub retry_base_delay_seconds: u64,

    // Worker timing
    /// Sleep between polls when the queue is empty.
    pub poll_interval: Duration,
    /// Ceiling for the worker's store-error backoff.
    pub error_backoff_max: Duration,
    /// Extra time past a job's timeout before it is presumed abandoned.
    pub stale_grace: Duration,
    /// How often a running worker pool sweeps for stale jobs. Zero disables it.
    pub recovery_interval: Duration,

    /// Accept the non-atomic claim path when the store cannot run scripts.
    pub allow_relaxed_claim: bool,
}

impl Default for EvaluationQueueConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            key_prefix: "evalq".to_string(),

            max_concurrent_per_model: 5,
            max_concurrent_global: 20,
            claim_scan_limit: 100,

            job_timeout_seconds: 1800, // 30 minutes
            max_retries: 3,
            retry_base_delay_seconds: 60,

            poll_interval: Duration::from_secs(1),
            error_backoff_max: Duration::from_secs(30),
            stale_grace: Duration::from_secs(60),
            recovery_interval: Duration::from_secs(30),

            allow_relaxed_claim: false,
        }
    }
}

impl EvaluationQueueConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from the process environment.
    ///
    /// See [`EvaluationQueueConfig::from_vars`] for the recognised keys.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(std::env::vars())
    }

    /// Creates configuration from environment-style key/value pairs.
    ///
    /// # Keys
    ///
    /// - `EVAL_QUEUE_REDIS_URL` (default: redis://localhost:6379)
    /// - `EVAL_QUEUE_KEY_PREFIX` (default: evalq)
    /// - `EVAL_QUEUE_MAX_CONCURRENT_PER_MODEL` (default: 5)
    /// - `EVAL_QUEUE_MAX_CONCURRENT_GLOBAL` (default: 20)
    /// - `EVAL_QUEUE_JOB_TIMEOUT_SECONDS` (default: 1800)
    /// - `EVAL_QUEUE_MAX_RETRIES` (default: 3)
    /// - `EVAL_QUEUE_RETRY_BASE_DELAY_SECONDS` (default: 60)
    /// - `EVAL_QUEUE_POLL_INTERVAL_SECONDS` (default: 1.0, fractional allowed)
    /// - `EVAL_QUEUE_CLAIM_SCAN_LIMIT` (default: 100)
    /// - `EVAL_QUEUE_ERROR_BACKOFF_MAX_SECONDS` (default: 30)
    /// - `EVAL_QUEUE_ALLOW_RELAXED_CLAIM` (default: false)
    /// - `EVAL_QUEUE_STALE_GRACE_SECONDS` (default: 60)
    /// - `EVAL_QUEUE_RECOVERY_INTERVAL_SECONDS` (default: 30, 0 disables)
    ///
    /// Unrecognised keys are ignored.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a value cannot be parsed or the result fails validation.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();

        for (key, value) in vars {
            let key = key.as_ref();
            let value = value.as_ref().trim();

            match key {
                keys::REDIS_URL => config.redis_url = value.to_string(),
                keys::KEY_PREFIX => config.key_prefix = value.to_string(),
                keys::MAX_CONCURRENT_PER_MODEL => {
                    config.max_concurrent_per_model = parse_value(value, key)?
                }
                keys::MAX_CONCURRENT_GLOBAL => {
                    config.max_concurrent_global = parse_value(value, key)?
                }
                keys::JOB_TIMEOUT_SECONDS => config.job_timeout_seconds = parse_value(value, key)?,
                keys::MAX_RETRIES => config.max_retries = parse_value(value, key)?,
                keys::RETRY_BASE_DELAY_SECONDS => {
                    config.retry_base_delay_seconds = parse_value(value, key)?
                }
                keys::POLL_INTERVAL_SECONDS => {
                    config.poll_interval = parse_seconds(value, key)?;
                }
                keys::CLAIM_SCAN_LIMIT => config.claim_scan_limit = parse_value(value, key)?,
                keys::ERROR_BACKOFF_MAX_SECONDS => {
                    config.error_backoff_max = parse_seconds(value, key)?;
                }
                keys::ALLOW_RELAXED_CLAIM => config.allow_relaxed_claim = parse_bool(value, key)?,
                keys::STALE_GRACE_SECONDS => config.stale_grace = parse_seconds(value, key)?,
                keys::RECOVERY_INTERVAL_SECONDS => {
                    config.recovery_interval = parse_seconds(value, key)?;
                }
                _ => {}
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.redis_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "redis_url cannot be empty".to_string(),
            ));
        }

        if self.key_prefix.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "key_prefix cannot be empty".to_string(),
            ));
        }

        if self.max_concurrent_per_model == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_concurrent_per_model must be greater than 0".to_string(),
            ));
        }

        if self.max_concurrent_global == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_concurrent_global must be greater than 0".to_string(),
            ));
        }

        if self.claim_scan_limit == 0 {
            return Err(ConfigError::ValidationFailed(
                "claim_scan_limit must be greater than 0".to_string(),
            ));
        }

        if self.job_timeout_seconds == 0 {
            return Err(ConfigError::ValidationFailed(
                "job_timeout_seconds must be greater than 0".to_string(),
            ));
        }

        if self.max_retries == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_retries must be greater than 0".to_string(),
            ));
        }

        if self.poll_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "poll_interval must be greater than 0".to_string(),
            ));
        }

        if self.error_backoff_max < self.poll_interval {
            return Err(ConfigError::ValidationFailed(
                "error_backoff_max cannot be shorter than poll_interval".to_string(),
            ));
        }

        Ok(())
    }

    /// Builder method to set the Redis URL.
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    /// Builder method to set the key prefix.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Builder method to set the per-model concurrency cap.
    pub fn with_max_concurrent_per_model(mut self, max: u32) -> Self {
        self.max_concurrent_per_model = max;
        self
    }

    /// Builder method to set the global concurrency cap.
    pub fn with_max_concurrent_global(mut self, max: u32) -> Self {
        self.max_concurrent_global = max;
        self
    }

    /// Builder method to set the claim scan limit.
    pub fn with_claim_scan_limit(mut self, limit: u32) -> Self {
        self.claim_scan_limit = limit;
        self
    }

    /// Builder method to set the default job timeout.
    pub fn with_job_timeout_seconds(mut self, seconds: u64) -> Self {
        self.job_timeout_seconds = seconds;
        self
    }

    /// Builder method to set the default attempt budget.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Builder method to set the base retry delay.
    pub fn with_retry_base_delay_seconds(mut self, seconds: u64) -> Self {
        self.retry_base_delay_seconds = seconds;
        self
    }

    /// Builder method to set the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Builder method to set the store-error backoff ceiling.
    pub fn with_error_backoff_max(mut self, max: Duration) -> Self {
        self.error_backoff_max = max;
        self
    }

    /// Builder method to set the stale-job grace period.
    pub fn with_stale_grace(mut self, grace: Duration) -> Self {
        self.stale_grace = grace;
        self
    }

    /// Builder method to set the stale-job sweep interval.
    pub fn with_recovery_interval(mut self, interval: Duration) -> Self {
        self.recovery_interval = interval;
        self
    }

    /// Builder method to allow the relaxed (non-atomic) claim path.
    pub fn with_relaxed_claim(mut self, allowed: bool) -> Self {
        self.allow_relaxed_claim = allowed;
        self
    }
}

/// Parses an environment value into the target type.
fn parse_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}

/// Parses a (possibly fractional) number of seconds.
fn parse_seconds(value: &str, key: &str) -> Result<Duration, ConfigError> {
    let secs: f64 = parse_value(value, key)?;
    Duration::try_from_secs_f64(secs).map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}

/// Parses a boolean environment value.
fn parse_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean, got '{}'", value),
        }),
    }
}
