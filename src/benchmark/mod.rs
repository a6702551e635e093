//! Benchmark adapter boundary and the default job executor.
//!
//! Scoring a model is not the queue's job. Applications register
//! [`BenchmarkAdapter`]s in an [`AdapterRegistry`] and supply a
//! [`ModelPredictor`] that talks to the model. The [`BenchmarkExecutor`]
//! ties them together for the worker:
//!
//! ```text
//! job.eval_config["benchmark_spec"] -> BenchmarkSpec
//!        registry[spec.adapter].run(spec, model, seed) -> BenchmarkManifest
//!        sha256(manifest) + metrics summary -> job.result
//! ```
//!
//! # Example
//!
//! ```ignore
//! use eval_queue::benchmark::{AdapterRegistry, BenchmarkExecutor, ExactMatchAdapter};
//!
//! let registry = AdapterRegistry::new().with_adapter(ExactMatchAdapter);
//! let executor = BenchmarkExecutor::new(Arc::new(registry), Arc::new(my_predictor));
//! let pool = WorkerPool::new(pool_config, queue, Arc::new(executor));
//! ```

pub mod exact_match;
pub mod executor;
pub mod registry;

pub use exact_match::ExactMatchAdapter;
pub use executor::{manifest_hash, BenchmarkExecutor, DEFAULT_SEED};
pub use registry::AdapterRegistry;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ExecutionError;

/// Key of the benchmark description inside a job's `eval_config`.
pub const BENCHMARK_SPEC_KEY: &str = "benchmark_spec";

/// What to run, parsed from `eval_config["benchmark_spec"]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkSpec {
    /// Registry name of the adapter.
    pub adapter: String,
    /// Adapter-specific parameters.
    #[serde(default)]
    pub params: Value,
    /// Fixed seed, or `None` for the executor's default.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl BenchmarkSpec {
    /// Extracts the spec from a job's `eval_config`.
    pub fn from_eval_config(eval_config: &Value) -> Result<Self, ExecutionError> {
        let raw = eval_config.get(BENCHMARK_SPEC_KEY).ok_or_else(|| {
            ExecutionError::InvalidSpec(format!("eval_config has no '{}'", BENCHMARK_SPEC_KEY))
        })?;

        let spec: BenchmarkSpec = serde_json::from_value(raw.clone())
            .map_err(|e| ExecutionError::InvalidSpec(e.to_string()))?;

        if spec.adapter.trim().is_empty() {
            return Err(ExecutionError::InvalidSpec(
                "adapter name cannot be empty".to_string(),
            ));
        }
        Ok(spec)
    }

    /// Reads a parameter, or `None` if absent.
    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }
}

/// One scored sample in a manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleRecord {
    pub id: String,
    pub prompt: String,
    pub prediction: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    pub score: f64,
}

/// Standardized output of one benchmark run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkManifest {
    pub adapter: String,
    pub model_id: String,
    pub seed: u64,
    /// Aggregate metrics, keyed by name.
    pub metrics: BTreeMap<String, f64>,
    pub samples: Vec<SampleRecord>,
}

/// Produces model predictions.
#[async_trait]
pub trait ModelPredictor: Send + Sync {
    async fn predict(&self, model_id: &str, prompt: &str) -> Result<String, ExecutionError>;
}

/// A predictor bound to the model a job targets.
pub struct BoundModel<'a> {
    model_id: &'a str,
    predictor: &'a dyn ModelPredictor,
}

impl<'a> BoundModel<'a> {
    pub fn new(model_id: &'a str, predictor: &'a dyn ModelPredictor) -> Self {
        Self {
            model_id,
            predictor,
        }
    }

    pub fn model_id(&self) -> &str {
        self.model_id
    }

    pub async fn predict(&self, prompt: &str) -> Result<String, ExecutionError> {
        self.predictor.predict(self.model_id, prompt).await
    }
}

/// Runs one evaluation protocol against a model.
#[async_trait]
pub trait BenchmarkAdapter: Send + Sync {
    /// Registry name.
    fn name(&self) -> &str;

    async fn run(
        &self,
        spec: &BenchmarkSpec,
        model: &BoundModel<'_>,
        seed: u64,
    ) -> Result<BenchmarkManifest, ExecutionError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_spec_from_eval_config() {
        let config = json!({
            "benchmark_spec": {"adapter": "exact_match", "params": {"limit": 5}, "seed": 7}
        });
        let spec = BenchmarkSpec::from_eval_config(&config).unwrap();

        assert_eq!(spec.adapter, "exact_match");
        assert_eq!(spec.seed, Some(7));
        assert_eq!(spec.param("limit"), Some(&json!(5)));
    }

    #[test]
    fn test_spec_defaults() {
        let spec = BenchmarkSpec::from_eval_config(&json!({"benchmark_spec": {"adapter": "a"}}))
            .unwrap();
        assert_eq!(spec.params, Value::Null);
        assert_eq!(spec.seed, None);
    }

    #[test]
    fn test_spec_rejects_missing_or_invalid() {
        assert!(matches!(
            BenchmarkSpec::from_eval_config(&json!({})),
            Err(ExecutionError::InvalidSpec(_))
        ));
        assert!(matches!(
            BenchmarkSpec::from_eval_config(&json!({"benchmark_spec": {"params": {}}})),
            Err(ExecutionError::InvalidSpec(_))
        ));
        assert!(matches!(
            BenchmarkSpec::from_eval_config(&json!({"benchmark_spec": {"adapter": " "}})),
            Err(ExecutionError::InvalidSpec(_))
        ));
    }
}
