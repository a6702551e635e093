//! Default job executor backed by the adapter registry.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::{AdapterRegistry, BenchmarkManifest, BenchmarkSpec, BoundModel, ModelPredictor};
use crate::error::ExecutionError;
use crate::scheduler::job::EvaluationJob;
use crate::scheduler::worker::JobExecutor;

/// Seed used when a spec does not pin one.
pub const DEFAULT_SEED: u64 = 42;

/// Resolves the job's adapter, runs it, and summarizes the manifest.
///
/// The job result has the shape
/// `{adapter, manifest_hash, metrics, sample_count, seed}`. Per-sample
/// records stay out of the queue record.
pub struct BenchmarkExecutor {
    registry: Arc<AdapterRegistry>,
    predictor: Arc<dyn ModelPredictor>,
    default_seed: u64,
}

impl BenchmarkExecutor {
    pub fn new(registry: Arc<AdapterRegistry>, predictor: Arc<dyn ModelPredictor>) -> Self {
        Self {
            registry,
            predictor,
            default_seed: DEFAULT_SEED,
        }
    }

    pub fn with_default_seed(mut self, seed: u64) -> Self {
        self.default_seed = seed;
        self
    }

    pub fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }
}

#[async_trait]
impl JobExecutor for BenchmarkExecutor {
    async fn execute(&self, job: &EvaluationJob) -> Result<Value, ExecutionError> {
        let spec = BenchmarkSpec::from_eval_config(&job.eval_config)?;
        let adapter = self
            .registry
            .get(&spec.adapter)
            .ok_or_else(|| ExecutionError::UnknownAdapter(spec.adapter.clone()))?;
        let seed = spec.seed.unwrap_or(self.default_seed);

        debug!(
            job_id = %job.id,
            adapter = %spec.adapter,
            seed = seed,
            "Running benchmark adapter"
        );

        let model = BoundModel::new(&job.model_id, self.predictor.as_ref());
        let manifest = adapter.run(&spec, &model, seed).await?;
        let hash = manifest_hash(&manifest)?;

        info!(
            job_id = %job.id,
            adapter = %spec.adapter,
            samples = manifest.samples.len(),
            manifest_hash = %hash,
            "Benchmark run finished"
        );

        Ok(json!({
            "adapter": manifest.adapter,
            "manifest_hash": hash,
            "metrics": manifest.metrics,
            "sample_count": manifest.samples.len(),
            "seed": manifest.seed,
        }))
    }
}

/// Hex SHA-256 of the manifest's JSON encoding.
///
/// Struct fields serialize in declaration order and metrics are a sorted map,
/// so equal manifests always hash the same.
pub fn manifest_hash(manifest: &BenchmarkManifest) -> Result<String, ExecutionError> {
    let bytes = serde_json::to_vec(manifest)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}
