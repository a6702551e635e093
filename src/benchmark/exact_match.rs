//! Inline exact-match benchmark.
//!
//! Samples are carried in the spec itself:
//!
//! ```json
//! {
//!   "adapter": "exact_match",
//!   "params": {
//!     "samples": [{"id": "q1", "prompt": "2+2=", "reference": "4"}],
//!     "limit": 100,
//!     "case_sensitive": false
//!   }
//! }
//! ```
//!
//! The seed picks the rotation offset when `limit` is smaller than the
//! sample list, so reruns with the same seed score the same subset.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;

use super::{BenchmarkAdapter, BenchmarkManifest, BenchmarkSpec, BoundModel, SampleRecord};
use crate::error::ExecutionError;

#[derive(Debug, Deserialize)]
struct InlineSample {
    id: String,
    prompt: String,
    reference: String,
}

#[derive(Debug, Deserialize)]
struct ExactMatchParams {
    samples: Vec<InlineSample>,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    case_sensitive: bool,
}

/// Scores predictions by exact match against a reference answer.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactMatchAdapter;

impl ExactMatchAdapter {
    pub const NAME: &'static str = "exact_match";

    fn matches(prediction: &str, reference: &str, case_sensitive: bool) -> bool {
        let (prediction, reference) = (prediction.trim(), reference.trim());
        if case_sensitive {
            prediction == reference
        } else {
            prediction.eq_ignore_ascii_case(reference)
        }
    }
}

#[async_trait]
impl BenchmarkAdapter for ExactMatchAdapter {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn run(
        &self,
        spec: &BenchmarkSpec,
        model: &BoundModel<'_>,
        seed: u64,
    ) -> Result<BenchmarkManifest, ExecutionError> {
        let params: ExactMatchParams = serde_json::from_value(spec.params.clone())
            .map_err(|e| ExecutionError::InvalidSpec(format!("exact_match params: {}", e)))?;
        if params.samples.is_empty() {
            return Err(ExecutionError::InvalidSpec(
                "exact_match needs at least one sample".to_string(),
            ));
        }

        let total = params.samples.len();
        let take = params.limit.unwrap_or(total).clamp(1, total);
        let offset = (seed % total as u64) as usize;

        let mut samples = Vec::with_capacity(take);
        for sample in params.samples.iter().cycle().skip(offset).take(take) {
            let prediction = model.predict(&sample.prompt).await?;
            let correct = Self::matches(&prediction, &sample.reference, params.case_sensitive);
            samples.push(SampleRecord {
                id: sample.id.clone(),
                prompt: sample.prompt.clone(),
                prediction,
                reference: Some(sample.reference.clone()),
                score: if correct { 1.0 } else { 0.0 },
            });
        }

        let correct: f64 = samples.iter().map(|s| s.score).sum();
        let mut metrics = BTreeMap::new();
        metrics.insert("accuracy".to_string(), correct / samples.len() as f64);
        metrics.insert("correct".to_string(), correct);

        Ok(BenchmarkManifest {
            adapter: Self::NAME.to_string(),
            model_id: model.model_id().to_string(),
            seed,
            metrics,
            samples,
        })
    }
}
