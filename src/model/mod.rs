//! Model adapter layer: the capability contract every anomaly detector
//! implements, per-model score normalization, JSON artifacts, and the
//! publish/swap registry.

mod boundary;
mod forest;
mod reconstruction;
mod sequence;

pub use boundary::BoundaryDetector;
pub use forest::IsolationForestDetector;
pub use reconstruction::ReconstructionDetector;
pub use sequence::SequenceDetector;

use crate::config::NormalizationMethod;
use crate::error::PipelineError;
use crate::features::{FeatureVector, FEATURE_NAMES};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};

/// Scalar anomaly score from one model for one vector; higher = more anomalous.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelScore {
    pub model_id: String,
    /// Normalized to [0,1] against the model's training distribution
    pub score: f64,
    /// Monotonically increasing per fit
    pub version: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModelHealth {
    pub fitted: bool,
    pub version: u32,
}

/// Serializable fitted parameters plus the feature schema they were trained
/// against. The persistence boundary for every detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub model_id: String,
    pub version: u32,
    pub schema_version: u32,
    pub feature_names: Vec<String>,
    pub params: serde_json::Value,
}

/// Capability contract the pipeline scores through. New detector families are
/// added by implementing this, nothing else.
pub trait AnomalyModel: Send + Sync {
    fn model_id(&self) -> &str;
    fn fit(&mut self, vectors: &[FeatureVector]) -> Result<(), PipelineError>;
    fn score(&self, vector: &FeatureVector) -> Result<ModelScore, PipelineError>;
    fn health(&self) -> ModelHealth;
    fn artifact(&self) -> Result<ModelArtifact, PipelineError>;
    fn restore(&mut self, artifact: &ModelArtifact) -> Result<(), PipelineError>;
}

/// Training-schema snapshot shared by all detectors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FittedMeta {
    pub version: u32,
    pub schema_version: u32,
    pub feature_names: Vec<String>,
    pub normalizer: ScoreNormalizer,
}

impl FittedMeta {
    pub fn new(version: u32, schema_version: u32, normalizer: ScoreNormalizer) -> Self {
        Self {
            version,
            schema_version,
            feature_names: FEATURE_NAMES.iter().map(|s| s.to_string()).collect(),
            normalizer,
        }
    }

    /// A model trained against a different schema than the engine's current
    /// output refuses to score.
    pub fn ensure_schema(
        &self,
        model_id: &str,
        vector: &FeatureVector,
    ) -> Result<(), PipelineError> {
        if self.schema_version != vector.schema_version {
            return Err(PipelineError::SchemaMismatch {
                model_id: model_id.to_string(),
                detail: format!(
                    "trained on schema v{}, vector is v{}",
                    self.schema_version, vector.schema_version
                ),
            });
        }
        if self.feature_names.len() != FEATURE_NAMES.len()
            || self
                .feature_names
                .iter()
                .zip(FEATURE_NAMES.iter())
                .any(|(a, b)| a != b)
        {
            return Err(PipelineError::SchemaMismatch {
                model_id: model_id.to_string(),
                detail: "trained feature names differ from current output schema".into(),
            });
        }
        Ok(())
    }
}

/// Maps a model's raw score onto [0,1], fitted once on the training score
/// distribution so cross-model fusion is meaningful.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum ScoreNormalizer {
    MinMax { lo: f64, hi: f64 },
    /// Empirical CDF over the sorted training scores
    Quantile { sorted: Vec<f64> },
}

impl ScoreNormalizer {
    pub fn fit(raw: &[f64], method: NormalizationMethod) -> Self {
        match method {
            NormalizationMethod::MinMax => {
                let lo = raw.iter().copied().fold(f64::INFINITY, f64::min);
                let hi = raw.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                if lo.is_finite() && hi.is_finite() {
                    ScoreNormalizer::MinMax { lo, hi }
                } else {
                    ScoreNormalizer::MinMax { lo: 0.0, hi: 1.0 }
                }
            }
            NormalizationMethod::Quantile => {
                let mut sorted: Vec<f64> = raw.iter().copied().filter(|v| v.is_finite()).collect();
                sorted.sort_by(|a, b| a.partial_cmp(b).expect("finite scores"));
                ScoreNormalizer::Quantile { sorted }
            }
        }
    }

    pub fn normalize(&self, raw: f64) -> f64 {
        let out = match self {
            ScoreNormalizer::MinMax { lo, hi } => {
                if hi > lo {
                    (raw - lo) / (hi - lo)
                } else {
                    0.0
                }
            }
            ScoreNormalizer::Quantile { sorted } => {
                if sorted.is_empty() {
                    0.0
                } else {
                    let rank = sorted.partition_point(|v| *v <= raw);
                    rank as f64 / sorted.len() as f64
                }
            }
        };
        out.clamp(0.0, 1.0)
    }
}

/// Registered models as an immutable snapshot, replaced wholesale on publish.
/// Readers clone the `Arc` and never observe a half-updated set.
#[derive(Default)]
pub struct ModelRegistry {
    inner: RwLock<Arc<Vec<Arc<dyn AnomalyModel>>>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, models: Vec<Arc<dyn AnomalyModel>>) {
        let mut guard = self.inner.write().expect("registry lock");
        *guard = Arc::new(models);
    }

    pub fn snapshot(&self) -> Arc<Vec<Arc<dyn AnomalyModel>>> {
        self.inner.read().expect("registry lock").clone()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }
}

pub(crate) fn not_ready(model_id: &str) -> PipelineError {
    PipelineError::ModelNotReady(model_id.to_string())
}

pub(crate) fn require_training_data(vectors: &[FeatureVector]) -> Result<(), PipelineError> {
    if vectors.is_empty() {
        Err(PipelineError::InsufficientData)
    } else {
        Ok(())
    }
}

pub(crate) fn decode_params<T: serde::de::DeserializeOwned>(
    artifact: &ModelArtifact,
) -> Result<T, PipelineError> {
    serde_json::from_value(artifact.params.clone())
        .map_err(|e| PipelineError::Storage(format!("artifact for {}: {}", artifact.model_id, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minmax_normalizer_clamps() {
        let n = ScoreNormalizer::fit(&[1.0, 3.0, 5.0], NormalizationMethod::MinMax);
        assert_eq!(n.normalize(1.0), 0.0);
        assert_eq!(n.normalize(5.0), 1.0);
        assert_eq!(n.normalize(3.0), 0.5);
        assert_eq!(n.normalize(9.0), 1.0);
        assert_eq!(n.normalize(-4.0), 0.0);
    }

    #[test]
    fn degenerate_minmax_is_zero() {
        let n = ScoreNormalizer::fit(&[2.0, 2.0], NormalizationMethod::MinMax);
        assert_eq!(n.normalize(2.0), 0.0);
    }

    #[test]
    fn quantile_normalizer_is_rank_fraction() {
        let n = ScoreNormalizer::fit(&[1.0, 2.0, 3.0, 4.0], NormalizationMethod::Quantile);
        assert_eq!(n.normalize(2.5), 0.5);
        assert_eq!(n.normalize(10.0), 1.0);
        assert_eq!(n.normalize(0.0), 0.0);
    }
}
