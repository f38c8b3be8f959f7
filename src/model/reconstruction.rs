//! Reconstruction-error detector: learns the per-feature center and spread of
//! benign traffic and scores by how poorly a vector reconstructs from them.

use super::{
    decode_params, not_ready, require_training_data, AnomalyModel, FittedMeta, ModelArtifact,
    ModelHealth, ModelScore, ScoreNormalizer,
};
use crate::config::NormalizationMethod;
use crate::error::PipelineError;
use crate::features::{FeatureVector, FEATURE_COUNT, FEATURE_SCHEMA_VERSION};
use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};

pub const RECONSTRUCTION_MODEL_ID: &str = "reconstruction";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ReconstructionParams {
    mean: Vec<f64>,
    std: Vec<f64>,
}

impl ReconstructionParams {
    /// Mean squared standardized residual against the learned projection.
    fn raw_score(&self, values: &[f64]) -> f64 {
        let mut sum = 0.0;
        for (i, &v) in values.iter().enumerate().take(self.mean.len()) {
            let std = self.std[i];
            if std > f64::EPSILON {
                let z = (v - self.mean[i]) / std;
                sum += z * z;
            }
        }
        sum / self.mean.len().max(1) as f64
    }
}

pub struct ReconstructionDetector {
    normalization: NormalizationMethod,
    fitted: Option<(FittedMeta, ReconstructionParams)>,
    version: u32,
}

impl ReconstructionDetector {
    pub fn new(normalization: NormalizationMethod) -> Self {
        Self {
            normalization,
            fitted: None,
            version: 0,
        }
    }
}

impl AnomalyModel for ReconstructionDetector {
    fn model_id(&self) -> &str {
        RECONSTRUCTION_MODEL_ID
    }

    fn fit(&mut self, vectors: &[FeatureVector]) -> Result<(), PipelineError> {
        require_training_data(vectors)?;
        let rows = vectors.len();
        let mut matrix = Array2::<f64>::zeros((rows, FEATURE_COUNT));
        for (i, vector) in vectors.iter().enumerate() {
            for (j, &v) in vector.values.iter().enumerate().take(FEATURE_COUNT) {
                matrix[[i, j]] = v;
            }
        }

        let mean: Array1<f64> = matrix
            .mean_axis(Axis(0))
            .unwrap_or_else(|| Array1::zeros(FEATURE_COUNT));
        let mut var = Array1::<f64>::zeros(FEATURE_COUNT);
        for row in matrix.outer_iter() {
            let diff = &row.to_owned() - &mean;
            var = var + diff.mapv(|v| v * v);
        }
        let std = var.mapv(|v| (v / rows as f64).sqrt());

        let params = ReconstructionParams {
            mean: mean.to_vec(),
            std: std.to_vec(),
        };
        let raw: Vec<f64> = vectors.iter().map(|v| params.raw_score(&v.values)).collect();
        let normalizer = ScoreNormalizer::fit(&raw, self.normalization);

        self.version += 1;
        let meta = FittedMeta::new(self.version, FEATURE_SCHEMA_VERSION, normalizer);
        self.fitted = Some((meta, params));
        Ok(())
    }

    fn score(&self, vector: &FeatureVector) -> Result<ModelScore, PipelineError> {
        let (meta, params) = self
            .fitted
            .as_ref()
            .ok_or_else(|| not_ready(RECONSTRUCTION_MODEL_ID))?;
        meta.ensure_schema(RECONSTRUCTION_MODEL_ID, vector)?;
        Ok(ModelScore {
            model_id: RECONSTRUCTION_MODEL_ID.to_string(),
            score: meta.normalizer.normalize(params.raw_score(&vector.values)),
            version: meta.version,
        })
    }

    fn health(&self) -> ModelHealth {
        ModelHealth {
            fitted: self.fitted.is_some(),
            version: self.version,
        }
    }

    fn artifact(&self) -> Result<ModelArtifact, PipelineError> {
        let (meta, params) = self
            .fitted
            .as_ref()
            .ok_or_else(|| not_ready(RECONSTRUCTION_MODEL_ID))?;
        Ok(ModelArtifact {
            model_id: RECONSTRUCTION_MODEL_ID.to_string(),
            version: meta.version,
            schema_version: meta.schema_version,
            feature_names: meta.feature_names.clone(),
            params: serde_json::to_value(SavedState {
                meta: meta.clone(),
                params: params.clone(),
            })
            .map_err(|e| PipelineError::Storage(e.to_string()))?,
        })
    }

    fn restore(&mut self, artifact: &ModelArtifact) -> Result<(), PipelineError> {
        let state: SavedState = decode_params(artifact)?;
        self.version = state.meta.version;
        self.fitted = Some((state.meta, state.params));
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct SavedState {
    meta: FittedMeta,
    params: ReconstructionParams,
}
