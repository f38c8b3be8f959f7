//! Boundary/margin detector: a one-class hypersphere around the training
//! distribution; score grows with distance beyond the fitted boundary.

use super::{
    decode_params, not_ready, require_training_data, AnomalyModel, FittedMeta, ModelArtifact,
    ModelHealth, ModelScore, ScoreNormalizer,
};
use crate::config::NormalizationMethod;
use crate::error::PipelineError;
use crate::features::{FeatureVector, FEATURE_COUNT, FEATURE_SCHEMA_VERSION};
use ndarray::Array1;
use serde::{Deserialize, Serialize};

pub const BOUNDARY_MODEL_ID: &str = "boundary";

/// Training points inside this quantile of distances define the boundary radius.
const RADIUS_QUANTILE: f64 = 0.9;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BoundaryParams {
    centroid: Vec<f64>,
    scale: Vec<f64>,
    radius: f64,
}

impl BoundaryParams {
    fn distance(&self, values: &[f64]) -> f64 {
        let mut sum = 0.0;
        for (i, &v) in values.iter().enumerate().take(self.centroid.len()) {
            let scale = if self.scale[i] > f64::EPSILON { self.scale[i] } else { 1.0 };
            let d = (v - self.centroid[i]) / scale;
            sum += d * d;
        }
        sum.sqrt()
    }

    /// Distance relative to the boundary: <1 inside, >1 outside.
    fn raw_score(&self, values: &[f64]) -> f64 {
        if self.radius > f64::EPSILON {
            self.distance(values) / self.radius
        } else {
            self.distance(values)
        }
    }
}

pub struct BoundaryDetector {
    normalization: NormalizationMethod,
    fitted: Option<(FittedMeta, BoundaryParams)>,
    version: u32,
}

impl BoundaryDetector {
    pub fn new(normalization: NormalizationMethod) -> Self {
        Self {
            normalization,
            fitted: None,
            version: 0,
        }
    }
}

impl AnomalyModel for BoundaryDetector {
    fn model_id(&self) -> &str {
        BOUNDARY_MODEL_ID
    }

    fn fit(&mut self, vectors: &[FeatureVector]) -> Result<(), PipelineError> {
        require_training_data(vectors)?;
        let rows = vectors.len() as f64;

        let mut centroid = Array1::<f64>::zeros(FEATURE_COUNT);
        for vector in vectors {
            for (j, &v) in vector.values.iter().enumerate().take(FEATURE_COUNT) {
                centroid[j] += v;
            }
        }
        centroid.mapv_inplace(|v| v / rows);

        let mut var = Array1::<f64>::zeros(FEATURE_COUNT);
        for vector in vectors {
            for (j, &v) in vector.values.iter().enumerate().take(FEATURE_COUNT) {
                let d = v - centroid[j];
                var[j] += d * d;
            }
        }
        let scale = var.mapv(|v| (v / rows).sqrt());

        let mut params = BoundaryParams {
            centroid: centroid.to_vec(),
            scale: scale.to_vec(),
            radius: 0.0,
        };
        let mut distances: Vec<f64> = vectors.iter().map(|v| params.distance(&v.values)).collect();
        distances.sort_by(|a, b| a.partial_cmp(b).expect("finite distances"));
        let idx = ((distances.len() as f64 - 1.0) * RADIUS_QUANTILE).round() as usize;
        params.radius = distances[idx.min(distances.len() - 1)];

        let raw: Vec<f64> = vectors.iter().map(|v| params.raw_score(&v.values)).collect();
        let normalizer = ScoreNormalizer::fit(&raw, self.normalization);

        self.version += 1;
        let meta = FittedMeta::new(self.version, FEATURE_SCHEMA_VERSION, normalizer);
        self.fitted = Some((meta, params));
        Ok(())
    }

    fn score(&self, vector: &FeatureVector) -> Result<ModelScore, PipelineError> {
        let (meta, params) = self.fitted.as_ref().ok_or_else(|| not_ready(BOUNDARY_MODEL_ID))?;
        meta.ensure_schema(BOUNDARY_MODEL_ID, vector)?;
        Ok(ModelScore {
            model_id: BOUNDARY_MODEL_ID.to_string(),
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
        let (meta, params) = self.fitted.as_ref().ok_or_else(|| not_ready(BOUNDARY_MODEL_ID))?;
        Ok(ModelArtifact {
            model_id: BOUNDARY_MODEL_ID.to_string(),
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
    params: BoundaryParams,
}
