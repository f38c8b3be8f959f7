//! Sequence detector: scores the ordered sub-window activity trace of a
//! session against first-order transition statistics learned from training
//! traces, rather than the flat feature vector.

use super::{
    decode_params, not_ready, require_training_data, AnomalyModel, FittedMeta, ModelArtifact,
    ModelHealth, ModelScore, ScoreNormalizer,
};
use crate::config::NormalizationMethod;
use crate::error::PipelineError;
use crate::features::{FeatureVector, FEATURE_SCHEMA_VERSION, TRACE_SYMBOLS};
use serde::{Deserialize, Serialize};

pub const SEQUENCE_MODEL_ID: &str = "sequence";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SequenceParams {
    /// P(symbol) at trace start, Laplace-smoothed
    initial: Vec<f64>,
    /// P(next | current), row-major TRACE_SYMBOLS x TRACE_SYMBOLS
    transitions: Vec<f64>,
}

impl SequenceParams {
    fn transition(&self, from: u8, to: u8) -> f64 {
        self.transitions[from as usize * TRACE_SYMBOLS + to as usize]
    }

    /// Mean negative log2 likelihood of the observed trace. A single-symbol
    /// trace scores only its initial probability.
    fn raw_score(&self, trace: &[u8]) -> f64 {
        let Some(&first) = trace.first() else {
            return 0.0;
        };
        let mut nll = -self.initial[first as usize].log2();
        let mut terms = 1.0;
        for pair in trace.windows(2) {
            nll -= self.transition(pair[0], pair[1]).log2();
            terms += 1.0;
        }
        nll / terms
    }
}

pub struct SequenceDetector {
    normalization: NormalizationMethod,
    fitted: Option<(FittedMeta, SequenceParams)>,
    version: u32,
}

impl SequenceDetector {
    pub fn new(normalization: NormalizationMethod) -> Self {
        Self {
            normalization,
            fitted: None,
            version: 0,
        }
    }
}

impl AnomalyModel for SequenceDetector {
    fn model_id(&self) -> &str {
        SEQUENCE_MODEL_ID
    }

    fn fit(&mut self, vectors: &[FeatureVector]) -> Result<(), PipelineError> {
        require_training_data(vectors)?;

        let mut initial = vec![1.0f64; TRACE_SYMBOLS]; // Laplace prior
        let mut counts = vec![1.0f64; TRACE_SYMBOLS * TRACE_SYMBOLS];
        for vector in vectors {
            if let Some(&first) = vector.trace.first() {
                initial[first as usize] += 1.0;
            }
            for pair in vector.trace.windows(2) {
                counts[pair[0] as usize * TRACE_SYMBOLS + pair[1] as usize] += 1.0;
            }
        }

        let initial_total: f64 = initial.iter().sum();
        for p in &mut initial {
            *p /= initial_total;
        }
        let mut transitions = vec![0.0f64; TRACE_SYMBOLS * TRACE_SYMBOLS];
        for from in 0..TRACE_SYMBOLS {
            let row = &counts[from * TRACE_SYMBOLS..(from + 1) * TRACE_SYMBOLS];
            let total: f64 = row.iter().sum();
            for (to, &count) in row.iter().enumerate() {
                transitions[from * TRACE_SYMBOLS + to] = count / total;
            }
        }

        let params = SequenceParams { initial, transitions };
        let raw: Vec<f64> = vectors.iter().map(|v| params.raw_score(&v.trace)).collect();
        let normalizer = ScoreNormalizer::fit(&raw, self.normalization);

        self.version += 1;
        let meta = FittedMeta::new(self.version, FEATURE_SCHEMA_VERSION, normalizer);
        self.fitted = Some((meta, params));
        Ok(())
    }

    fn score(&self, vector: &FeatureVector) -> Result<ModelScore, PipelineError> {
        let (meta, params) = self.fitted.as_ref().ok_or_else(|| not_ready(SEQUENCE_MODEL_ID))?;
        meta.ensure_schema(SEQUENCE_MODEL_ID, vector)?;
        Ok(ModelScore {
            model_id: SEQUENCE_MODEL_ID.to_string(),
            score: meta.normalizer.normalize(params.raw_score(&vector.trace)),
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
        let (meta, params) = self.fitted.as_ref().ok_or_else(|| not_ready(SEQUENCE_MODEL_ID))?;
        Ok(ModelArtifact {
            model_id: SEQUENCE_MODEL_ID.to_string(),
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
    params: SequenceParams,
}
