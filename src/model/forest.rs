//! Tree-partition unsupervised detector: random binary partition trees over
//! training subsamples; anomalies isolate in short paths.

use super::{
    decode_params, not_ready, require_training_data, AnomalyModel, FittedMeta, ModelArtifact,
    ModelHealth, ModelScore, ScoreNormalizer,
};
use crate::config::{ForestConfig, NormalizationMethod};
use crate::error::PipelineError;
use crate::features::{FeatureVector, FEATURE_COUNT, FEATURE_SCHEMA_VERSION};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

pub const FOREST_MODEL_ID: &str = "isolation_forest";

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Node {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    Leaf {
        size: usize,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Tree {
    nodes: Vec<Node>,
}

impl Tree {
    fn path_length(&self, values: &[f64]) -> f64 {
        let mut idx = 0usize;
        let mut depth = 0.0f64;
        loop {
            match &self.nodes[idx] {
                Node::Leaf { size } => return depth + average_path_length(*size),
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    idx = if values[*feature] < *threshold { *left } else { *right };
                    depth += 1.0;
                }
            }
        }
    }
}

/// Expected search path length in a binary tree over n points.
fn average_path_length(n: usize) -> f64 {
    const EULER_MASCHERONI: f64 = 0.577_215_664_901_532_9;
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_MASCHERONI) - 2.0 * (n - 1.0) / n
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ForestParams {
    trees: Vec<Tree>,
    sample_size: usize,
}

pub struct IsolationForestDetector {
    config: ForestConfig,
    normalization: NormalizationMethod,
    fitted: Option<(FittedMeta, ForestParams)>,
    version: u32,
}

impl IsolationForestDetector {
    pub fn new(config: ForestConfig, normalization: NormalizationMethod) -> Self {
        Self {
            config,
            normalization,
            fitted: None,
            version: 0,
        }
    }

    fn raw_score(params: &ForestParams, values: &[f64]) -> f64 {
        if params.trees.is_empty() {
            return 0.0;
        }
        let mean_path: f64 = params
            .trees
            .iter()
            .map(|t| t.path_length(values))
            .sum::<f64>()
            / params.trees.len() as f64;
        let c = average_path_length(params.sample_size).max(1.0);
        2f64.powf(-mean_path / c)
    }

    fn build_tree(
        rng: &mut StdRng,
        rows: &[&FeatureVector],
        indices: &[usize],
        max_depth: usize,
    ) -> Tree {
        let mut nodes = Vec::new();
        Self::grow(rng, rows, indices, 0, max_depth, &mut nodes);
        Tree { nodes }
    }

    fn grow(
        rng: &mut StdRng,
        rows: &[&FeatureVector],
        indices: &[usize],
        depth: usize,
        max_depth: usize,
        nodes: &mut Vec<Node>,
    ) -> usize {
        if indices.len() <= 1 || depth >= max_depth {
            nodes.push(Node::Leaf { size: indices.len() });
            return nodes.len() - 1;
        }

        // pick a feature that still varies inside this partition
        let mut feature = None;
        for _ in 0..FEATURE_COUNT {
            let candidate = rng.gen_range(0..FEATURE_COUNT);
            let (lo, hi) = indices.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |acc, &i| {
                let v = rows[i].values[candidate];
                (acc.0.min(v), acc.1.max(v))
            });
            if hi > lo {
                feature = Some((candidate, lo, hi));
                break;
            }
        }
        let Some((feature, lo, hi)) = feature else {
            nodes.push(Node::Leaf { size: indices.len() });
            return nodes.len() - 1;
        };

        let threshold = rng.gen_range(lo..hi);
        let left_idx: Vec<usize> = indices
            .iter()
            .copied()
            .filter(|&i| rows[i].values[feature] < threshold)
            .collect();
        let right_idx: Vec<usize> = indices
            .iter()
            .copied()
            .filter(|&i| rows[i].values[feature] >= threshold)
            .collect();
        if left_idx.is_empty() || right_idx.is_empty() {
            nodes.push(Node::Leaf { size: indices.len() });
            return nodes.len() - 1;
        }

        let slot = nodes.len();
        nodes.push(Node::Leaf { size: 0 }); // placeholder until children exist
        let left = Self::grow(rng, rows, &left_idx, depth + 1, max_depth, nodes);
        let right = Self::grow(rng, rows, &right_idx, depth + 1, max_depth, nodes);
        nodes[slot] = Node::Split {
            feature,
            threshold,
            left,
            right,
        };
        slot
    }
}

impl AnomalyModel for IsolationForestDetector {
    fn model_id(&self) -> &str {
        FOREST_MODEL_ID
    }

    fn fit(&mut self, vectors: &[FeatureVector]) -> Result<(), PipelineError> {
        require_training_data(vectors)?;
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let rows: Vec<&FeatureVector> = vectors.iter().collect();
        let sample_size = self.config.sample_size.clamp(2, rows.len().max(2));
        let max_depth = (sample_size as f64).log2().ceil() as usize;

        let mut trees = Vec::with_capacity(self.config.trees);
        for _ in 0..self.config.trees.max(1) {
            let indices: Vec<usize> = if rows.len() <= sample_size {
                (0..rows.len()).collect()
            } else {
                (0..sample_size).map(|_| rng.gen_range(0..rows.len())).collect()
            };
            trees.push(Self::build_tree(&mut rng, &rows, &indices, max_depth));
        }
        let params = ForestParams { trees, sample_size };

        let raw: Vec<f64> = vectors
            .iter()
            .map(|v| Self::raw_score(&params, &v.values))
            .collect();
        let normalizer = ScoreNormalizer::fit(&raw, self.normalization);

        self.version += 1;
        let meta = FittedMeta::new(self.version, FEATURE_SCHEMA_VERSION, normalizer);
        self.fitted = Some((meta, params));
        Ok(())
    }

    fn score(&self, vector: &FeatureVector) -> Result<ModelScore, PipelineError> {
        let (meta, params) = self.fitted.as_ref().ok_or_else(|| not_ready(FOREST_MODEL_ID))?;
        meta.ensure_schema(FOREST_MODEL_ID, vector)?;
        let raw = Self::raw_score(params, &vector.values);
        Ok(ModelScore {
            model_id: FOREST_MODEL_ID.to_string(),
            score: meta.normalizer.normalize(raw),
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
        let (meta, params) = self.fitted.as_ref().ok_or_else(|| not_ready(FOREST_MODEL_ID))?;
        Ok(ModelArtifact {
            model_id: FOREST_MODEL_ID.to_string(),
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
    params: ForestParams,
}
