//! Ensemble scoring: fuse per-model scores into one verdict, flag strong
//! model disagreement, and consult (never mutate) the published threshold.

use crate::config::{FusionMode, ModelsConfig};
use crate::model::ModelScore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A model excluded from one scoring round, with the reason recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DegradedModel {
    pub model_id: String,
    pub reason: String,
}

/// Scoring outcome for one session at one evaluation time. Immutable;
/// re-scoring produces a new verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub verdict_id: String,
    pub session_id: String,
    pub scored_at: DateTime<Utc>,
    pub fused_score: f64,
    pub contributing: Vec<ModelScore>,
    pub degraded: Vec<DegradedModel>,
    /// Threshold consulted at score time; absent while uncalibrated
    pub threshold: Option<f64>,
    pub alert: bool,
    pub disagreement: bool,
}

impl Verdict {
    pub fn is_degraded(&self) -> bool {
        !self.degraded.is_empty()
    }

    /// Contributing models ordered by score, highest first.
    pub fn top_models(&self, n: usize) -> Vec<&ModelScore> {
        let mut sorted: Vec<&ModelScore> = self.contributing.iter().collect();
        sorted.sort_by(|a, b| b.score.partial_cmp(&a.score).expect("finite scores"));
        sorted.truncate(n);
        sorted
    }
}

pub struct EnsembleScorer {
    config: ModelsConfig,
}

impl EnsembleScorer {
    pub fn new(config: ModelsConfig) -> Self {
        Self { config }
    }

    fn weight_for(&self, model_id: &str) -> f64 {
        self.config.weights.get(model_id).copied().unwrap_or(1.0)
    }

    /// Fused score for a set of contributing model scores. Deterministic for a
    /// fixed input set, weights, and fusion mode.
    pub fn fuse(&self, scores: &[ModelScore]) -> f64 {
        if scores.is_empty() {
            return 0.0;
        }
        match self.config.fusion {
            FusionMode::WeightedAverage => {
                let mut weighted = 0.0;
                let mut total = 0.0;
                for s in scores {
                    let w = self.weight_for(&s.model_id);
                    weighted += s.score * w;
                    total += w;
                }
                if total > 0.0 {
                    weighted / total
                } else {
                    0.0
                }
            }
            FusionMode::Max => scores
                .iter()
                .map(|s| s.score)
                .fold(f64::NEG_INFINITY, f64::max),
        }
    }

    /// Spread (standard deviation) of contributing scores. Above the configured
    /// threshold the verdict is flagged for analyst escalation instead of being
    /// silently averaged away.
    fn disagreement(&self, scores: &[ModelScore]) -> bool {
        if scores.len() < 2 {
            return false;
        }
        let mean = scores.iter().map(|s| s.score).sum::<f64>() / scores.len() as f64;
        let variance = scores
            .iter()
            .map(|s| (s.score - mean) * (s.score - mean))
            .sum::<f64>()
            / scores.len() as f64;
        variance.sqrt() > self.config.disagreement_threshold
    }

    /// Build the verdict for one scoring round. `threshold` is the calibrated
    /// snapshot consulted at score time; while uncalibrated every session
    /// passes through as no-alert.
    pub fn verdict(
        &self,
        session_id: &str,
        contributing: Vec<ModelScore>,
        degraded: Vec<DegradedModel>,
        threshold: Option<f64>,
    ) -> Verdict {
        let fused_score = self.fuse(&contributing);
        let disagreement = self.disagreement(&contributing);
        let alert = matches!(threshold, Some(t) if fused_score >= t);
        Verdict {
            verdict_id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            scored_at: Utc::now(),
            fused_score,
            contributing,
            degraded,
            threshold,
            alert,
            disagreement,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelsConfig;

    fn score(model_id: &str, score: f64) -> ModelScore {
        ModelScore {
            model_id: model_id.to_string(),
            score,
            version: 1,
        }
    }

    #[test]
    fn strong_disagreement_is_flagged() {
        let scorer = EnsembleScorer::new(ModelsConfig::default());
        let scores = vec![score("a", 0.9), score("b", 0.85), score("c", 0.1)];
        let verdict = scorer.verdict("s1", scores, Vec::new(), None);
        assert!(verdict.disagreement);
        assert!((verdict.fused_score - 0.6167).abs() < 1e-3);
        // uncalibrated: never an alert
        assert!(!verdict.alert);
    }

    #[test]
    fn agreement_is_not_flagged() {
        let scorer = EnsembleScorer::new(ModelsConfig::default());
        let scores = vec![score("a", 0.5), score("b", 0.55), score("c", 0.45)];
        let verdict = scorer.verdict("s1", scores, Vec::new(), Some(0.8));
        assert!(!verdict.disagreement);
        assert!(!verdict.alert);
    }

    #[test]
    fn fusion_is_idempotent() {
        let scorer = EnsembleScorer::new(ModelsConfig::default());
        let scores = vec![score("a", 0.31), score("b", 0.72)];
        let first = scorer.fuse(&scores);
        let second = scorer.fuse(&scores);
        assert_eq!(first.to_bits(), second.to_bits());
    }

    #[test]
    fn max_fusion_takes_peak_score() {
        let config = ModelsConfig {
            fusion: crate::config::FusionMode::Max,
            ..ModelsConfig::default()
        };
        let scorer = EnsembleScorer::new(config);
        let scores = vec![score("a", 0.2), score("b", 0.9)];
        assert_eq!(scorer.fuse(&scores), 0.9);
    }

    #[test]
    fn configured_weights_shift_fusion() {
        let mut config = ModelsConfig::default();
        config.weights.insert("a".to_string(), 3.0);
        let scorer = EnsembleScorer::new(config);
        let scores = vec![score("a", 1.0), score("b", 0.0)];
        assert!((scorer.fuse(&scores) - 0.75).abs() < 1e-12);
    }
}
