//! Threshold calibration: a target false-positive quantile over recent
//! known-benign fused scores, published as an atomic snapshot. Readers never
//! see a torn value and in-flight verdicts are never rewritten.

use crate::config::CalibrationConfig;
use crate::error::PipelineError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::watch;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ThresholdSnapshot {
    /// No threshold published: every session passes through as no-alert and is
    /// logged as informational.
    Uncalibrated,
    Calibrated {
        threshold: f64,
        calibrated_at: DateTime<Utc>,
        samples: usize,
    },
}

impl ThresholdSnapshot {
    pub fn threshold(&self) -> Option<f64> {
        match self {
            ThresholdSnapshot::Uncalibrated => None,
            ThresholdSnapshot::Calibrated { threshold, .. } => Some(*threshold),
        }
    }

    pub fn is_calibrated(&self) -> bool {
        matches!(self, ThresholdSnapshot::Calibrated { .. })
    }
}

pub struct ThresholdCalibrator {
    config: CalibrationConfig,
    scores: Mutex<VecDeque<f64>>,
    tx: watch::Sender<ThresholdSnapshot>,
}

impl ThresholdCalibrator {
    pub fn new(config: CalibrationConfig) -> Self {
        let (tx, _rx) = watch::channel(ThresholdSnapshot::Uncalibrated);
        Self {
            config,
            scores: Mutex::new(VecDeque::new()),
            tx,
        }
    }

    /// Lock-free reader handle; `borrow()` yields the latest published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<ThresholdSnapshot> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> ThresholdSnapshot {
        self.tx.borrow().clone()
    }

    /// Feed one fused score into the rolling calibration buffer. Sessions with
    /// a training-time malicious label are excluded; unlabeled traffic is
    /// admitted, since labels are scarce in operation.
    pub fn observe(&self, fused_score: f64, labeled_malicious: bool) {
        if labeled_malicious || !fused_score.is_finite() {
            return;
        }
        let mut scores = self.scores.lock().expect("calibration buffer lock");
        scores.push_back(fused_score);
        while scores.len() > self.config.buffer_size.max(1) {
            scores.pop_front();
        }
    }

    pub fn sample_count(&self) -> usize {
        self.scores.lock().expect("calibration buffer lock").len()
    }

    /// Recompute the target quantile and atomically publish the new threshold.
    /// The previous snapshot stays visible to readers until the swap lands.
    pub fn recalibrate(&self) -> Result<f64, PipelineError> {
        let mut sorted: Vec<f64> = {
            let scores = self.scores.lock().expect("calibration buffer lock");
            scores.iter().copied().collect()
        };
        if sorted.len() < self.config.min_samples.max(1) {
            return Err(PipelineError::CalibrationUnavailable(format!(
                "{} of {} required benign samples",
                sorted.len(),
                self.config.min_samples
            )));
        }
        sorted.sort_by(|a, b| a.partial_cmp(b).expect("finite scores"));
        let threshold = quantile(&sorted, self.config.target_quantile);
        let samples = sorted.len();
        self.tx.send_replace(ThresholdSnapshot::Calibrated {
            threshold,
            calibrated_at: Utc::now(),
            samples,
        });
        Ok(threshold)
    }
}

/// Linear-interpolated quantile over a sorted slice.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let q = q.clamp(0.0, 1.0);
    let position = (sorted.len() - 1) as f64 * q;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    if lower == upper {
        sorted[lower]
    } else {
        let weight = position - lower as f64;
        sorted[lower] * (1.0 - weight) + sorted[upper] * weight
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CalibrationConfig;

    fn calibrator(min_samples: usize) -> ThresholdCalibrator {
        ThresholdCalibrator::new(CalibrationConfig {
            min_samples,
            ..CalibrationConfig::default()
        })
    }

    #[test]
    fn starts_uncalibrated() {
        let c = calibrator(4);
        assert!(c.current().threshold().is_none());
    }

    #[test]
    fn refuses_below_sample_floor() {
        let c = calibrator(4);
        c.observe(0.1, false);
        assert!(matches!(
            c.recalibrate(),
            Err(PipelineError::CalibrationUnavailable(_))
        ));
        assert!(!c.current().is_calibrated());
    }

    #[test]
    fn publishes_target_quantile() {
        let c = calibrator(4);
        for i in 1..=100 {
            c.observe(i as f64 / 100.0, false);
        }
        let threshold = c.recalibrate().unwrap();
        assert!((threshold - 0.9505).abs() < 1e-9);
        assert_eq!(c.current().threshold(), Some(threshold));
    }

    #[test]
    fn malicious_labels_are_excluded() {
        let c = calibrator(1);
        c.observe(0.2, false);
        c.observe(0.99, true);
        assert_eq!(c.sample_count(), 1);
    }

    #[test]
    fn readers_observe_published_values_only() {
        let c = calibrator(1);
        let rx = c.subscribe();
        assert!(rx.borrow().threshold().is_none());
        c.observe(0.5, false);
        let published = c.recalibrate().unwrap();
        assert_eq!(rx.borrow().threshold(), Some(published));
    }
}
