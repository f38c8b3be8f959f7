//! Pipeline configuration. One JSON file, nested sections, defaults for everything.

use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Data directory (alert store, model artifacts)
    pub data_dir: PathBuf,
    /// NDJSON input file; stdin when unset
    pub input: Option<PathBuf>,
    /// Labeled baseline replay used to fit detectors when no artifacts exist
    pub baseline: Option<PathBuf>,
    /// Normalizer parameters
    pub normalizer: NormalizerConfig,
    /// Feature extraction parameters
    pub features: FeatureConfig,
    /// Model registry / scoring parameters
    pub models: ModelsConfig,
    /// Threshold calibration parameters
    pub calibration: CalibrationConfig,
    /// Alert dispatch parameters
    pub dispatch: DispatchConfig,
    /// Worker pool size (sessions are partitioned by id hash)
    pub workers: usize,
    /// Logging
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizerConfig {
    /// Recent-record dedup window capacity (content hashes)
    pub dedup_window: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureConfig {
    /// Trailing window capacity per session (events)
    pub window_events: usize,
    /// Burst sub-window length (seconds)
    pub burst_window_secs: i64,
    /// Events within one burst sub-window that set the burst flag
    pub burst_events: usize,
    /// Session idle timeout before closure (seconds)
    pub idle_timeout_secs: i64,
    /// Actions that close a session explicitly
    pub terminator_actions: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FusionMode {
    WeightedAverage,
    Max,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormalizationMethod {
    MinMax,
    Quantile,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    /// Per-model fusion weights; models not listed get weight 1.0
    pub weights: HashMap<String, f64>,
    pub fusion: FusionMode,
    /// Score variance above this marks the verdict as disagreement
    pub disagreement_threshold: f64,
    /// Per-model scoring timeout (milliseconds)
    pub score_timeout_ms: u64,
    /// Score normalization fitted on the training distribution
    pub normalization: NormalizationMethod,
    pub forest: ForestConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForestConfig {
    pub trees: usize,
    pub sample_size: usize,
    pub seed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationConfig {
    /// Target false-positive quantile over known-benign fused scores
    pub target_quantile: f64,
    /// Minimum buffered samples before the first calibration
    pub min_samples: usize,
    /// Scheduled recalibration interval (seconds); 0 disables the schedule
    pub interval_secs: u64,
    /// Rolling score buffer capacity
    pub buffer_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Sink endpoint; alerts are logged only when unset
    pub sink_url: Option<String>,
    /// No duplicate alert for the same session within this window unless severity rose
    pub cooldown_secs: i64,
    /// Score margin over threshold for medium severity
    pub medium_margin: f64,
    /// Score margin over threshold for high severity
    pub high_margin: f64,
    pub retry_max_attempts: u32,
    pub retry_base_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".sentry"),
            input: None,
            baseline: None,
            normalizer: NormalizerConfig::default(),
            features: FeatureConfig::default(),
            models: ModelsConfig::default(),
            calibration: CalibrationConfig::default(),
            dispatch: DispatchConfig::default(),
            workers: 4,
            log: LogConfig::default(),
        }
    }
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self { dedup_window: 4096 }
    }
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            window_events: 512,
            burst_window_secs: 60,
            burst_events: 10,
            idle_timeout_secs: 900,
            terminator_actions: vec!["logout".to_string(), "session_end".to_string()],
        }
    }
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            weights: HashMap::new(),
            fusion: FusionMode::WeightedAverage,
            disagreement_threshold: 0.3,
            score_timeout_ms: 500,
            normalization: NormalizationMethod::MinMax,
            forest: ForestConfig::default(),
        }
    }
}

impl Default for ForestConfig {
    fn default() -> Self {
        Self {
            trees: 100,
            sample_size: 256,
            seed: 42,
        }
    }
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            target_quantile: 0.95,
            min_samples: 32,
            interval_secs: 300,
            buffer_size: 10_000,
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            sink_url: None,
            cooldown_secs: 600,
            medium_margin: 0.05,
            high_margin: 0.15,
            retry_max_attempts: 5,
            retry_base_ms: 200,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
        }
    }
}

impl PipelineConfig {
    /// Load from JSON file. Missing file falls back to defaults; an unparsable
    /// file is fatal so a bad deployment never runs with silently-wrong settings.
    pub fn load(path: &std::path::Path) -> Result<Self, PipelineError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(path)
            .map_err(|e| PipelineError::Config(format!("{}: {}", path.display(), e)))?;
        let mut config: PipelineConfig = serde_json::from_str(&data)
            .map_err(|e| PipelineError::Config(format!("{}: {}", path.display(), e)))?;
        if config.workers == 0 {
            config.workers = 4;
        }
        Ok(config)
    }
}
