//! Purple Sentry entrypoint: restore or fit the detector ensemble, then stream
//! NDJSON telemetry from a file or stdin through the pipeline until EOF or
//! Ctrl+C, draining in-flight sessions on the way out.

use anyhow::{Context, Result};
use purple_sentry::{
    calibrate::ThresholdCalibrator,
    config::PipelineConfig,
    dispatch::{AlertDispatcher, AlertSink},
    ensemble::EnsembleScorer,
    error::PipelineError,
    features::FEATURE_SCHEMA_VERSION,
    logging::StructuredLogger,
    model::{
        AnomalyModel, BoundaryDetector, IsolationForestDetector, ModelArtifact, ModelRegistry,
        ReconstructionDetector, SequenceDetector,
    },
    normalizer::parse_record,
    pipeline::{batch_vectors, Pipeline},
    storage::AlertStore,
};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

fn build_detectors(config: &PipelineConfig) -> Vec<Box<dyn AnomalyModel>> {
    let norm = config.models.normalization;
    vec![
        Box::new(IsolationForestDetector::new(config.models.forest.clone(), norm)),
        Box::new(ReconstructionDetector::new(norm)),
        Box::new(BoundaryDetector::new(norm)),
        Box::new(SequenceDetector::new(norm)),
    ]
}

fn artifact_path(dir: &Path, model_id: &str) -> std::path::PathBuf {
    dir.join(format!("{model_id}.json"))
}

fn restore_detectors(detectors: &mut [Box<dyn AnomalyModel>], dir: &Path) {
    for detector in detectors.iter_mut() {
        let path = artifact_path(dir, detector.model_id());
        if !path.exists() {
            continue;
        }
        let loaded = std::fs::read_to_string(&path)
            .map_err(|e| PipelineError::Storage(e.to_string()))
            .and_then(|data| {
                let artifact: ModelArtifact = serde_json::from_str(&data)
                    .map_err(|e| PipelineError::Storage(e.to_string()))?;
                if artifact.schema_version != FEATURE_SCHEMA_VERSION {
                    return Err(PipelineError::SchemaMismatch {
                        model_id: artifact.model_id.clone(),
                        detail: format!(
                            "artifact schema v{}, engine emits v{}",
                            artifact.schema_version, FEATURE_SCHEMA_VERSION
                        ),
                    });
                }
                detector.restore(&artifact)
            });
        match loaded {
            Ok(()) => info!(model_id = detector.model_id(), "restored model artifact"),
            Err(e) => warn!(model_id = detector.model_id(), error = %e, "artifact ignored, model will be refitted"),
        }
    }
}

/// Fit every unfitted detector from the labeled baseline replay, persist the
/// artifacts, and seed the calibrator from the baseline's benign sessions.
fn fit_from_baseline(
    detectors: &mut [Box<dyn AnomalyModel>],
    config: &PipelineConfig,
    calibrator: &ThresholdCalibrator,
    artifact_dir: &Path,
    path: &Path,
) -> Result<()> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading baseline {}", path.display()))?;
    let mut events = Vec::new();
    for line in raw.lines().filter(|l| !l.trim().is_empty()) {
        match parse_record(line) {
            Ok(event) => events.push(event),
            Err(e) => warn!(error = %e, "skipped malformed baseline record"),
        }
    }
    let closed = batch_vectors(events, &config.features);
    let vectors: Vec<_> = closed
        .iter()
        .filter_map(|c| c.vector.as_ref().ok().cloned())
        .collect();
    info!(sessions = vectors.len(), "baseline sessions extracted");

    for detector in detectors.iter_mut() {
        if detector.health().fitted {
            continue;
        }
        detector
            .fit(&vectors)
            .with_context(|| format!("fitting {}", detector.model_id()))?;
        let artifact = detector
            .artifact()
            .with_context(|| format!("saving {}", detector.model_id()))?;
        let json = serde_json::to_string_pretty(&artifact)?;
        std::fs::write(artifact_path(artifact_dir, detector.model_id()), json)?;
        info!(model_id = detector.model_id(), "fitted and saved model");
    }

    // seed the threshold from the baseline's benign fused scores
    let scorer = EnsembleScorer::new(config.models.clone());
    for session in &closed {
        let Ok(vector) = &session.vector else { continue };
        let scores: Vec<_> = detectors
            .iter()
            .filter_map(|d| d.score(vector).ok())
            .collect();
        calibrator.observe(scorer.fuse(&scores), session.meta.labeled_malicious);
    }
    match calibrator.recalibrate() {
        Ok(threshold) => info!(threshold, "initial threshold calibrated from baseline"),
        Err(e) => warn!(error = %e, "starting uncalibrated (observe-only)"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::var("SENTRY_CONFIG_PATH")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| std::path::PathBuf::from("config.json"));
    let config = PipelineConfig::load(&config_path)?;

    StructuredLogger::init(config.log.json, &config.log.level);
    info!(data_dir = ?config.data_dir, "purple-sentry starting");

    std::fs::create_dir_all(&config.data_dir)?;
    let artifact_dir = config.data_dir.join("models");
    std::fs::create_dir_all(&artifact_dir)?;
    let store_path = config.data_dir.join("alerts.db");
    let secret = b"deployment-secret-placeholder"; // In production: from KMS / Keystore
    let store = Arc::new(AlertStore::open(&store_path, secret)?);

    let undelivered = store.undelivered()?;
    if !undelivered.is_empty() {
        warn!(count = undelivered.len(), "undelivered alerts pending in local store");
    }

    let calibrator = Arc::new(ThresholdCalibrator::new(config.calibration.clone()));

    let mut detectors = build_detectors(&config);
    restore_detectors(&mut detectors, &artifact_dir);
    let unfitted = detectors.iter().filter(|d| !d.health().fitted).count();
    if unfitted > 0 {
        match config.baseline.clone() {
            Some(path) => {
                fit_from_baseline(&mut detectors, &config, &calibrator, &artifact_dir, &path)?
            }
            None => {
                warn!(unfitted, "models unfitted and no baseline configured; verdicts will be degraded")
            }
        }
    }

    let registry = Arc::new(ModelRegistry::new());
    registry.publish(detectors.into_iter().map(Arc::from).collect());
    info!(models = registry.len(), "model registry published");

    let sink = match &config.dispatch.sink_url {
        Some(url) => AlertSink::http(url).map_err(PipelineError::DispatchFailure)?,
        None => AlertSink::Disabled,
    };
    let dispatcher = Arc::new(AlertDispatcher::new(config.dispatch.clone(), sink, store.clone()));

    let pipeline = Pipeline::spawn(&config, registry, calibrator.clone(), dispatcher);

    // scheduled recalibration
    let recalibrate_handle = if config.calibration.interval_secs > 0 {
        let calibrator = calibrator.clone();
        let interval = std::time::Duration::from_secs(config.calibration.interval_secs);
        Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            tick.tick().await; // immediate first tick
            loop {
                tick.tick().await;
                match calibrator.recalibrate() {
                    Ok(threshold) => info!(threshold, "threshold recalibrated"),
                    Err(e) => info!(reason = %e, "recalibration skipped"),
                }
            }
        }))
    } else {
        None
    };

    let ingest = async {
        match &config.input {
            Some(path) => {
                let file = tokio::fs::File::open(path)
                    .await
                    .with_context(|| format!("opening input {}", path.display()))?;
                let mut lines = BufReader::new(file).lines();
                while let Some(line) = lines.next_line().await? {
                    pipeline.ingest_line(&line).await;
                }
            }
            None => {
                let mut lines = BufReader::new(tokio::io::stdin()).lines();
                while let Some(line) = lines.next_line().await? {
                    pipeline.ingest_line(&line).await;
                }
            }
        }
        Ok::<(), anyhow::Error>(())
    };

    tokio::select! {
        result = ingest => {
            result?;
            info!("input exhausted");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    if let Some(handle) = recalibrate_handle {
        handle.abort();
    }
    pipeline.shutdown().await;
    info!("purple-sentry stopped");
    Ok(())
}
