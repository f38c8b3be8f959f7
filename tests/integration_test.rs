//! Integration tests: normalization and dedup, feature determinism, detector
//! contracts, scoring-round degradation, calibration gating, alert cool-down,
//! store round-trip, end-to-end pipeline run.

use chrono::{DateTime, TimeZone, Utc};
use purple_sentry::{
    calibrate::ThresholdCalibrator,
    config::{
        CalibrationConfig, DispatchConfig, FeatureConfig, ModelsConfig, NormalizationMethod,
        PipelineConfig,
    },
    dispatch::{AlertDispatcher, AlertSink, DispatchOutcome, Severity},
    ensemble::EnsembleScorer,
    error::PipelineError,
    features::{FeatureEngine, SessionMeta, UserBaselines, FEATURE_NAMES},
    model::{
        AnomalyModel, BoundaryDetector, IsolationForestDetector, ModelHealth, ModelRegistry,
        ModelScore, ReconstructionDetector, SequenceDetector,
    },
    normalizer::{parse_record, DedupWindow, SessionEvent},
    pipeline::{batch_vectors, score_vector, Pipeline},
    storage::{AlertStore, DeliveryStatus},
    Verdict,
};
use std::path::Path;
use std::sync::Arc;

fn event(session: &str, secs: i64, action: &str, resource: &str) -> SessionEvent {
    SessionEvent {
        event_id: format!("{session}-{secs}-{action}"),
        timestamp: Utc.timestamp_opt(1_709_287_200 + secs, 0).unwrap(),
        session_id: session.to_string(),
        user_id: "alice".to_string(),
        source_ip: "10.0.0.5".to_string(),
        dest_ip: Some("10.0.0.9".to_string()),
        dest_port: Some(443),
        action: action.to_string(),
        resource: resource.to_string(),
        status_code: Some(200),
        bytes_transferred: 100,
        attack_type: None,
        is_malicious: None,
    }
}

fn benign_training_vectors() -> Vec<purple_sentry::FeatureVector> {
    let mut events = Vec::new();
    for s in 0..20 {
        let session = format!("train-{s}");
        for i in 0..10 {
            let mut e = event(&session, s * 1000 + i * 30, "file_read", "/srv/data");
            e.bytes_transferred = 100 + (i as u64 * 7 + s as u64 * 13) % 400;
            e.dest_port = Some(443 + (i % 3) as u16);
            events.push(e);
        }
    }
    batch_vectors(events, &FeatureConfig::default())
        .into_iter()
        .filter_map(|c| c.vector.ok())
        .collect()
}

#[test]
fn config_load_default() {
    let config = PipelineConfig::load(Path::new("nonexistent.json")).unwrap();
    assert_eq!(config.calibration.target_quantile, 0.95);
    assert_eq!(config.dispatch.cooldown_secs, 600);
    assert_eq!(config.workers, 4);
}

#[test]
fn duplicates_and_reordering_yield_one_canonical_session() {
    let in_order = vec![
        event("s1", 0, "login", "/auth"),
        event("s1", 10, "file_read", "/etc/passwd"),
        event("s1", 20, "exec_cmd", "/bin/sh"),
        event("s1", 30, "file_read", "/srv/data"),
    ];
    let shuffled = vec![
        in_order[2].clone(),
        in_order[0].clone(),
        in_order[0].clone(), // duplicate
        in_order[3].clone(),
        in_order[1].clone(),
        in_order[2].clone(), // duplicate
    ];

    let config = FeatureConfig::default();
    let mut reference = FeatureEngine::new(config.clone(), UserBaselines::new());
    for e in in_order {
        reference.insert(e);
    }
    let reference = reference.close("s1").unwrap().vector.unwrap();

    let mut dedup = DedupWindow::new(64);
    let mut engine = FeatureEngine::new(config, UserBaselines::new());
    for e in shuffled {
        if dedup.admit(&e) {
            engine.insert(e);
        }
    }
    let replayed = engine.close("s1").unwrap().vector.unwrap();

    assert_eq!(reference.values, replayed.values);
    assert_eq!(reference.trace, replayed.trace);
}

#[test]
fn feature_vectors_are_bit_identical() {
    let events: Vec<SessionEvent> = (0..30)
        .map(|i| event("s1", i * 15, "file_read", &format!("/srv/{}", i % 5)))
        .collect();
    let config = FeatureConfig::default();

    let build = || {
        let mut engine = FeatureEngine::new(config.clone(), UserBaselines::new());
        for e in events.clone() {
            engine.insert(e);
        }
        engine.close("s1").unwrap().vector.unwrap()
    };
    let first = build();
    let second = build();
    assert_eq!(first.values.len(), FEATURE_NAMES.len());
    for (a, b) in first.values.iter().zip(second.values.iter()) {
        assert_eq!(a.to_bits(), b.to_bits());
    }
}

#[test]
fn zero_bytes_and_zero_ports_are_not_errors() {
    let mut e = event("s1", 0, "login", "/auth");
    e.bytes_transferred = 0;
    e.dest_port = None;
    e.dest_ip = None;
    let mut engine = FeatureEngine::new(FeatureConfig::default(), UserBaselines::new());
    engine.insert(e);
    let vector = engine.close("s1").unwrap().vector.unwrap();
    assert_eq!(vector.get("port_entropy"), Some(0.0));
    assert_eq!(vector.get("bytes_rate"), Some(0.0));
    assert_eq!(vector.get("internal_ratio"), Some(0.0));
}

#[test]
fn detectors_honor_the_capability_contract() {
    let vectors = benign_training_vectors();
    assert!(vectors.len() >= 10);

    let mut detectors: Vec<Box<dyn AnomalyModel>> = vec![
        Box::new(IsolationForestDetector::new(
            Default::default(),
            NormalizationMethod::MinMax,
        )),
        Box::new(ReconstructionDetector::new(NormalizationMethod::MinMax)),
        Box::new(BoundaryDetector::new(NormalizationMethod::Quantile)),
        Box::new(SequenceDetector::new(NormalizationMethod::MinMax)),
    ];

    for detector in detectors.iter_mut() {
        // unfitted scoring refuses
        assert!(matches!(
            detector.score(&vectors[0]),
            Err(PipelineError::ModelNotReady(_))
        ));
        let ModelHealth { fitted, version } = detector.health();
        assert!(!fitted);
        assert_eq!(version, 0);

        detector.fit(&vectors).unwrap();
        assert!(detector.health().fitted);
        assert_eq!(detector.health().version, 1);

        let score = detector.score(&vectors[0]).unwrap();
        assert!((0.0..=1.0).contains(&score.score));
        assert_eq!(score.version, 1);

        // schema drift refuses
        let mut drifted = vectors[0].clone();
        drifted.schema_version += 1;
        assert!(matches!(
            detector.score(&drifted),
            Err(PipelineError::SchemaMismatch { .. })
        ));
    }
}

#[test]
fn artifact_roundtrip_preserves_scores() {
    let vectors = benign_training_vectors();
    let mut original =
        IsolationForestDetector::new(Default::default(), NormalizationMethod::MinMax);
    original.fit(&vectors).unwrap();
    let artifact = original.artifact().unwrap();

    let mut restored =
        IsolationForestDetector::new(Default::default(), NormalizationMethod::MinMax);
    restored.restore(&artifact).unwrap();
    assert_eq!(restored.health().version, 1);

    for vector in vectors.iter().take(5) {
        let a = original.score(vector).unwrap().score;
        let b = restored.score(vector).unwrap().score;
        assert_eq!(a.to_bits(), b.to_bits());
    }
}

struct SlowModel;

impl AnomalyModel for SlowModel {
    fn model_id(&self) -> &str {
        "slow"
    }
    fn fit(&mut self, _: &[purple_sentry::FeatureVector]) -> Result<(), PipelineError> {
        Ok(())
    }
    fn score(&self, _: &purple_sentry::FeatureVector) -> Result<ModelScore, PipelineError> {
        std::thread::sleep(std::time::Duration::from_millis(500));
        Ok(ModelScore {
            model_id: "slow".to_string(),
            score: 0.5,
            version: 1,
        })
    }
    fn health(&self) -> ModelHealth {
        ModelHealth {
            fitted: true,
            version: 1,
        }
    }
    fn artifact(&self) -> Result<purple_sentry::model::ModelArtifact, PipelineError> {
        Err(PipelineError::ModelNotReady("slow".into()))
    }
    fn restore(&mut self, _: &purple_sentry::model::ModelArtifact) -> Result<(), PipelineError> {
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn timed_out_model_degrades_but_verdict_is_produced() {
    let vectors = benign_training_vectors();
    let mut fast = ReconstructionDetector::new(NormalizationMethod::MinMax);
    fast.fit(&vectors).unwrap();

    let models: Vec<Arc<dyn AnomalyModel>> = vec![Arc::new(fast), Arc::new(SlowModel)];
    let started = std::time::Instant::now();
    let (contributing, degraded) =
        score_vector(&models, &vectors[0], std::time::Duration::from_millis(50)).await;
    assert!(started.elapsed() < std::time::Duration::from_millis(450));
    assert_eq!(contributing.len(), 1);
    assert_eq!(degraded.len(), 1);
    assert_eq!(degraded[0].model_id, "slow");

    let scorer = EnsembleScorer::new(ModelsConfig::default());
    let verdict = scorer.verdict("s1", contributing, degraded, Some(0.99));
    assert!(verdict.is_degraded());
    assert!(!verdict.alert);
}

#[test]
fn uncalibrated_pipeline_never_alerts() {
    let calibrator = ThresholdCalibrator::new(CalibrationConfig::default());
    let snapshot = calibrator.current();
    let scorer = EnsembleScorer::new(ModelsConfig::default());
    let scores = vec![ModelScore {
        model_id: "m".to_string(),
        score: 1.0,
        version: 1,
    }];
    let verdict = scorer.verdict("s1", scores, Vec::new(), snapshot.threshold());
    assert!(!verdict.alert);
    assert_eq!(verdict.threshold, None);
}

fn verdict_at(scored_at: DateTime<Utc>, fused: f64) -> Verdict {
    Verdict {
        verdict_id: "v".to_string(),
        session_id: "s1".to_string(),
        scored_at,
        fused_score: fused,
        contributing: vec![ModelScore {
            model_id: "m".to_string(),
            score: fused,
            version: 1,
        }],
        degraded: Vec::new(),
        threshold: Some(0.5),
        alert: true,
        disagreement: false,
    }
}

fn meta() -> SessionMeta {
    SessionMeta {
        session_id: "s1".to_string(),
        user_id: "alice".to_string(),
        source_ip: "10.0.0.5".to_string(),
        labeled_malicious: false,
        events_total: 12,
    }
}

#[tokio::test]
async fn cooldown_suppresses_unless_severity_increases() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(AlertStore::open(&dir.path().join("alerts.db"), b"test").unwrap());
    let dispatcher = AlertDispatcher::new(DispatchConfig::default(), AlertSink::memory(), store);

    let t0 = Utc.timestamp_opt(1_709_287_200, 0).unwrap();
    let t5 = t0 + chrono::Duration::minutes(5);

    // medium severity at T
    let first = dispatcher.dispatch(&verdict_at(t0, 0.56), &meta()).await.unwrap();
    let DispatchOutcome::Delivered(alert) = first else {
        panic!("expected delivery");
    };
    assert_eq!(alert.severity, Severity::Medium);
    assert_eq!(alert.enrichment.user_id, "alice");

    // equal severity at T+5min: suppressed
    let second = dispatcher.dispatch(&verdict_at(t5, 0.57), &meta()).await.unwrap();
    assert!(matches!(second, DispatchOutcome::Suppressed));

    // severity increase at T+5min: re-dispatched, creation time preserved
    let third = dispatcher.dispatch(&verdict_at(t5, 0.70), &meta()).await.unwrap();
    let DispatchOutcome::Delivered(escalated) = third else {
        panic!("expected escalation delivery");
    };
    assert_eq!(escalated.severity, Severity::High);
    assert_eq!(escalated.created_at, alert.created_at);
    assert_eq!(dispatcher.sink().delivered().len(), 2);
}

#[tokio::test]
async fn exhausted_retries_persist_alert_as_undelivered() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(AlertStore::open(&dir.path().join("alerts.db"), b"test").unwrap());
    let config = DispatchConfig {
        retry_max_attempts: 2,
        retry_base_ms: 1,
        ..DispatchConfig::default()
    };
    let sink = AlertSink::memory();
    sink.set_failing(true);
    let dispatcher = AlertDispatcher::new(config, sink, store.clone());

    let t0 = Utc.timestamp_opt(1_709_287_200, 0).unwrap();
    let outcome = dispatcher.dispatch(&verdict_at(t0, 0.9), &meta()).await.unwrap();
    assert!(matches!(outcome, DispatchOutcome::Undelivered(_)));

    let pending = store.undelivered().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].session_id, "s1");
    assert_eq!(pending[0].status, DeliveryStatus::Undelivered);

    store.mark_delivered(&pending[0].alert_id).unwrap();
    assert!(store.undelivered().unwrap().is_empty());
}

#[test]
fn store_roundtrip_decrypts_payload() {
    let dir = tempfile::tempdir().unwrap();
    let store = AlertStore::open(&dir.path().join("alerts.db"), b"test-secret").unwrap();
    store
        .record("a1", "s1", 123, "high", DeliveryStatus::Undelivered, r#"{"x":1}"#)
        .unwrap();
    let rows = store.undelivered().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].payload, r#"{"x":1}"#);
    assert_eq!(rows[0].created_at_ms, 123);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pipeline_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(AlertStore::open(&dir.path().join("alerts.db"), b"test").unwrap());

    let vectors = benign_training_vectors();
    let mut forest =
        IsolationForestDetector::new(Default::default(), NormalizationMethod::MinMax);
    let mut reconstruction = ReconstructionDetector::new(NormalizationMethod::MinMax);
    forest.fit(&vectors).unwrap();
    reconstruction.fit(&vectors).unwrap();

    let registry = Arc::new(ModelRegistry::new());
    registry.publish(vec![Arc::new(forest), Arc::new(reconstruction)]);

    // threshold 0 at quantile 0: every verdict alerts
    let calibrator = Arc::new(ThresholdCalibrator::new(CalibrationConfig {
        target_quantile: 0.0,
        min_samples: 1,
        ..CalibrationConfig::default()
    }));
    calibrator.observe(0.0, false);
    calibrator.recalibrate().unwrap();

    let dispatcher = Arc::new(AlertDispatcher::new(
        DispatchConfig::default(),
        AlertSink::memory(),
        store,
    ));

    let config = PipelineConfig::default();
    let pipeline = Pipeline::spawn(&config, registry, calibrator, dispatcher.clone());

    for i in 0..20 {
        let line = format!(
            "{{\"timestamp\":{},\"session_id\":\"attack-1\",\"user_id\":\"mallory\",\"source_ip\":\"203.0.113.9\",\"action\":\"exec_cmd\",\"resource\":\"/bin/sh{}\",\"status_code\":200,\"bytes_transferred\":5000}}",
            1_709_287_200 + i, i
        );
        pipeline.ingest_line(&line).await;
    }
    // duplicate and malformed records
    pipeline
        .ingest_line("{\"timestamp\":1709287200,\"session_id\":\"attack-1\",\"action\":\"exec_cmd\",\"resource\":\"/bin/sh0\"}")
        .await;
    pipeline.ingest_line("not a record").await;
    pipeline
        .ingest_line("timestamp=1709287300 session_id=attack-1 action=logout")
        .await;

    let summary = pipeline.shutdown().await;
    assert_eq!(summary.malformed, 1);
    assert_eq!(summary.duplicates, 1);
    assert!(summary.sessions_closed >= 1);
    assert!(summary.verdicts >= 1);
    assert!(summary.alerts >= 1);
    assert!(!dispatcher.sink().delivered().is_empty());
}

#[test]
fn syslog_and_kv_records_normalize_like_json() {
    let json = parse_record(
        r#"{"timestamp":"2024-03-01T10:00:00Z","session_id":"s9","action":"login","resource":"/auth"}"#,
    )
    .unwrap();
    let syslog = parse_record(
        "2024-03-01T10:00:00Z lab01 redsim: session_id=s9 action=login resource=/auth",
    )
    .unwrap();
    let kv = parse_record("timestamp=1709287200 session_id=s9 action=login resource=/auth").unwrap();
    assert_eq!(json.content_hash(), syslog.content_hash());
    assert_eq!(json.content_hash(), kv.content_hash());
}

#[test]
fn replay_metrics_report() {
    let report = purple_sentry::metrics::evaluate([
        (true, true),
        (false, true),
        (true, false),
        (false, false),
    ]);
    assert_eq!(report.true_positives, 1);
    assert!((report.precision - 0.5).abs() < 1e-12);
    assert!((report.recall - 0.5).abs() < 1e-12);
}
