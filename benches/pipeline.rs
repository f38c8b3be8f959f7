//! Hot-path benchmarks: events → feature extraction, and detector scoring +
//! ensemble fusion.

use chrono::{TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use purple_sentry::config::{FeatureConfig, ModelsConfig, NormalizationMethod};
use purple_sentry::ensemble::EnsembleScorer;
use purple_sentry::features::{FeatureEngine, UserBaselines};
use purple_sentry::model::{AnomalyModel, IsolationForestDetector, ReconstructionDetector};
use purple_sentry::normalizer::SessionEvent;
use purple_sentry::pipeline::batch_vectors;

fn make_events(session: &str, n: usize) -> Vec<SessionEvent> {
    (0..n)
        .map(|i| SessionEvent {
            event_id: format!("{session}-{i}"),
            timestamp: Utc.timestamp_opt(1_709_287_200 + i as i64 * 15, 0).unwrap(),
            session_id: session.to_string(),
            user_id: "bench".to_string(),
            source_ip: "10.0.0.5".to_string(),
            dest_ip: Some("10.0.0.9".to_string()),
            dest_port: Some(443 + (i % 5) as u16),
            action: if i % 7 == 0 { "exec_cmd" } else { "file_read" }.to_string(),
            resource: format!("/srv/data/{}", i % 11),
            status_code: Some(if i % 13 == 0 { 403 } else { 200 }),
            bytes_transferred: 100 + (i as u64 * 37) % 4000,
            attack_type: None,
            is_malicious: None,
        })
        .collect()
}

fn bench_feature_extraction(c: &mut Criterion) {
    let config = FeatureConfig::default();
    let events = make_events("bench", 200);

    c.bench_function("feature_extract_200_events", |b| {
        b.iter(|| {
            let mut engine = FeatureEngine::new(config.clone(), UserBaselines::new());
            for e in black_box(events.clone()) {
                engine.insert(e);
            }
            black_box(engine.close("bench"))
        })
    });
}

fn bench_scoring(c: &mut Criterion) {
    let config = FeatureConfig::default();
    let vectors: Vec<_> = (0..50)
        .flat_map(|s| batch_vectors(make_events(&format!("train-{s}"), 40), &config))
        .filter_map(|closed| closed.vector.ok())
        .collect();

    let mut forest = IsolationForestDetector::new(Default::default(), NormalizationMethod::MinMax);
    let mut reconstruction = ReconstructionDetector::new(NormalizationMethod::MinMax);
    forest.fit(&vectors).unwrap();
    reconstruction.fit(&vectors).unwrap();
    let scorer = EnsembleScorer::new(ModelsConfig::default());
    let target = vectors[0].clone();

    c.bench_function("forest_score", |b| {
        b.iter(|| black_box(forest.score(black_box(&target))))
    });

    c.bench_function("score_and_fuse", |b| {
        b.iter(|| {
            let scores = vec![
                forest.score(black_box(&target)).unwrap(),
                reconstruction.score(black_box(&target)).unwrap(),
            ];
            black_box(scorer.fuse(&scores))
        })
    });
}

criterion_group!(benches, bench_feature_extraction, bench_scoring);
criterion_main!(benches);
