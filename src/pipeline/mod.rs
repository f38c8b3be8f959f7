//! Pipeline orchestration: sessions are partitioned by id hash across a
//! worker pool, so exactly one worker mutates any session's buffer. Scoring
//! fans out across the registered models with a per-model timeout; a slow or
//! failing model degrades the verdict, never blocks it.

use crate::calibrate::{ThresholdCalibrator, ThresholdSnapshot};
use crate::config::{FeatureConfig, PipelineConfig};
use crate::dispatch::AlertDispatcher;
use crate::ensemble::{DegradedModel, EnsembleScorer, Verdict};
use crate::error::PipelineError;
use crate::features::{ClosedSession, FeatureEngine, FeatureVector, UserBaselines};
use crate::model::{AnomalyModel, ModelRegistry, ModelScore};
use crate::normalizer::{parse_record, DedupWindow, SessionEvent};
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Ingest counters, logged as the shutdown summary.
#[derive(Default)]
pub struct PipelineStats {
    pub events_seen: AtomicU64,
    pub malformed: AtomicU64,
    pub duplicates: AtomicU64,
    pub sessions_closed: AtomicU64,
    pub verdicts: AtomicU64,
    pub alerts: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSummary {
    pub events_seen: u64,
    pub malformed: u64,
    pub duplicates: u64,
    pub sessions_closed: u64,
    pub verdicts: u64,
    pub alerts: u64,
}

impl PipelineStats {
    pub fn summary(&self) -> StatsSummary {
        StatsSummary {
            events_seen: self.events_seen.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            sessions_closed: self.sessions_closed.load(Ordering::Relaxed),
            verdicts: self.verdicts.load(Ordering::Relaxed),
            alerts: self.alerts.load(Ordering::Relaxed),
        }
    }
}

/// Score one vector through every registered model in parallel. Each model
/// gets its own timeout window; timeouts and per-model errors are collected
/// as degraded entries instead of failing the round.
pub async fn score_vector(
    models: &[Arc<dyn AnomalyModel>],
    vector: &FeatureVector,
    timeout: Duration,
) -> (Vec<ModelScore>, Vec<DegradedModel>) {
    let mut handles: Vec<(String, JoinHandle<Result<ModelScore, String>>)> =
        Vec::with_capacity(models.len());
    for model in models {
        let model = model.clone();
        let model_id = model.model_id().to_string();
        let fv = vector.clone();
        let id_for_task = model_id.clone();
        let handle = tokio::spawn(async move {
            let inner = tokio::task::spawn_blocking(move || model.score(&fv));
            match tokio::time::timeout(timeout, inner).await {
                Ok(Ok(result)) => result.map_err(|e| e.to_string()),
                Ok(Err(join_err)) => Err(format!("scoring task failed: {join_err}")),
                Err(_) => Err(PipelineError::ModelTimeout(id_for_task).to_string()),
            }
        });
        handles.push((model_id, handle));
    }

    let mut contributing = Vec::new();
    let mut degraded = Vec::new();
    for (model_id, handle) in handles {
        match handle.await {
            Ok(Ok(score)) => contributing.push(score),
            Ok(Err(reason)) => {
                debug!(model_id = %model_id, reason = %reason, "model excluded from round");
                degraded.push(DegradedModel { model_id, reason });
            }
            Err(join_err) => degraded.push(DegradedModel {
                model_id,
                reason: join_err.to_string(),
            }),
        }
    }
    (contributing, degraded)
}

/// Offline helper: run a batch of events through a fresh feature engine and
/// return every session closed at end of input. Used to fit detectors from a
/// baseline replay; the live path goes through the worker pool instead.
pub fn batch_vectors(events: Vec<SessionEvent>, config: &FeatureConfig) -> Vec<ClosedSession> {
    let mut engine = FeatureEngine::new(config.clone(), UserBaselines::new());
    for event in events {
        engine.insert(event);
    }
    engine.drain()
}

pub struct Pipeline {
    senders: Vec<mpsc::Sender<SessionEvent>>,
    handles: Vec<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
    stats: Arc<PipelineStats>,
}

impl Pipeline {
    /// Spawn the worker pool. Session affinity is by id hash, so the same
    /// session always lands on the same worker.
    pub fn spawn(
        config: &PipelineConfig,
        registry: Arc<ModelRegistry>,
        calibrator: Arc<ThresholdCalibrator>,
        dispatcher: Arc<AlertDispatcher>,
    ) -> Self {
        let workers = config.workers.max(1);
        let (shutdown_tx, _) = watch::channel(false);
        let stats = Arc::new(PipelineStats::default());
        let baselines = UserBaselines::new();

        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let (tx, rx) = mpsc::channel::<SessionEvent>(1024);
            let worker = Worker {
                worker_id,
                engine: FeatureEngine::new(config.features.clone(), baselines.clone()),
                dedup: DedupWindow::new(config.normalizer.dedup_window),
                scorer: EnsembleScorer::new(config.models.clone()),
                score_timeout: Duration::from_millis(config.models.score_timeout_ms.max(1)),
                registry: registry.clone(),
                threshold_rx: calibrator.subscribe(),
                calibrator: calibrator.clone(),
                dispatcher: dispatcher.clone(),
                stats: stats.clone(),
            };
            handles.push(tokio::spawn(worker.run(rx, shutdown_tx.subscribe())));
            senders.push(tx);
        }

        Self {
            senders,
            handles,
            shutdown_tx,
            stats,
        }
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    /// Normalize one raw record and route it to its session's worker.
    /// Malformed records are counted and dropped; the stream continues.
    pub async fn ingest_line(&self, raw: &str) {
        if raw.trim().is_empty() {
            return;
        }
        self.stats.events_seen.fetch_add(1, Ordering::Relaxed);
        match parse_record(raw) {
            Ok(event) => {
                let idx = partition(&event.session_id, self.senders.len());
                if self.senders[idx].send(event).await.is_err() {
                    warn!(worker = idx, "worker channel closed, event dropped");
                }
            }
            Err(e) => {
                self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "dropped malformed record");
            }
        }
    }

    /// Drain: close every in-flight session early, flush partial vectors and
    /// score them normally, then stop the workers.
    pub async fn shutdown(self) -> StatsSummary {
        let _ = self.shutdown_tx.send(true);
        drop(self.senders);
        for handle in self.handles {
            let _ = handle.await;
        }
        let summary = self.stats.summary();
        info!(
            events = summary.events_seen,
            malformed = summary.malformed,
            duplicates = summary.duplicates,
            sessions = summary.sessions_closed,
            verdicts = summary.verdicts,
            alerts = summary.alerts,
            "pipeline stopped"
        );
        summary
    }
}

fn partition(session_id: &str, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    session_id.hash(&mut hasher);
    (hasher.finish() % workers.max(1) as u64) as usize
}

struct Worker {
    worker_id: usize,
    engine: FeatureEngine,
    dedup: DedupWindow,
    scorer: EnsembleScorer,
    score_timeout: Duration,
    registry: Arc<ModelRegistry>,
    threshold_rx: watch::Receiver<ThresholdSnapshot>,
    calibrator: Arc<ThresholdCalibrator>,
    dispatcher: Arc<AlertDispatcher>,
    stats: Arc<PipelineStats>,
}

impl Worker {
    async fn run(
        mut self,
        mut rx: mpsc::Receiver<SessionEvent>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut sweep = tokio::time::interval(Duration::from_secs(5));
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                _ = sweep.tick() => self.sweep_idle().await,
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        // consume anything still buffered on the channel before draining
        while let Ok(event) = rx.try_recv() {
            self.handle_event(event).await;
        }

        // drain in-flight sessions rather than discarding their state
        let closed = self.engine.drain();
        if !closed.is_empty() {
            info!(worker = self.worker_id, sessions = closed.len(), "draining open sessions");
        }
        for session in closed {
            self.score_closed(session).await;
        }
    }

    async fn handle_event(&mut self, event: SessionEvent) {
        if !self.dedup.admit(&event) {
            self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let session_id = event.session_id.clone();
        let terminated = self.engine.insert(event);
        if terminated {
            if let Some(closed) = self.engine.close(&session_id) {
                self.score_closed(closed).await;
            }
        }
    }

    async fn sweep_idle(&mut self) {
        for session_id in self.engine.idle_session_ids() {
            if let Some(closed) = self.engine.close(&session_id) {
                debug!(session_id = %closed.meta.session_id, "session closed on idle timeout");
                self.score_closed(closed).await;
            }
        }
    }

    async fn score_closed(&mut self, closed: ClosedSession) {
        self.stats.sessions_closed.fetch_add(1, Ordering::Relaxed);
        let vector = match closed.vector {
            Ok(vector) => vector,
            Err(e) => {
                info!(session_id = %closed.meta.session_id, error = %e, "no verdict for session");
                return;
            }
        };

        let models = self.registry.snapshot();
        let (contributing, degraded) =
            score_vector(&models, &vector, self.score_timeout).await;

        let snapshot = self.threshold_rx.borrow().clone();
        let verdict = self.scorer.verdict(
            &closed.meta.session_id,
            contributing,
            degraded,
            snapshot.threshold(),
        );
        self.stats.verdicts.fetch_add(1, Ordering::Relaxed);
        self.calibrator
            .observe(verdict.fused_score, closed.meta.labeled_malicious);
        self.log_verdict(&verdict, snapshot.is_calibrated());

        if verdict.alert {
            self.stats.alerts.fetch_add(1, Ordering::Relaxed);
        }
        if let Err(e) = self.dispatcher.dispatch(&verdict, &closed.meta).await {
            warn!(session_id = %verdict.session_id, error = %e, "dispatch error");
        }
    }

    fn log_verdict(&self, verdict: &Verdict, calibrated: bool) {
        if !calibrated {
            info!(
                session_id = %verdict.session_id,
                score = verdict.fused_score,
                "observe-only verdict (uncalibrated)"
            );
        } else if verdict.alert || verdict.disagreement || verdict.is_degraded() {
            info!(
                session_id = %verdict.session_id,
                score = verdict.fused_score,
                alert = verdict.alert,
                disagreement = verdict.disagreement,
                degraded = verdict.degraded.len(),
                "verdict"
            );
        } else {
            debug!(session_id = %verdict.session_id, score = verdict.fused_score, "verdict");
        }
    }
}
