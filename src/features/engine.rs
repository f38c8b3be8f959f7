//! Feature engine: owns per-session window state and per-user time-of-day
//! baselines, and is the only producer of feature vectors.

use super::session::Session;
use super::FeatureVector;
use crate::config::FeatureConfig;
use crate::error::PipelineError;
use crate::normalizer::SessionEvent;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Circular-mean activity hour per user, learned from closed sessions.
#[derive(Default)]
pub struct UserBaselines {
    inner: Mutex<HashMap<String, (f64, f64, u64)>>,
}

impl UserBaselines {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn baseline_hour(&self, user_id: &str) -> Option<f64> {
        let map = self.inner.lock().expect("baselines lock");
        let (sin_sum, cos_sum, sessions) = map.get(user_id)?;
        if *sessions == 0 {
            return None;
        }
        let angle = sin_sum.atan2(*cos_sum);
        let hour = angle / std::f64::consts::TAU * 24.0;
        Some(if hour < 0.0 { hour + 24.0 } else { hour })
    }

    pub fn observe(&self, user_id: &str, hour: f64) {
        let angle = hour / 24.0 * std::f64::consts::TAU;
        let mut map = self.inner.lock().expect("baselines lock");
        let entry = map.entry(user_id.to_string()).or_insert((0.0, 0.0, 0));
        entry.0 += angle.sin();
        entry.1 += angle.cos();
        entry.2 += 1;
    }
}

/// Session metadata carried alongside the vector into scoring and enrichment.
#[derive(Debug, Clone)]
pub struct SessionMeta {
    pub session_id: String,
    pub user_id: String,
    pub source_ip: String,
    pub labeled_malicious: bool,
    pub events_total: u64,
}

pub struct ClosedSession {
    pub meta: SessionMeta,
    pub vector: Result<FeatureVector, PipelineError>,
}

pub struct FeatureEngine {
    config: FeatureConfig,
    sessions: HashMap<String, Session>,
    baselines: Arc<UserBaselines>,
}

impl FeatureEngine {
    pub fn new(config: FeatureConfig, baselines: Arc<UserBaselines>) -> Self {
        Self {
            config,
            sessions: HashMap::new(),
            baselines,
        }
    }

    pub fn open_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Append an event to its session's window, opening the session if absent.
    /// Returns true when the event's action terminates the session.
    pub fn insert(&mut self, event: SessionEvent) -> bool {
        let terminator = self
            .config
            .terminator_actions
            .iter()
            .any(|a| a.eq_ignore_ascii_case(&event.action));
        let session = self
            .sessions
            .entry(event.session_id.clone())
            .or_insert_with(|| Session::new(&event, self.config.window_events));
        session.insert(event);
        terminator
    }

    /// Close one session: build its vector against the user baseline, then fold
    /// the session's hours into that baseline for future sessions.
    pub fn close(&mut self, session_id: &str) -> Option<ClosedSession> {
        let session = self.sessions.remove(session_id)?;
        let baseline = self.baselines.baseline_hour(&session.user_id);
        let vector = session.build_vector(&self.config, baseline);
        if let Some(hour) = session.mean_hour() {
            self.baselines.observe(&session.user_id, hour);
        }
        Some(ClosedSession {
            meta: SessionMeta {
                session_id: session.session_id.clone(),
                user_id: session.user_id.clone(),
                source_ip: session.source_ip.clone(),
                labeled_malicious: session.labeled_malicious,
                events_total: session.events_total,
            },
            vector,
        })
    }

    /// Sessions idle past the configured timeout on the arrival clock.
    pub fn idle_session_ids(&self) -> Vec<String> {
        let timeout = Duration::from_secs(self.config.idle_timeout_secs.max(0) as u64);
        self.sessions
            .values()
            .filter(|s| s.last_touched.elapsed() >= timeout)
            .map(|s| s.session_id.clone())
            .collect()
    }

    /// Drain every open session (shutdown path): close early, flush partial
    /// vectors; callers score them normally.
    pub fn drain(&mut self) -> Vec<ClosedSession> {
        let ids: Vec<String> = self.sessions.keys().cloned().collect();
        ids.iter().filter_map(|id| self.close(id)).collect()
    }
}
