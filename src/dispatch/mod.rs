//! Alert dispatch: above-threshold verdicts become enriched alert documents,
//! deduplicated per session within a cool-down window, delivered with bounded
//! backoff, and persisted as undelivered when the sink stays down.

mod sink;

pub use sink::AlertSink;

use crate::config::DispatchConfig;
use crate::ensemble::Verdict;
use crate::error::PipelineError;
use crate::features::SessionMeta;
use crate::model::ModelScore;
use crate::storage::{AlertStore, DeliveryStatus};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    /// Band by score margin over the calibrated threshold.
    pub fn from_margin(fused_score: f64, threshold: f64, config: &DispatchConfig) -> Self {
        let margin = fused_score - threshold;
        if margin >= config.high_margin {
            Severity::High
        } else if margin >= config.medium_margin {
            Severity::Medium
        } else {
            Severity::Low
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertEnrichment {
    pub user_id: String,
    pub source_ip: String,
    /// Model ids ordered by contribution, strongest first
    pub top_models: Vec<String>,
}

/// The alert document delivered to the external sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub alert_id: String,
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub fused_score: f64,
    pub threshold: f64,
    pub contributing_models: Vec<ModelScore>,
    pub severity: Severity,
    pub enrichment: AlertEnrichment,
    pub disagreement: bool,
}

#[derive(Debug)]
pub enum DispatchOutcome {
    Delivered(Alert),
    /// Retries exhausted; persisted locally, never dropped
    Undelivered(Alert),
    /// Duplicate within the cool-down window without a severity increase
    Suppressed,
    /// Verdict did not cross threshold (or no threshold published)
    NotAlertable,
}

struct RecentAlert {
    created_at: DateTime<Utc>,
    last_dispatch: DateTime<Utc>,
    severity: Severity,
}

pub struct AlertDispatcher {
    config: DispatchConfig,
    sink: AlertSink,
    store: Arc<AlertStore>,
    recent: Mutex<HashMap<String, RecentAlert>>,
}

impl AlertDispatcher {
    pub fn new(config: DispatchConfig, sink: AlertSink, store: Arc<AlertStore>) -> Self {
        Self {
            config,
            sink,
            store,
            recent: Mutex::new(HashMap::new()),
        }
    }

    pub fn sink(&self) -> &AlertSink {
        &self.sink
    }

    /// Convert one verdict into an alert and deliver it. The verdict's own
    /// scoring time drives the cool-down clock, so replays stay deterministic.
    pub async fn dispatch(
        &self,
        verdict: &Verdict,
        meta: &SessionMeta,
    ) -> Result<DispatchOutcome, PipelineError> {
        let Some(threshold) = verdict.threshold.filter(|_| verdict.alert) else {
            return Ok(DispatchOutcome::NotAlertable);
        };
        let severity = Severity::from_margin(verdict.fused_score, threshold, &self.config);
        let now = verdict.scored_at;

        // cool-down dedup; severity increase re-opens the window
        let created_at = {
            let mut recent = self.recent.lock().expect("recent alerts lock");
            if recent.len() > 4096 {
                let cooldown = ChronoDuration::seconds(self.config.cooldown_secs);
                recent.retain(|_, entry| now - entry.last_dispatch < cooldown);
            }
            match recent.get_mut(&verdict.session_id) {
                Some(prev)
                    if now - prev.last_dispatch
                        < ChronoDuration::seconds(self.config.cooldown_secs) =>
                {
                    if severity <= prev.severity {
                        return Ok(DispatchOutcome::Suppressed);
                    }
                    prev.severity = severity;
                    prev.last_dispatch = now;
                    prev.created_at // escalation keeps the original creation time
                }
                _ => {
                    recent.insert(
                        verdict.session_id.clone(),
                        RecentAlert {
                            created_at: now,
                            last_dispatch: now,
                            severity,
                        },
                    );
                    now
                }
            }
        };

        let alert = Alert {
            alert_id: Uuid::new_v4().to_string(),
            session_id: verdict.session_id.clone(),
            created_at,
            fused_score: verdict.fused_score,
            threshold,
            contributing_models: verdict.contributing.clone(),
            severity,
            enrichment: AlertEnrichment {
                user_id: meta.user_id.clone(),
                source_ip: meta.source_ip.clone(),
                top_models: verdict
                    .top_models(2)
                    .into_iter()
                    .map(|s| s.model_id.clone())
                    .collect(),
            },
            disagreement: verdict.disagreement,
        };

        let payload = serde_json::to_string(&alert)
            .map_err(|e| PipelineError::DispatchFailure(e.to_string()))?;

        match self.deliver_with_backoff(&alert).await {
            Ok(()) => {
                self.store.record(
                    &alert.alert_id,
                    &alert.session_id,
                    alert.created_at.timestamp_millis(),
                    severity.as_str(),
                    DeliveryStatus::Delivered,
                    &payload,
                )?;
                info!(
                    alert_id = %alert.alert_id,
                    session_id = %alert.session_id,
                    score = alert.fused_score,
                    severity = severity.as_str(),
                    "alert dispatched"
                );
                Ok(DispatchOutcome::Delivered(alert))
            }
            Err(e) => {
                self.store.record(
                    &alert.alert_id,
                    &alert.session_id,
                    alert.created_at.timestamp_millis(),
                    severity.as_str(),
                    DeliveryStatus::Undelivered,
                    &payload,
                )?;
                warn!(
                    alert_id = %alert.alert_id,
                    session_id = %alert.session_id,
                    error = %e,
                    "alert undelivered after retries, persisted locally"
                );
                Ok(DispatchOutcome::Undelivered(alert))
            }
        }
    }

    async fn deliver_with_backoff(&self, alert: &Alert) -> Result<(), PipelineError> {
        let attempts = self.config.retry_max_attempts.max(1);
        let mut delay = Duration::from_millis(self.config.retry_base_ms.max(1));
        let mut last_err = String::new();
        for attempt in 1..=attempts {
            match self.sink.deliver(alert).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    last_err = e;
                    if attempt < attempts {
                        tokio::time::sleep(delay).await;
                        delay = (delay * 2).min(Duration::from_secs(30));
                    }
                }
            }
        }
        Err(PipelineError::DispatchFailure(last_err))
    }
}
