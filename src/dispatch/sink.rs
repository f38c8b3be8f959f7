//! Alert delivery targets. The HTTP sink posts alert documents to the
//! configured SIEM/log-store endpoint; the memory sink backs tests; disabled
//! means log-only operation.

use super::Alert;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::info;

pub enum AlertSink {
    Http {
        client: reqwest::Client,
        url: String,
    },
    Memory {
        delivered: Mutex<Vec<Alert>>,
        failing: AtomicBool,
    },
    Disabled,
}

impl AlertSink {
    pub fn http(url: &str) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| e.to_string())?;
        Ok(AlertSink::Http {
            client,
            url: url.trim_end_matches('/').to_string(),
        })
    }

    pub fn memory() -> Self {
        AlertSink::Memory {
            delivered: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
        }
    }

    pub async fn deliver(&self, alert: &Alert) -> Result<(), String> {
        match self {
            AlertSink::Http { client, url } => {
                let res = client
                    .post(url)
                    .json(alert)
                    .send()
                    .await
                    .map_err(|e| e.to_string())?;
                if !res.status().is_success() {
                    let status = res.status();
                    let text = res.text().await.unwrap_or_default();
                    return Err(format!("{} {}", status, text));
                }
                Ok(())
            }
            AlertSink::Memory { delivered, failing } => {
                if failing.load(Ordering::Relaxed) {
                    return Err("sink unavailable".into());
                }
                delivered.lock().expect("sink lock").push(alert.clone());
                Ok(())
            }
            AlertSink::Disabled => {
                info!(alert_id = %alert.alert_id, session_id = %alert.session_id, "alert (no sink configured)");
                Ok(())
            }
        }
    }

    /// Test hook: make the memory sink refuse deliveries.
    pub fn set_failing(&self, value: bool) {
        if let AlertSink::Memory { failing, .. } = self {
            failing.store(value, Ordering::Relaxed);
        }
    }

    pub fn delivered(&self) -> Vec<Alert> {
        match self {
            AlertSink::Memory { delivered, .. } => delivered.lock().expect("sink lock").clone(),
            _ => Vec::new(),
        }
    }
}
