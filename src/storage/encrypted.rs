//! SQLite-backed alert store with AES-GCM encryption of the alert payload
//! column. Undelivered alerts land here after retry exhaustion instead of
//! being dropped; delivered alerts are recorded for the audit trail.
//! Key derived from a deployment secret (in production: KMS / Keystore).

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::RngCore;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;

use crate::error::PipelineError;

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

fn derive_key(seed: &[u8]) -> [u8; KEY_LEN] {
    use ring::digest;
    let mut out = [0u8; KEY_LEN];
    let h = digest::digest(&digest::SHA256, seed);
    out[..h.as_ref().len().min(KEY_LEN)].copy_from_slice(h.as_ref());
    out
}

fn encrypt(key: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<String, PipelineError> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| PipelineError::Storage(format!("cipher init: {e}")))?;
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt((&nonce).into(), plaintext)
        .map_err(|_| PipelineError::Storage("payload encryption failed".into()))?;
    let mut out = nonce.to_vec();
    out.extend(ciphertext);
    Ok(BASE64.encode(&out))
}

fn decrypt(key: &[u8; KEY_LEN], encoded: &str) -> Result<Vec<u8>, PipelineError> {
    let raw = BASE64
        .decode(encoded)
        .map_err(|e| PipelineError::Storage(format!("payload decode: {e}")))?;
    if raw.len() < NONCE_LEN {
        return Err(PipelineError::Storage("payload too short".into()));
    }
    let (nonce, ct) = raw.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| PipelineError::Storage(format!("cipher init: {e}")))?;
    cipher
        .decrypt(nonce.into(), ct)
        .map_err(|_| PipelineError::Storage("payload decryption failed".into()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Delivered,
    Undelivered,
}

impl DeliveryStatus {
    fn as_str(self) -> &'static str {
        match self {
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Undelivered => "undelivered",
        }
    }

    fn parse(raw: &str) -> Result<Self, PipelineError> {
        match raw {
            "delivered" => Ok(DeliveryStatus::Delivered),
            "undelivered" => Ok(DeliveryStatus::Undelivered),
            other => Err(PipelineError::Storage(format!("unknown status {other}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoredAlert {
    pub alert_id: String,
    pub session_id: String,
    pub created_at_ms: i64,
    pub severity: String,
    pub status: DeliveryStatus,
    /// Decrypted alert document (JSON)
    pub payload: String,
}

pub struct AlertStore {
    conn: Mutex<Connection>,
    key: [u8; KEY_LEN],
}

impl AlertStore {
    /// Open or create DB at path. Key is derived from `secret`.
    pub fn open(path: &Path, secret: &[u8]) -> Result<Self, PipelineError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS alerts (
                alert_id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                severity TEXT NOT NULL,
                status TEXT NOT NULL,
                payload_enc TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_alerts_status ON alerts(status);
            CREATE INDEX IF NOT EXISTS idx_alerts_created ON alerts(created_at);
            "#,
        )?;
        let key = derive_key(secret);
        Ok(Self {
            conn: Mutex::new(conn),
            key,
        })
    }

    /// Record an alert with its delivery outcome (payload stored encrypted).
    pub fn record(
        &self,
        alert_id: &str,
        session_id: &str,
        created_at_ms: i64,
        severity: &str,
        status: DeliveryStatus,
        payload_json: &str,
    ) -> Result<(), PipelineError> {
        let enc = encrypt(&self.key, payload_json.as_bytes())?;
        self.conn.lock().expect("store lock").execute(
            "INSERT OR REPLACE INTO alerts (alert_id, session_id, created_at, severity, status, payload_enc)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![alert_id, session_id, created_at_ms, severity, status.as_str(), enc],
        )?;
        Ok(())
    }

    /// Undelivered alerts, oldest first, for redelivery or inspection.
    pub fn undelivered(&self) -> Result<Vec<StoredAlert>, PipelineError> {
        self.by_status(DeliveryStatus::Undelivered)
    }

    fn by_status(&self, status: DeliveryStatus) -> Result<Vec<StoredAlert>, PipelineError> {
        let conn = self.conn.lock().expect("store lock");
        let mut stmt = conn.prepare(
            "SELECT alert_id, session_id, created_at, severity, status, payload_enc
             FROM alerts WHERE status = ?1 ORDER BY created_at ASC",
        )?;
        let mut rows = stmt.query(params![status.as_str()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let enc: String = row.get(5)?;
            let plain = decrypt(&self.key, &enc)?;
            out.push(StoredAlert {
                alert_id: row.get(0)?,
                session_id: row.get(1)?,
                created_at_ms: row.get(2)?,
                severity: row.get(3)?,
                status: DeliveryStatus::parse(&row.get::<_, String>(4)?)?,
                payload: String::from_utf8(plain)
                    .map_err(|e| PipelineError::Storage(e.to_string()))?,
            });
        }
        Ok(out)
    }

    /// Flip an alert to delivered after a successful redelivery.
    pub fn mark_delivered(&self, alert_id: &str) -> Result<(), PipelineError> {
        self.conn.lock().expect("store lock").execute(
            "UPDATE alerts SET status = 'delivered' WHERE alert_id = ?1",
            params![alert_id],
        )?;
        Ok(())
    }

    /// Retention: delete alerts created before the given timestamp.
    pub fn prune_before(&self, created_at_ms: i64) -> Result<u64, PipelineError> {
        let n = self.conn.lock().expect("store lock").execute(
            "DELETE FROM alerts WHERE created_at < ?1",
            params![created_at_ms],
        )?;
        Ok(n as u64)
    }
}
