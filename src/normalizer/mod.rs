//! Event normalization: raw records (JSON, syslog-like, key=value) into the
//! canonical session event, with bounded-window deduplication.

use crate::error::PipelineError;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet, VecDeque};
use uuid::Uuid;

/// One observed action, immutable once normalized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub user_id: String,
    pub source_ip: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dest_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dest_port: Option<u16>,
    pub action: String,
    pub resource: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    pub bytes_transferred: u64,
    /// Training-time label; absent in live traffic
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attack_type: Option<String>,
    /// Training-time ground truth; absent in live traffic
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_malicious: Option<bool>,
}

impl SessionEvent {
    /// Content hash for deduplication: (session id, timestamp, action, resource).
    pub fn content_hash(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.session_id.as_bytes());
        hasher.update(self.timestamp.timestamp_millis().to_le_bytes());
        hasher.update(self.action.as_bytes());
        hasher.update(self.resource.as_bytes());
        hasher.finalize().into()
    }
}

/// Parse one raw record of any supported source format into a canonical event.
///
/// Required fields are timestamp, session id, and action; anything else is
/// defaulted. Out-of-range status codes are kept as `None` rather than failing
/// the whole record.
pub fn parse_record(raw: &str) -> Result<SessionEvent, PipelineError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(PipelineError::MalformedRecord("empty record".into()));
    }
    let fields = if trimmed.starts_with('{') {
        json_fields(trimmed)?
    } else {
        line_fields(trimmed)?
    };
    build_event(fields)
}

#[derive(Default)]
struct RawFields {
    timestamp: Option<DateTime<Utc>>,
    strings: HashMap<String, String>,
}

fn json_fields(raw: &str) -> Result<RawFields, PipelineError> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    let obj = value
        .as_object()
        .ok_or_else(|| PipelineError::MalformedRecord("not a JSON object".into()))?;

    let mut fields = RawFields::default();
    for (key, val) in obj {
        if key == "timestamp" {
            fields.timestamp = match val {
                serde_json::Value::String(s) => parse_timestamp(s),
                serde_json::Value::Number(n) => n.as_f64().and_then(epoch_to_utc),
                _ => None,
            };
            continue;
        }
        let text = match val {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Number(n) => n.to_string(),
            serde_json::Value::Bool(b) => b.to_string(),
            _ => continue,
        };
        fields.strings.insert(key.clone(), text);
    }
    Ok(fields)
}

/// Syslog-like lines (`<ts> <host> <tag>: k=v ...`) and bare `k=v` telemetry.
/// Tokens before the first pair are positional; the first one that parses as a
/// timestamp wins when no `timestamp=` pair is present.
fn line_fields(raw: &str) -> Result<RawFields, PipelineError> {
    let mut fields = RawFields::default();
    for token in raw.split_whitespace() {
        match token.split_once('=') {
            Some((key, value)) => {
                let value = value.trim_matches('"');
                if key == "timestamp" {
                    fields.timestamp = parse_timestamp(value);
                } else {
                    fields.strings.insert(key.to_string(), value.to_string());
                }
            }
            None => {
                if fields.timestamp.is_none() {
                    let positional = token.trim_end_matches(':');
                    if let Some(ts) = parse_timestamp(positional) {
                        fields.timestamp = Some(ts);
                    }
                }
            }
        }
    }
    if fields.strings.is_empty() {
        return Err(PipelineError::MalformedRecord("no key=value pairs".into()));
    }
    Ok(fields)
}

fn build_event(fields: RawFields) -> Result<SessionEvent, PipelineError> {
    let timestamp = fields
        .timestamp
        .ok_or_else(|| PipelineError::MalformedRecord("missing or unparsable timestamp".into()))?;
    let mut strings = fields.strings;
    let session_id = strings
        .remove("session_id")
        .filter(|s| !s.is_empty())
        .ok_or_else(|| PipelineError::MalformedRecord("missing session_id".into()))?;
    let action = strings
        .remove("action")
        .filter(|s| !s.is_empty())
        .ok_or_else(|| PipelineError::MalformedRecord("missing action".into()))?;

    let status_code = strings
        .remove("status_code")
        .and_then(|s| s.parse::<u16>().ok())
        .filter(|code| (100..600).contains(code));
    let bytes_transferred = strings
        .remove("bytes_transferred")
        .and_then(|s| s.parse::<f64>().ok())
        .map(|b| if b.is_finite() && b > 0.0 { b as u64 } else { 0 })
        .unwrap_or(0);
    let dest_port = strings.remove("dest_port").and_then(|s| s.parse::<u16>().ok());
    let is_malicious = strings
        .remove("is_malicious")
        .and_then(|s| s.parse::<bool>().ok());

    Ok(SessionEvent {
        event_id: Uuid::new_v4().to_string(),
        timestamp,
        session_id,
        user_id: strings.remove("user_id").unwrap_or_else(|| "unknown".into()),
        source_ip: strings.remove("source_ip").unwrap_or_else(|| "unknown".into()),
        dest_ip: strings.remove("dest_ip").or_else(|| strings.remove("destination_ip")),
        dest_port,
        action,
        resource: strings.remove("resource").unwrap_or_default(),
        status_code,
        bytes_transferred,
        attack_type: strings.remove("attack_type"),
        is_malicious,
    })
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    raw.parse::<f64>().ok().and_then(epoch_to_utc)
}

/// Epoch seconds or milliseconds; anything past ~2286 in seconds is millis.
fn epoch_to_utc(value: f64) -> Option<DateTime<Utc>> {
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    let millis = if value >= 1e12 { value } else { value * 1000.0 };
    Utc.timestamp_millis_opt(millis as i64).single()
}

/// Bounded window of recently seen content hashes. A repeated submission inside
/// the window is a no-op success, not an error.
pub struct DedupWindow {
    seen: HashSet<[u8; 32]>,
    order: VecDeque<[u8; 32]>,
    capacity: usize,
}

impl DedupWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Returns false when the event is a duplicate within the window.
    pub fn admit(&mut self, event: &SessionEvent) -> bool {
        let hash = event.content_hash();
        if !self.seen.insert(hash) {
            return false;
        }
        self.order.push_back(hash);
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_record_parses() {
        let raw = r#"{"timestamp":"2024-03-01T10:00:00Z","session_id":"s1","user_id":"alice","source_ip":"10.0.0.5","action":"login","resource":"/auth","status_code":200,"bytes_transferred":512}"#;
        let ev = parse_record(raw).unwrap();
        assert_eq!(ev.session_id, "s1");
        assert_eq!(ev.action, "login");
        assert_eq!(ev.status_code, Some(200));
        assert_eq!(ev.bytes_transferred, 512);
    }

    #[test]
    fn syslog_line_parses() {
        let raw = "2024-03-01T10:00:00Z lab01 redsim: session_id=s2 user_id=bob action=exec_cmd resource=/bin/sh";
        let ev = parse_record(raw).unwrap();
        assert_eq!(ev.session_id, "s2");
        assert_eq!(ev.user_id, "bob");
        assert_eq!(ev.timestamp.timestamp(), 1709287200);
    }

    #[test]
    fn kv_line_with_epoch_parses() {
        let raw = "timestamp=1709287200 session_id=s3 action=file_read resource=/etc/passwd";
        let ev = parse_record(raw).unwrap();
        assert_eq!(ev.timestamp.timestamp(), 1709287200);
        assert_eq!(ev.resource, "/etc/passwd");
    }

    #[test]
    fn missing_session_id_is_malformed() {
        let raw = r#"{"timestamp":"2024-03-01T10:00:00Z","action":"login"}"#;
        assert!(matches!(
            parse_record(raw),
            Err(PipelineError::MalformedRecord(_))
        ));
    }

    #[test]
    fn out_of_range_status_is_dropped_not_fatal() {
        let raw = r#"{"timestamp":"2024-03-01T10:00:00Z","session_id":"s1","action":"login","status_code":999}"#;
        let ev = parse_record(raw).unwrap();
        assert_eq!(ev.status_code, None);
    }

    #[test]
    fn dedup_window_suppresses_and_evicts() {
        let mut window = DedupWindow::new(2);
        let ev = parse_record(
            "timestamp=1709287200 session_id=s1 action=login resource=/auth",
        )
        .unwrap();
        assert!(window.admit(&ev));
        assert!(!window.admit(&ev));

        let other = parse_record(
            "timestamp=1709287201 session_id=s1 action=login resource=/auth",
        )
        .unwrap();
        let third = parse_record(
            "timestamp=1709287202 session_id=s1 action=login resource=/auth",
        )
        .unwrap();
        assert!(window.admit(&other));
        assert!(window.admit(&third));
        // first hash evicted, admitted again
        assert!(window.admit(&ev));
    }
}
