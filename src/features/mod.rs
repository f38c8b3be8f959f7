//! Session feature extraction: trailing-window accumulators over normalized
//! events, producing the fixed-schema vector the detectors score.

mod behavioral;
mod network;
mod session;
mod engine;

pub use behavioral::BehavioralAccum;
pub use network::NetworkAccum;
pub use session::{Session, DelayAccum};
pub use engine::{ClosedSession, FeatureEngine, SessionMeta, UserBaselines};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Feature names, frozen in scoring order. A model trained against one version
/// of this table refuses vectors from another.
pub const FEATURE_NAMES: [&str; 14] = [
    "failed_auth_count",
    "privilege_escalation_count",
    "unique_resources",
    "exec_burst_count",
    "error_rate",
    "unique_destinations",
    "bytes_rate",
    "port_entropy",
    "internal_ratio",
    "session_duration_secs",
    "inter_event_delay_mean",
    "inter_event_delay_std",
    "time_of_day_deviation",
    "burst_activity",
];

pub const FEATURE_COUNT: usize = FEATURE_NAMES.len();

/// Bumped whenever FEATURE_NAMES or any feature's semantics change.
pub const FEATURE_SCHEMA_VERSION: u32 = 1;

/// Number of distinct sub-window activity symbols in a vector's trace.
pub const TRACE_SYMBOLS: usize = 5;

/// Deterministic numeric summary of one session window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeatureVector {
    pub session_id: String,
    /// Timestamp of the newest event in the window; vectors are a pure
    /// function of events + configuration, so no wall clock appears here.
    pub as_of: DateTime<Utc>,
    pub schema_version: u32,
    /// Values in FEATURE_NAMES order.
    pub values: Vec<f64>,
    /// Ordered sub-window activity symbols (0..TRACE_SYMBOLS), consumed by the
    /// sequence detector.
    pub trace: Vec<u8>,
}

impl FeatureVector {
    pub fn get(&self, name: &str) -> Option<f64> {
        FEATURE_NAMES
            .iter()
            .position(|n| *n == name)
            .and_then(|i| self.values.get(i).copied())
    }

    pub fn names(&self) -> &'static [&'static str] {
        &FEATURE_NAMES
    }
}

/// Bucket an event count into a sub-window activity symbol: 0, 1, 2-3, 4-7, >=8.
pub(crate) fn activity_symbol(count: usize) -> u8 {
    match count {
        0 => 0,
        1 => 1,
        2..=3 => 2,
        4..=7 => 3,
        _ => 4,
    }
}
