//! Pipeline error taxonomy. Per-event and per-model failures are isolated and logged;
//! only configuration parse failures are fatal at startup.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Raw record missing or unparsable required fields. Logged and dropped.
    #[error("malformed record: {0}")]
    MalformedRecord(String),

    /// Session closed with zero events; no verdict is produced.
    #[error("session has no events")]
    InsufficientData,

    /// Scoring requested on an unfitted model. Model excluded for the round.
    #[error("model {0} is not fitted")]
    ModelNotReady(String),

    /// Feature schema of the vector does not match the model's training schema.
    #[error("schema mismatch for model {model_id}: {detail}")]
    SchemaMismatch { model_id: String, detail: String },

    /// Model exceeded its per-round scoring timeout.
    #[error("model {0} timed out")]
    ModelTimeout(String),

    /// No threshold has been published; pipeline runs observe-only.
    #[error("calibration unavailable: {0}")]
    CalibrationUnavailable(String),

    /// Sink delivery failed after retry exhaustion.
    #[error("alert dispatch failed: {0}")]
    DispatchFailure(String),

    /// Unparsable configuration. Fatal at startup.
    #[error("config error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl From<rusqlite::Error> for PipelineError {
    fn from(err: rusqlite::Error) -> Self {
        PipelineError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::MalformedRecord(err.to_string())
    }
}
