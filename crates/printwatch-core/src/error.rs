// ── Core error types ──
//
// User-facing errors from printwatch-core. Consumers never see raw
// rusqlite or transport errors; the From impls translate them into
// domain-appropriate variants.

use thiserror::Error;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Monitoring errors ────────────────────────────────────────────
    #[error("printer not found: {identifier}")]
    PrinterNotFound { identifier: String },

    #[error("monitor for printer '{printer}' is not running")]
    MonitorStopped { printer: String },

    // ── Relay / store errors ─────────────────────────────────────────
    #[error("relay storage error: {0}")]
    Relay(String),

    #[error("alert storage error: {0}")]
    AlertStore(String),

    // ── Dispatch errors ──────────────────────────────────────────────
    #[error("no job found with id {job_id}")]
    JobNotFound { job_id: String },

    // ── Wiring errors ────────────────────────────────────────────────
    #[error("missing capability wiring: {capability}")]
    MissingCapability { capability: &'static str },

    // ── Configuration errors ─────────────────────────────────────────
    #[error("configuration error: {message}")]
    Config { message: String },

    // ── Internal errors ──────────────────────────────────────────────
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<rusqlite::Error> for CoreError {
    fn from(err: rusqlite::Error) -> Self {
        CoreError::Relay(err.to_string())
    }
}

impl From<printwatch_proto::ProtoError> for CoreError {
    fn from(err: printwatch_proto::ProtoError) -> Self {
        CoreError::Internal(err.to_string())
    }
}
