// ── Adapter error types ──
//
// Only `connect()` and command paths surface these. Status reads never
// error: an unreachable printer is a `Telemetry` value, not an `Err`.

use thiserror::Error;

/// Errors from protocol adapter construction and connection.
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("authentication rejected: {0}")]
    AuthenticationFailed(String),

    #[error("operation timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("MQTT error: {0}")]
    Mqtt(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("discovery failed: {0}")]
    Discovery(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("malformed payload: {0}")]
    Payload(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for ProtoError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProtoError::Timeout { timeout_secs: 0 }
        } else if err.is_connect() {
            ProtoError::ConnectionFailed(err.to_string())
        } else {
            ProtoError::Payload(err.to_string())
        }
    }
}
