// Shared transport configuration for building reqwest::Client instances.
//
// Both REST adapters share TLS and timeout settings through this module,
// avoiding duplicated builder logic. Printers on the LAN almost always
// present self-signed certificates, so accept-invalid is the default.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ProtoError;

/// TLS verification mode for printer-local HTTP endpoints.
#[derive(Debug, Clone, Default)]
pub enum TlsMode {
    /// Use the system certificate store.
    System,
    /// Use a custom CA certificate from the given PEM file.
    CustomCa(PathBuf),
    /// Accept any certificate. Default: printers ship self-signed certs.
    #[default]
    DangerAcceptInvalid,
}

/// Shared transport configuration for building HTTP clients.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub tls: TlsMode,
    pub timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            tls: TlsMode::default(),
            timeout: Duration::from_secs(10),
        }
    }
}

impl TransportConfig {
    /// Build a `reqwest::Client` from this config.
    pub fn build_client(&self) -> Result<reqwest::Client, ProtoError> {
        self.build_client_with_headers(reqwest::header::HeaderMap::new())
    }

    /// Build a `reqwest::Client` with additional default headers.
    ///
    /// Used by adapters that authenticate via a static header
    /// (e.g. `X-Api-Key`).
    pub fn build_client_with_headers(
        &self,
        headers: reqwest::header::HeaderMap,
    ) -> Result<reqwest::Client, ProtoError> {
        let mut builder = reqwest::Client::builder()
            .timeout(self.timeout)
            .user_agent("printwatch/0.1.0")
            .default_headers(headers);

        match &self.tls {
            TlsMode::System => {}
            TlsMode::CustomCa(path) => {
                let cert_pem = std::fs::read(path)
                    .map_err(|e| ProtoError::Tls(format!("failed to read CA cert: {e}")))?;
                let cert = reqwest::Certificate::from_pem(&cert_pem)
                    .map_err(|e| ProtoError::Tls(format!("invalid CA cert: {e}")))?;
                builder = builder.add_root_certificate(cert);
            }
            TlsMode::DangerAcceptInvalid => {
                builder = builder.danger_accept_invalid_certs(true);
            }
        }

        builder
            .build()
            .map_err(|e| ProtoError::Tls(format!("failed to build HTTP client: {e}")))
    }
}
