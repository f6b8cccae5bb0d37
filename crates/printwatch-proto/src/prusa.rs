//! REST-poll adapter, type A (PrusaLink-style API).
//!
//! Two polls per tick: `/api/v1/status` for printer + progress and
//! `/api/v1/job` for job identity. Either response may omit fields;
//! omissions leave the corresponding `Telemetry` field unset rather than
//! failing the read.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::adapter::PrinterAdapter;
use crate::error::ProtoError;
use crate::telemetry::{Connectivity, PrintState, Telemetry, TempReading};
use crate::transport::TransportConfig;

/// Connection settings for one PrusaLink-style printer.
#[derive(Debug, Clone)]
pub struct PrusaConfig {
    /// Base URL, e.g. `http://192.168.1.50`.
    pub base_url: Url,
    pub api_key: SecretString,
    pub timeout: Duration,
}

pub struct PrusaAdapter {
    config: PrusaConfig,
    http: reqwest::Client,
}

impl PrusaAdapter {
    pub fn new(config: PrusaConfig) -> Result<Self, ProtoError> {
        let mut headers = HeaderMap::new();
        let key = HeaderValue::from_str(config.api_key.expose_secret())
            .map_err(|_| ProtoError::AuthenticationFailed("API key is not valid ASCII".into()))?;
        headers.insert(HeaderName::from_static("x-api-key"), key);

        let transport = TransportConfig {
            timeout: config.timeout,
            ..TransportConfig::default()
        };
        let http = transport.build_client_with_headers(headers)?;
        Ok(Self { config, http })
    }

    fn endpoint(&self, path: &str) -> Result<Url, ProtoError> {
        Ok(self.config.base_url.join(path)?)
    }

    async fn fetch_status(&self) -> Result<StatusResponse, ProtoError> {
        let url = self.endpoint("/api/v1/status")?;
        let resp = self.http.get(url).send().await?.error_for_status()?;
        Ok(resp.json().await?)
    }

    async fn fetch_job(&self) -> Result<Option<JobResponse>, ProtoError> {
        let url = self.endpoint("/api/v1/job")?;
        let resp = self.http.get(url).send().await?;
        // 204: no job active. Not an error.
        if resp.status() == reqwest::StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let resp = resp.error_for_status()?;
        Ok(Some(resp.json().await?))
    }
}

#[async_trait::async_trait]
impl PrinterAdapter for PrusaAdapter {
    async fn connect(&self) -> Result<(), ProtoError> {
        // Stateless HTTP: verify reachability and credentials once.
        let url = self.endpoint("/api/v1/status")?;
        let resp = self.http.get(url).send().await?;
        if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(ProtoError::AuthenticationFailed(
                "printer rejected the API key".into(),
            ));
        }
        resp.error_for_status()?;
        Ok(())
    }

    async fn disconnect(&self) {}

    async fn get_status(&self) -> Telemetry {
        let status = match self.fetch_status().await {
            Ok(s) => s,
            Err(e) => {
                debug!(url = %self.config.base_url, error = %e, "status poll failed");
                return Telemetry::unreachable();
            }
        };

        // Job identity is supplementary; a failed job poll degrades the
        // reading instead of discarding it.
        let job = self.fetch_job().await.unwrap_or_else(|e| {
            debug!(error = %e, "job poll failed, continuing without job identity");
            None
        });

        normalize(&status, job.as_ref())
    }
}

// ── Wire types ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct StatusResponse {
    #[serde(default)]
    printer: Option<PrinterSection>,
    #[serde(default)]
    job: Option<StatusJobSection>,
}

#[derive(Debug, Deserialize)]
struct PrinterSection {
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    temp_bed: Option<f64>,
    #[serde(default)]
    target_bed: Option<f64>,
    #[serde(default)]
    temp_nozzle: Option<f64>,
    #[serde(default)]
    target_nozzle: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct StatusJobSection {
    #[serde(default)]
    progress: Option<f64>,
    /// Seconds remaining.
    #[serde(default)]
    time_remaining: Option<u64>,
    /// Seconds elapsed.
    #[serde(default)]
    time_printing: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct JobResponse {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    file: Option<JobFile>,
}

#[derive(Debug, Deserialize)]
struct JobFile {
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

// ── Normalization ────────────────────────────────────────────────────

fn normalize(status: &StatusResponse, job: Option<&JobResponse>) -> Telemetry {
    let mut t = Telemetry {
        connectivity: Connectivity::Connected,
        ..Telemetry::default()
    };

    if let Some(printer) = &status.printer {
        t.print_state = printer.state.as_deref().map(map_state);
        t.bed = TempReading {
            current: printer.temp_bed,
            target: printer.target_bed,
        };
        t.nozzle = TempReading {
            current: printer.temp_nozzle,
            target: printer.target_nozzle,
        };
    }

    if let Some(section) = &status.job {
        t.progress_percent = section.progress;
        t.remaining_min = section.time_remaining.map(|s| (s / 60) as u32);
        t.elapsed_min = section.time_printing.map(|s| (s / 60) as u32);
    }

    if let Some(job) = job {
        t.job_id = job.id.map(|id| id.to_string());
        t.job_name = job
            .file
            .as_ref()
            .and_then(|f| f.display_name.clone().or_else(|| f.name.clone()));
    }

    t
}

fn map_state(state: &str) -> PrintState {
    match state.to_ascii_uppercase().as_str() {
        "PRINTING" | "BUSY" => PrintState::Printing,
        "PAUSED" => PrintState::Paused,
        "FINISHED" => PrintState::Completed,
        "STOPPED" => PrintState::Cancelled,
        "ERROR" | "ATTENTION" => PrintState::Error,
        // IDLE, READY and anything unrecognized.
        _ => PrintState::Idle,
    }
}
