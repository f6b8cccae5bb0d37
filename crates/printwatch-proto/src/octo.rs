//! REST-poll adapter, type B (OctoPrint-style API).
//!
//! Differs from the type-A protocol in payload shape: printer state is a
//! set of boolean flags rather than a state string, temperatures live
//! under per-tool keys, and job identity comes from the file path. A 409
//! from `/api/printer` means the host is up but no printer is attached;
//! that is reported as a connected/offline reading, not a failure.

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

/// Connection settings for one OctoPrint-style host.
#[derive(Debug, Clone)]
pub struct OctoConfig {
    pub base_url: Url,
    pub api_key: SecretString,
    pub timeout: Duration,
}

pub struct OctoAdapter {
    config: OctoConfig,
    http: reqwest::Client,
}

impl OctoAdapter {
    pub fn new(config: OctoConfig) -> Result<Self, ProtoError> {
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

    async fn fetch_job(&self) -> Result<Option<JobResponse>, ProtoError> {
        let url = self.endpoint("/api/job")?;
        let resp = self.http.get(url).send().await?.error_for_status()?;
        Ok(Some(resp.json().await?))
    }
}

#[async_trait::async_trait]
impl PrinterAdapter for OctoAdapter {
    async fn connect(&self) -> Result<(), ProtoError> {
        let url = self.endpoint("/api/version")?;
        let resp = self.http.get(url).send().await?;
        if resp.status() == reqwest::StatusCode::FORBIDDEN {
            return Err(ProtoError::AuthenticationFailed(
                "host rejected the API key".into(),
            ));
        }
        resp.error_for_status()?;
        Ok(())
    }

    async fn disconnect(&self) {}

    async fn get_status(&self) -> Telemetry {
        let printer_url = match self.endpoint("/api/printer") {
            Ok(u) => u,
            Err(_) => return Telemetry::unreachable(),
        };
        let resp = match self.http.get(printer_url).send().await {
            Ok(r) => r,
            Err(e) => {
                debug!(url = %self.config.base_url, error = %e, "printer poll failed");
                return Telemetry::unreachable();
            }
        };

        // Host reachable but no printer attached to it.
        if resp.status() == reqwest::StatusCode::CONFLICT {
            return Telemetry::connected(PrintState::Offline);
        }

        let printer: PrinterResponse = match resp.error_for_status() {
            Ok(r) => match r.json().await {
                Ok(p) => p,
                Err(e) => {
                    debug!(error = %e, "unparseable printer payload");
                    return Telemetry::unreachable();
                }
            },
            Err(e) => {
                debug!(error = %e, "printer poll returned error status");
                return Telemetry::unreachable();
            }
        };

        // Job identity is supplementary; a broken job endpoint degrades
        // the reading instead of discarding it.
        let job = self.fetch_job().await.unwrap_or_else(|e| {
            debug!(error = %e, "job poll failed, continuing without job identity");
            None
        });

        normalize(&printer, job.as_ref())
    }
}

// ── Wire types ───────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
struct PrinterResponse {
    #[serde(default)]
    state: Option<StateSection>,
    #[serde(default)]
    temperature: Option<TemperatureSection>,
}

#[derive(Debug, Default, Deserialize)]
struct StateSection {
    #[serde(default)]
    flags: Option<StateFlags>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StateFlags {
    #[serde(default)]
    printing: bool,
    #[serde(default)]
    paused: bool,
    #[serde(default)]
    pausing: bool,
    #[serde(default)]
    cancelling: bool,
    #[serde(default)]
    error: bool,
    #[serde(default)]
    closed_or_error: bool,
    #[serde(default)]
    operational: bool,
}

#[derive(Debug, Default, Deserialize)]
struct TemperatureSection {
    #[serde(default)]
    tool0: Option<TempEntry>,
    #[serde(default)]
    tool1: Option<TempEntry>,
    #[serde(default)]
    bed: Option<TempEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct TempEntry {
    #[serde(default)]
    actual: Option<f64>,
    #[serde(default)]
    target: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct JobResponse {
    #[serde(default)]
    job: Option<JobSection>,
    #[serde(default)]
    progress: Option<ProgressSection>,
}

#[derive(Debug, Default, Deserialize)]
struct JobSection {
    #[serde(default)]
    file: Option<FileSection>,
}

#[derive(Debug, Default, Deserialize)]
struct FileSection {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    path: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProgressSection {
    /// 0-100.
    #[serde(default)]
    completion: Option<f64>,
    /// Seconds elapsed.
    #[serde(default)]
    print_time: Option<u64>,
    /// Seconds remaining.
    #[serde(default)]
    print_time_left: Option<u64>,
}

// ── Normalization ────────────────────────────────────────────────────

fn normalize(printer: &PrinterResponse, job: Option<&JobResponse>) -> Telemetry {
    let mut t = Telemetry {
        connectivity: Connectivity::Connected,
        ..Telemetry::default()
    };

    if let Some(flags) = printer.state.as_ref().and_then(|s| s.flags.as_ref()) {
        t.print_state = Some(map_flags(flags));
    }

    if let Some(temps) = &printer.temperature {
        if let Some(bed) = &temps.bed {
            t.bed = TempReading {
                current: bed.actual,
                target: bed.target,
            };
        }
        if let Some(tool0) = &temps.tool0 {
            t.nozzle = TempReading {
                current: tool0.actual,
                target: tool0.target,
            };
        }
        if let Some(tool1) = &temps.tool1 {
            t.nozzle_secondary = Some(TempReading {
                current: tool1.actual,
                target: tool1.target,
            });
        }
    }

    if let Some(job) = job {
        let file = job.job.as_ref().and_then(|j| j.file.as_ref());
        t.job_name = file.and_then(|f| f.name.clone());
        // This protocol has no job id; the file path is the stable
        // identity for a given print.
        t.job_id = file.and_then(|f| f.path.clone().or_else(|| f.name.clone()));

        if let Some(progress) = &job.progress {
            t.progress_percent = progress.completion;
            t.elapsed_min = progress.print_time.map(|s| (s / 60) as u32);
            t.remaining_min = progress.print_time_left.map(|s| (s / 60) as u32);
        }
    }

    t
}

fn map_flags(flags: &StateFlags) -> PrintState {
    if flags.error || flags.closed_or_error {
        PrintState::Error
    } else if flags.cancelling {
        PrintState::Cancelled
    } else if flags.paused || flags.pausing {
        PrintState::Paused
    } else if flags.printing {
        PrintState::Printing
    } else if flags.operational {
        PrintState::Idle
    } else {
        PrintState::Offline
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn flags() -> StateFlags {
        StateFlags::default()
    }

    #[test]
    fn flag_precedence() {
        let mut f = flags();
        f.printing = true;
        f.paused = true;
        // Paused wins over printing: pausing hosts keep both set.
        assert_eq!(map_flags(&f), PrintState::Paused);

        let mut f = flags();
        f.printing = true;
        f.error = true;
        assert_eq!(map_flags(&f), PrintState::Error);

        let mut f = flags();
        f.operational = true;
        assert_eq!(map_flags(&f), PrintState::Idle);

        assert_eq!(map_flags(&flags()), PrintState::Offline);
    }

    #[test]
    fn job_identity_from_file_path() {
        let printer = PrinterResponse::default();
        let job = JobResponse {
            job: Some(JobSection {
                file: Some(FileSection {
                    name: Some("benchy.gcode".into()),
                    path: Some("prints/benchy.gcode".into()),
                }),
            }),
            progress: Some(ProgressSection {
                completion: Some(12.5),
                print_time: Some(120),
                print_time_left: Some(840),
            }),
        };
        let t = normalize(&printer, Some(&job));
        assert_eq!(t.job_id.as_deref(), Some("prints/benchy.gcode"));
        assert_eq!(t.job_name.as_deref(), Some("benchy.gcode"));
        assert_eq!(t.progress_percent, Some(12.5));
        assert_eq!(t.elapsed_min, Some(2));
        assert_eq!(t.remaining_min, Some(14));
    }

    #[test]
    fn dual_tool_maps_to_secondary_nozzle() {
        let printer = PrinterResponse {
            state: None,
            temperature: Some(TemperatureSection {
                tool0: Some(TempEntry {
                    actual: Some(210.0),
                    target: Some(210.0),
                }),
                tool1: Some(TempEntry {
                    actual: Some(35.0),
                    target: Some(0.0),
                }),
                bed: None,
            }),
        };
        let t = normalize(&printer, None);
        assert_eq!(t.nozzle.current, Some(210.0));
        assert_eq!(t.nozzle_secondary.expect("tool1").current, Some(35.0));
    }
}
