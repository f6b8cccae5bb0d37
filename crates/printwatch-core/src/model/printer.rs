// ── Printer identity and authoritative state ──

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use printwatch_proto::{
    Connectivity, Environment, FilamentSlot, PrintState, TempReading,
};

/// Stable printer identifier (serial number or configured slug).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrinterId(pub String);

impl PrinterId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PrinterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PrinterId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// User identifier, opaque to this crate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which wire protocol a printer speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PrinterProtocol {
    Bambu,
    Prusa,
    Octo,
    Sdcp,
}

/// Static identity of a configured printer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrinterInfo {
    pub id: PrinterId,
    pub name: String,
    pub protocol: PrinterProtocol,
    /// Network address as configured (host, URL, or serial-derived).
    pub address: String,
}

/// Job context held while a print is active.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct JobContext {
    pub id: String,
    pub name: Option<String>,
    pub progress_percent: Option<f64>,
    pub layer_current: Option<u32>,
    pub layer_total: Option<u32>,
    pub elapsed_min: Option<u32>,
    pub remaining_min: Option<u32>,
}

/// Authoritative state of one printer.
///
/// Written exclusively by the printer's monitor; everyone else reads
/// immutable `Arc` snapshots published through a `watch` channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrinterState {
    pub info: PrinterInfo,

    pub connectivity: Connectivity,
    pub print_state: PrintState,

    pub job: Option<JobContext>,
    pub last_error_code: Option<String>,

    pub bed: TempReading,
    pub nozzle: TempReading,
    pub nozzle_secondary: Option<TempReading>,

    pub slots: Vec<FilamentSlot>,
    pub external_spool: Option<FilamentSlot>,
    pub environment: Option<Environment>,

    pub updated_at: DateTime<Utc>,
}

impl PrinterState {
    /// Initial state for a freshly registered printer: nothing known yet.
    pub fn initial(info: PrinterInfo) -> Self {
        Self {
            info,
            connectivity: Connectivity::Disconnected,
            print_state: PrintState::Offline,
            job: None,
            last_error_code: None,
            bed: TempReading::default(),
            nozzle: TempReading::default(),
            nozzle_secondary: None,
            slots: Vec::new(),
            external_spool: None,
            environment: None,
            updated_at: Utc::now(),
        }
    }
}
