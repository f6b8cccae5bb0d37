// ── Normalized telemetry contract ──
//
// Every adapter, whatever its wire format, produces exactly this shape.
// Optional readings a protocol cannot supply stay `None` -- never a
// sentinel zero, because downstream diffing must distinguish "unchanged"
// from "unreported".

use serde::{Deserialize, Serialize};

/// Reachability of the printer as observed by its adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Connectivity {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Print-engine state, normalized across vendors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PrintState {
    Idle,
    Printing,
    Paused,
    Completed,
    Failed,
    Cancelled,
    Error,
    Offline,
}

impl PrintState {
    /// Terminal states end the active job; at most one terminal event
    /// may fire per job id.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// One filament-feeder slot reading (AMS tray, MMU slot, ...).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FilamentSlot {
    /// Slot position within the feeder, 0-based.
    pub index: u8,
    /// Material short code ("PLA", "PETG") if reported.
    pub material: Option<String>,
    /// Filament color as a hex string ("FF8800") if reported.
    pub color_hex: Option<String>,
    /// Remaining filament, 0-100.
    pub remaining_percent: Option<u8>,
    /// Slot is physically empty.
    pub empty: bool,
}

/// Feeder environment readings, where the hardware reports them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    /// Vendor humidity scale, 0 (dry) to 5 (saturated).
    pub humidity_level: Option<u8>,
    /// Feeder chamber temperature in C.
    pub temperature: Option<f64>,
}

/// Temperature pair for a heated element.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TempReading {
    pub current: Option<f64>,
    pub target: Option<f64>,
}

/// A single normalized status reading from one printer.
///
/// Adapters never raise for an unreachable printer: they return
/// [`Telemetry::unreachable`], so "printer down" is a stable state the
/// monitor state machine can hold, not connection churn.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Telemetry {
    pub connectivity: Connectivity,
    pub print_state: Option<PrintState>,

    /// Vendor error/warning code (HMS code or equivalent).
    pub error_code: Option<String>,

    // Job context
    pub job_id: Option<String>,
    pub job_name: Option<String>,
    pub progress_percent: Option<f64>,
    pub layer_current: Option<u32>,
    pub layer_total: Option<u32>,
    pub elapsed_min: Option<u32>,
    pub remaining_min: Option<u32>,

    // Thermals
    pub bed: TempReading,
    pub nozzle: TempReading,
    /// Second hotend on dual-nozzle machines.
    pub nozzle_secondary: Option<TempReading>,

    // Feeder context
    pub slots: Vec<FilamentSlot>,
    /// External spool holder outside the feeder unit.
    pub external_spool: Option<FilamentSlot>,
    pub environment: Option<Environment>,
}

impl Telemetry {
    /// Reading for a printer the adapter cannot reach.
    pub fn unreachable() -> Self {
        Self {
            connectivity: Connectivity::Disconnected,
            ..Self::default()
        }
    }

    /// Reading for a reachable printer with a known print state and no
    /// other fields populated yet.
    pub fn connected(state: PrintState) -> Self {
        Self {
            connectivity: Connectivity::Connected,
            print_state: Some(state),
            ..Self::default()
        }
    }
}
