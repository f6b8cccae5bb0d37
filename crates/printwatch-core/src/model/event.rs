// ── Domain events ──
//
// Immutable values published once and fanned out. Ordering holds only
// among events from the same source; nothing is promised across sources.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The full event taxonomy carried on the bus and through the relay.
///
/// Payload keys are documented per type at the emit site; consumers must
/// ignore unknown keys (forward compatibility).
pub mod event_types {
    pub const PRINTER_STATE_CHANGED: &str = "printer.state_changed";
    pub const PRINTER_CONNECTED: &str = "printer.connected";
    pub const PRINTER_DISCONNECTED: &str = "printer.disconnected";
    pub const PRINTER_ERROR: &str = "printer.error";
    pub const PRINTER_HMS_CODE: &str = "printer.hms_code";
    pub const PRINTER_TELEMETRY: &str = "printer.telemetry";

    pub const JOB_CREATED: &str = "job.created";
    pub const JOB_STARTED: &str = "job.started";
    pub const JOB_COMPLETED: &str = "job.completed";
    pub const JOB_FAILED: &str = "job.failed";
    pub const JOB_CANCELLED: &str = "job.cancelled";

    pub const VISION_DETECTION: &str = "vision.detection";
    pub const VISION_AUTO_PAUSE: &str = "vision.auto_pause";

    pub const INVENTORY_SPOOL_LOW: &str = "inventory.spool_low";
    pub const INVENTORY_SPOOL_EMPTY: &str = "inventory.spool_empty";
    pub const INVENTORY_CONSUMABLE_LOW: &str = "inventory.consumable_low";

    pub const SYSTEM_BACKUP_COMPLETED: &str = "system.backup_completed";
    pub const SYSTEM_LICENSE_CHANGED: &str = "system.license_changed";
}

/// An immutable domain event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_type: String,
    /// Originating entity, e.g. a printer id. Per-source ordering is
    /// keyed on this field.
    pub source: String,
    /// Flat key/value payload.
    pub data: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(event_type: &str, source: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            event_type: event_type.to_string(),
            source: source.into(),
            data,
            timestamp: Utc::now(),
        }
    }

    /// Convenience accessor for string payload fields.
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }
}

/// Small builder-style helper for assembling payload maps.
#[derive(Debug, Default)]
pub struct Payload(Map<String, Value>);

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    /// Insert only when the value is present.
    pub fn set_opt(mut self, key: &str, value: Option<impl Into<Value>>) -> Self {
        if let Some(v) = value {
            self.0.insert(key.to_string(), v.into());
        }
        self
    }

    pub fn build(self) -> Map<String, Value> {
        self.0
    }
}
