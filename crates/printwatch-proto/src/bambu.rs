//! Vendor MQTT adapter (push-style).
//!
//! The printer publishes incremental status reports on
//! `device/{serial}/report`; we merge each report into a cached status
//! document and normalize from the merged view, since individual pushes
//! carry only the fields that changed. A `pushall` command requests one
//! full snapshot after (re)connecting.

use std::sync::Mutex;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, TlsConfiguration, Transport};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::adapter::PrinterAdapter;
use crate::error::ProtoError;
use crate::telemetry::{
    Connectivity, Environment, FilamentSlot, PrintState, Telemetry, TempReading,
};

const MQTT_PORT: u16 = 8883;
const MQTT_USER: &str = "bblp";
const KEEP_ALIVE: Duration = Duration::from_secs(30);
const RECONNECT_INITIAL: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(60);

/// Connection settings for one vendor-MQTT printer.
#[derive(Debug, Clone)]
pub struct BambuConfig {
    /// Printer hostname or IP.
    pub host: String,
    /// Printer serial number (topic component).
    pub serial: String,
    /// LAN-mode access code.
    pub access_code: SecretString,
    /// Connect timeout.
    pub timeout: Duration,
}

/// Push-style MQTT adapter.
///
/// `connect` spawns a background loop that owns the MQTT event loop and
/// keeps the latest normalized telemetry in a `watch` channel;
/// `get_status` just reads the channel, so a wedged broker never blocks
/// the caller.
pub struct BambuAdapter {
    config: BambuConfig,
    latest_tx: watch::Sender<Telemetry>,
    latest_rx: watch::Receiver<Telemetry>,
    /// Token of the currently running session task, if any. At most one
    /// task is live; a new `connect` replaces it.
    active: Mutex<Option<CancellationToken>>,
}

impl BambuAdapter {
    pub fn new(config: BambuConfig) -> Self {
        let (latest_tx, latest_rx) = watch::channel(Telemetry::unreachable());
        Self {
            config,
            latest_tx,
            latest_rx,
            active: Mutex::new(None),
        }
    }

    pub fn serial(&self) -> &str {
        &self.config.serial
    }

    #[cfg(test)]
    fn active_token(&self) -> Option<CancellationToken> {
        self.active.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait::async_trait]
impl PrinterAdapter for BambuAdapter {
    async fn connect(&self) -> Result<(), ProtoError> {
        // A live session already delivering telemetry needs no restart;
        // the monitor retries connect on every backoff cycle.
        if self.latest_rx.borrow().connectivity == Connectivity::Connected {
            return Ok(());
        }

        let client_id = format!("printwatch_{}", uuid::Uuid::new_v4());
        let mut options = MqttOptions::new(client_id, self.config.host.clone(), MQTT_PORT);
        options.set_credentials(MQTT_USER, self.config.access_code.expose_secret());
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_session(true);

        // Printers ship self-signed certificates.
        let tls = TlsConfiguration::Simple {
            ca: vec![],
            alpn: None,
            client_auth: None,
        };
        options.set_transport(Transport::tls_with_config(tls));

        let (client, event_loop) = AsyncClient::new(options, 64);

        // One session task at a time: replace the previous one instead
        // of stacking a second event loop next to it.
        let cancel = CancellationToken::new();
        let previous = self
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(cancel.clone());
        if let Some(prev) = previous {
            prev.cancel();
        }

        let task = MqttTask {
            client,
            serial: self.config.serial.clone(),
            latest: self.latest_tx.clone(),
            cancel,
        };
        tokio::spawn(task.run(event_loop));

        // Wait for the loop to report a live session before declaring
        // the adapter connected.
        let mut rx = self.latest_rx.clone();
        let wait = async {
            loop {
                if rx.borrow().connectivity == Connectivity::Connected {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        };
        tokio::time::timeout(self.config.timeout, wait)
            .await
            .map_err(|_| ProtoError::Timeout {
                timeout_secs: self.config.timeout.as_secs(),
            })?;
        Ok(())
    }

    async fn disconnect(&self) {
        let task = self.active.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            task.cancel();
        }
        let _ = self.latest_tx.send(Telemetry::unreachable());
    }

    async fn get_status(&self) -> Telemetry {
        self.latest_rx.borrow().clone()
    }
}

// ── Background MQTT loop ─────────────────────────────────────────────

struct MqttTask {
    client: AsyncClient,
    serial: String,
    latest: watch::Sender<Telemetry>,
    cancel: CancellationToken,
}

impl MqttTask {
    /// Main loop: poll the event loop, merge reports, mark the printer
    /// unreachable on errors and let rumqttc's reconnect logic recover.
    async fn run(self, mut event_loop: rumqttc::EventLoop) {
        let report_topic = format!("device/{}/report", self.serial);
        // Accumulated `print` document; reports are deep-merged into it.
        let mut cached = Value::Object(serde_json::Map::new());
        let mut backoff = RECONNECT_INITIAL;

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                polled = event_loop.poll() => match polled {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        debug!(serial = %self.serial, "MQTT session established");
                        backoff = RECONNECT_INITIAL;
                        if let Err(e) = self.on_connected(&report_topic).await {
                            warn!(error = %e, "post-connect subscribe failed");
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        if publish.topic == report_topic {
                            self.on_report(&publish.payload, &mut cached);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(serial = %self.serial, error = %e, "MQTT connection lost");
                        self.latest.send_modify(|t| {
                            t.connectivity = Connectivity::Disconnected;
                        });
                        tokio::select! {
                            biased;
                            _ = self.cancel.cancelled() => break,
                            _ = tokio::time::sleep(backoff) => {}
                        }
                        backoff = (backoff * 2).min(RECONNECT_MAX);
                    }
                }
            }
        }
        trace!(serial = %self.serial, "MQTT loop exiting");
    }

    async fn on_connected(&self, report_topic: &str) -> Result<(), ProtoError> {
        self.client
            .subscribe(report_topic, QoS::AtMostOnce)
            .await
            .map_err(|e| ProtoError::Mqtt(e.to_string()))?;

        // Ask for one full status snapshot; later reports are deltas.
        let topic = format!("device/{}/request", self.serial);
        let payload = serde_json::json!({
            "pushing": { "sequence_id": "0", "command": "pushall" }
        });
        self.client
            .publish(topic, QoS::AtMostOnce, false, payload.to_string())
            .await
            .map_err(|e| ProtoError::Mqtt(e.to_string()))?;
        Ok(())
    }

    fn on_report(&self, payload: &[u8], cached: &mut Value) {
        let report: Value = match serde_json::from_slice(payload) {
            Ok(v) => v,
            Err(e) => {
                trace!(error = %e, "unparseable report payload, skipping");
                return;
            }
        };
        let Some(print) = report.get("print") else {
            return;
        };
        merge_json(cached, print);
        let telemetry = normalize(cached);
        let _ = self.latest.send(telemetry);
    }
}

/// Deep-merge `patch` into `base`. Objects merge recursively; arrays and
/// scalars replace wholesale (tray lists arrive complete in each push).
fn merge_json(base: &mut Value, patch: &Value) {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (key, value) in patch_map {
                merge_json(base_map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
        (slot, value) => *slot = value.clone(),
    }
}

// ── Normalization ────────────────────────────────────────────────────

fn normalize(print: &Value) -> Telemetry {
    let mut t = Telemetry {
        connectivity: Connectivity::Connected,
        ..Telemetry::default()
    };

    if let Some(state) = print.get("gcode_state").and_then(Value::as_str) {
        t.print_state = Some(map_gcode_state(state));
    }

    t.progress_percent = print.get("mc_percent").and_then(Value::as_f64);
    t.layer_current = print
        .get("layer_num")
        .and_then(Value::as_u64)
        .map(|v| v as u32);
    t.layer_total = print
        .get("total_layer_num")
        .and_then(Value::as_u64)
        .map(|v| v as u32);
    t.remaining_min = print
        .get("mc_remaining_time")
        .and_then(Value::as_u64)
        .map(|v| v as u32);

    t.job_id = print
        .get("job_id")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(String::from);
    t.job_name = print
        .get("subtask_name")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(String::from);

    t.nozzle = TempReading {
        current: print.get("nozzle_temper").and_then(Value::as_f64),
        target: print.get("nozzle_target_temper").and_then(Value::as_f64),
    };
    t.bed = TempReading {
        current: print.get("bed_temper").and_then(Value::as_f64),
        target: print.get("bed_target_temper").and_then(Value::as_f64),
    };

    // Dual-nozzle variants report the second hotend separately.
    let n2 = TempReading {
        current: print.get("nozzle_2_temper").and_then(Value::as_f64),
        target: print.get("nozzle_2_target_temper").and_then(Value::as_f64),
    };
    if n2.current.is_some() || n2.target.is_some() {
        t.nozzle_secondary = Some(n2);
    }

    if let Some(ams) = print.get("ams") {
        normalize_ams(ams, &mut t);
    }

    if let Some(vt) = print.get("vt_tray") {
        let slot = normalize_tray(vt, 0);
        // Only surface the external holder when something is loaded.
        if !slot.empty {
            t.external_spool = Some(slot);
        }
    }

    t.error_code = first_hms_code(print);

    t
}

fn map_gcode_state(state: &str) -> PrintState {
    match state.to_ascii_uppercase().as_str() {
        "IDLE" | "INIT" | "STANDBY" => PrintState::Idle,
        "RUNNING" | "PREPARE" | "SLICING" => PrintState::Printing,
        "PAUSE" => PrintState::Paused,
        "FINISH" => PrintState::Completed,
        "FAILED" => PrintState::Failed,
        s if s.contains("ERROR") => PrintState::Error,
        _ => PrintState::Idle,
    }
}

/// Flatten nested feeder units into one ordered slot list. Slot index is
/// `unit * 4 + tray` so multi-unit setups stay stable across reports.
fn normalize_ams(ams: &Value, t: &mut Telemetry) {
    let Some(units) = ams.get("ams").and_then(Value::as_array) else {
        return;
    };

    for unit in units {
        let unit_id = unit
            .get("id")
            .and_then(string_or_u64)
            .unwrap_or(0);

        if t.environment.is_none() {
            let humidity = unit.get("humidity").and_then(string_or_u64).map(|v| v as u8);
            let temperature = unit
                .get("temp")
                .and_then(|v| v.as_f64().or_else(|| v.as_str().and_then(|s| s.parse().ok())));
            if humidity.is_some() || temperature.is_some() {
                t.environment = Some(Environment {
                    humidity_level: humidity,
                    temperature,
                });
            }
        }

        if let Some(trays) = unit.get("tray").and_then(Value::as_array) {
            for tray in trays {
                let tray_id = tray.get("id").and_then(string_or_u64).unwrap_or(0);
                let index = (unit_id * 4 + tray_id) as u8;
                t.slots.push(normalize_tray(tray, index));
            }
        }
    }
    t.slots.sort_by_key(|s| s.index);
}

fn normalize_tray(tray: &Value, index: u8) -> FilamentSlot {
    let material = tray
        .get("tray_type")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(String::from);
    let remaining = tray
        .get("remain")
        .and_then(Value::as_i64)
        .filter(|v| (0..=100).contains(v))
        .map(|v| v as u8);

    FilamentSlot {
        index,
        empty: material.is_none(),
        color_hex: tray
            .get("tray_color")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(|s| s.trim_start_matches('#').to_string()),
        remaining_percent: remaining,
        material,
    }
}

/// The printer reports HMS entries as `{attr, code}` integer pairs; the
/// normalized form is the two high groups of `attr` ("XXXX_YYYY"), which
/// is the granularity our code table works at.
fn first_hms_code(print: &Value) -> Option<String> {
    let entries = print.get("hms").and_then(Value::as_array)?;
    let first = entries.first()?;
    let attr = first.get("attr").and_then(Value::as_u64)?;
    Some(format!("{:04X}_{:04X}", attr >> 16, attr & 0xFFFF))
}

/// Feeder payloads encode some numerics as strings.
fn string_or_u64(v: &Value) -> Option<u64> {
    v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok()))
}
