// ── Printer monitor daemon ──
//
// One long-running task per printer. Owns the printer's authoritative
// `PrinterState`, applies each normalized telemetry reading to it, and
// publishes typed events for every transition it observes. A wedged
// printer degrades only its own tick cadence; monitors share nothing
// but the bus and the relay.
//
// The transition logic lives in `MonitorCore`, a pure state machine
// driven by `apply()`. The async task around it only does scheduling:
// ticks, reconnect backoff, snapshot publication.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use printwatch_proto::{Connectivity, PrintState, PrinterAdapter, Telemetry, codes};

use crate::bus::EventBus;
use crate::model::{Event, JobContext, Payload, PrinterInfo, PrinterState, event_types};

/// Tuning for one monitor.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Telemetry poll cadence while the printer is reachable.
    pub poll_interval: Duration,
    /// Consecutive failed reads before the printer is declared offline.
    pub failure_threshold: u32,
    /// First reconnect delay once offline.
    pub backoff_initial: Duration,
    /// Reconnect delay cap. Monitors retry forever at this cadence;
    /// printers are expected to come back.
    pub backoff_max: Duration,
    /// Remaining-percent threshold for `inventory.spool_low`.
    pub spool_low_percent: u8,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            failure_threshold: 3,
            backoff_initial: Duration::from_secs(5),
            backoff_max: Duration::from_secs(120),
            spool_low_percent: 10,
        }
    }
}

// ── Pure transition core ─────────────────────────────────────────────

/// Per-printer state machine. `apply` consumes one telemetry reading and
/// returns the events that transition produces, in observation order.
pub struct MonitorCore {
    state: PrinterState,
    config: MonitorConfig,
    consecutive_failures: u32,
    offline_announced: bool,
    /// Terminal-event guard: the last job id for which a
    /// completed/failed/cancelled event was emitted.
    last_terminal_job: Option<String>,
    first_read_done: bool,
}

impl MonitorCore {
    pub fn new(info: PrinterInfo, config: MonitorConfig) -> Self {
        Self {
            state: PrinterState::initial(info),
            config,
            consecutive_failures: 0,
            offline_announced: false,
            last_terminal_job: None,
            first_read_done: false,
        }
    }

    pub fn state(&self) -> &PrinterState {
        &self.state
    }

    /// True once the failure threshold has been crossed; the task loop
    /// switches to backoff scheduling while this holds.
    pub fn is_offline(&self) -> bool {
        self.offline_announced
    }

    fn printer_id(&self) -> String {
        self.state.info.id.to_string()
    }

    /// Apply one reading. Returns emitted events in order.
    pub fn apply(&mut self, t: &Telemetry) -> Vec<Event> {
        if t.connectivity != Connectivity::Connected {
            return self.apply_unreachable();
        }

        let mut events = Vec::new();
        let source = self.printer_id();

        // Reconnect edge: exactly one printer.connected per transition,
        // never one per tick.
        let reconnected = self.state.connectivity != Connectivity::Connected;
        if reconnected {
            self.offline_announced = false;
            events.push(Event::new(
                event_types::PRINTER_CONNECTED,
                &source,
                Payload::new()
                    .set("printer_id", source.clone())
                    .set("printer_name", self.state.info.name.clone())
                    .build(),
            ));
        }
        self.consecutive_failures = 0;
        self.state.connectivity = Connectivity::Connected;

        let old_state = self.state.print_state;
        let new_state = t.print_state.unwrap_or(old_state);

        self.diff_error_code(t, &source, &mut events);
        let job_started = self.diff_job_identity(t, new_state, &source, &mut events);
        let covered = job_started || reconnected;
        self.diff_print_state(t, old_state, new_state, covered, &source, &mut events);
        self.diff_inventory(t, &source, &mut events);
        self.apply_progress(t, new_state, old_state, &source, &mut events);

        // A confirmed idle reading with no job in sight releases the
        // terminal guard: a later run of the same job id is a new print,
        // not a stale replay.
        if new_state == PrintState::Idle && t.job_id.is_none() && self.state.job.is_none() {
            self.last_terminal_job = None;
        }

        self.state.print_state = new_state;
        self.state.updated_at = chrono::Utc::now();
        self.first_read_done = true;
        events
    }

    fn apply_unreachable(&mut self) -> Vec<Event> {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.consecutive_failures < self.config.failure_threshold || self.offline_announced {
            return Vec::new();
        }

        // Threshold crossed: announce once, then stay quiet while down.
        self.offline_announced = true;
        self.state.connectivity = Connectivity::Disconnected;
        self.state.print_state = PrintState::Offline;
        self.state.updated_at = chrono::Utc::now();

        let source = self.printer_id();
        vec![Event::new(
            event_types::PRINTER_DISCONNECTED,
            &source,
            Payload::new()
                .set("printer_id", source.clone())
                .set("printer_name", self.state.info.name.clone())
                .set("failures", self.consecutive_failures)
                .build(),
        )]
    }

    /// Vendor code changes emit `printer.hms_code` with the translated
    /// message and severity. Unknown codes pass through, never dropped.
    fn diff_error_code(&mut self, t: &Telemetry, source: &str, events: &mut Vec<Event>) {
        if t.error_code == self.state.last_error_code {
            return;
        }
        if let Some(code) = &t.error_code {
            let info = codes::translate(code);
            events.push(Event::new(
                event_types::PRINTER_HMS_CODE,
                source,
                Payload::new()
                    .set("printer_id", source.to_string())
                    .set("code", info.code)
                    .set("message", info.message)
                    .set("severity", format!("{:?}", info.severity).to_lowercase())
                    .build(),
            ));
        }
        self.state.last_error_code = t.error_code.clone();
    }

    /// New job identity emits `job.started`. The first reading after a
    /// monitor (re)start can observe a print already in flight; that
    /// start is tagged `resumed: true` so consumers can tell a
    /// re-derivation from a genuine new job.
    fn diff_job_identity(
        &mut self,
        t: &Telemetry,
        new_state: PrintState,
        source: &str,
        events: &mut Vec<Event>,
    ) -> bool {
        let Some(job_id) = &t.job_id else {
            return false;
        };
        if !matches!(new_state, PrintState::Printing | PrintState::Paused) {
            return false;
        }
        let already_current = self.state.job.as_ref().is_some_and(|j| &j.id == job_id);
        if already_current || self.last_terminal_job.as_ref() == Some(job_id) {
            return false;
        }

        self.state.job = Some(JobContext {
            id: job_id.clone(),
            name: t.job_name.clone(),
            ..JobContext::default()
        });

        events.push(Event::new(
            event_types::JOB_STARTED,
            source,
            Payload::new()
                .set("printer_id", source.to_string())
                .set("job_id", job_id.clone())
                .set_opt("job_name", t.job_name.clone())
                .set("resumed", !self.first_read_done)
                .build(),
        ));
        true
    }

    fn diff_print_state(
        &mut self,
        t: &Telemetry,
        old_state: PrintState,
        new_state: PrintState,
        covered: bool,
        source: &str,
        events: &mut Vec<Event>,
    ) {
        if new_state == old_state {
            return;
        }

        if new_state.is_terminal() {
            self.emit_terminal(t, new_state, source, events);
            return;
        }

        // Some REST protocols never report a terminal flag; a finished
        // print surfaces as a bare drop back to idle (or the end slips
        // by while the printer is unreachable). Resolve the held job as
        // completed so the next run of the same file (job ids are file
        // paths there) can start again.
        if new_state == PrintState::Idle && self.state.job.is_some() {
            self.emit_terminal(t, PrintState::Completed, source, events);
            return;
        }

        if new_state == PrintState::Error {
            let code = t.error_code.as_deref().map(codes::translate);
            let payload = Payload::new()
                .set("printer_id", source.to_string())
                .set("old_state", old_state.to_string())
                .set("new_state", new_state.to_string())
                .set_opt("code", code.as_ref().map(|c| c.code.clone()))
                .set_opt("message", code.as_ref().map(|c| c.message.clone()))
                .set(
                    "severity",
                    code.map_or("warning".to_string(), |c| {
                        format!("{:?}", c.severity).to_lowercase()
                    }),
                )
                .build();
            events.push(Event::new(event_types::PRINTER_ERROR, source, payload));
            return;
        }

        // A job event or connected event already describes this
        // transition; a bare state_changed on top would be noise.
        if covered {
            return;
        }

        events.push(Event::new(
            event_types::PRINTER_STATE_CHANGED,
            source,
            Payload::new()
                .set("printer_id", source.to_string())
                .set("old_state", old_state.to_string())
                .set("new_state", new_state.to_string())
                .set_opt("job_id", self.state.job.as_ref().map(|j| j.id.clone()))
                .build(),
        ));
    }

    /// Terminal transitions fire exactly once per job id, guarded across
    /// repeated polls and reconnects by `last_terminal_job`.
    fn emit_terminal(
        &mut self,
        t: &Telemetry,
        new_state: PrintState,
        source: &str,
        events: &mut Vec<Event>,
    ) {
        let job_id = t
            .job_id
            .clone()
            .or_else(|| self.state.job.as_ref().map(|j| j.id.clone()));
        let Some(job_id) = job_id else {
            // Terminal state with no job identity observed at all; there
            // is nothing to deduplicate against, so stay silent.
            self.state.job = None;
            return;
        };
        if self.last_terminal_job.as_ref() == Some(&job_id) {
            self.state.job = None;
            return;
        }

        let event_type = match new_state {
            PrintState::Failed => event_types::JOB_FAILED,
            PrintState::Cancelled => event_types::JOB_CANCELLED,
            _ => event_types::JOB_COMPLETED,
        };
        let job_name = self
            .state
            .job
            .as_ref()
            .and_then(|j| j.name.clone())
            .or_else(|| t.job_name.clone());

        events.push(Event::new(
            event_type,
            source,
            Payload::new()
                .set("printer_id", source.to_string())
                .set("job_id", job_id.clone())
                .set_opt("job_name", job_name)
                .set_opt("progress_percent", t.progress_percent)
                .build(),
        ));
        self.last_terminal_job = Some(job_id);
        self.state.job = None;
    }

    /// Feeder transitions: a slot running dry or crossing the low-water
    /// mark emits inventory events keyed by `printer:slot`.
    fn diff_inventory(&mut self, t: &Telemetry, source: &str, events: &mut Vec<Event>) {
        let threshold = self.config.spool_low_percent;

        for slot in &t.slots {
            let old = self.state.slots.iter().find(|s| s.index == slot.index);
            let spool_id = format!("{source}:{}", slot.index);

            let was_empty = old.is_some_and(|s| s.empty);
            if slot.empty && old.is_some() && !was_empty {
                events.push(Event::new(
                    event_types::INVENTORY_SPOOL_EMPTY,
                    source,
                    Payload::new()
                        .set("printer_id", source.to_string())
                        .set("spool_id", spool_id)
                        .set("slot", slot.index)
                        .set_opt("material", slot.material.clone())
                        .build(),
                ));
                continue;
            }

            let old_remaining = old.and_then(|s| s.remaining_percent);
            let now_low = slot
                .remaining_percent
                .is_some_and(|r| r <= threshold && !slot.empty);
            let was_low = old_remaining.is_some_and(|r| r <= threshold);
            if now_low && !was_low {
                events.push(Event::new(
                    event_types::INVENTORY_SPOOL_LOW,
                    source,
                    Payload::new()
                        .set("printer_id", source.to_string())
                        .set("spool_id", spool_id)
                        .set("slot", slot.index)
                        .set_opt("material", slot.material.clone())
                        .set_opt("remaining_percent", slot.remaining_percent)
                        .build(),
                ));
            }
        }

        if !t.slots.is_empty() {
            self.state.slots = t.slots.clone();
        }
        if t.external_spool.is_some() {
            self.state.external_spool = t.external_spool.clone();
        }
        if t.environment.is_some() {
            self.state.environment = t.environment;
        }
    }

    /// Progress-only updates mutate held state and emit one low-priority
    /// telemetry event; they never drive alerting on their own.
    fn apply_progress(
        &mut self,
        t: &Telemetry,
        new_state: PrintState,
        old_state: PrintState,
        source: &str,
        events: &mut Vec<Event>,
    ) {
        let mut progressed = false;

        if let Some(job) = self.state.job.as_mut() {
            if t.progress_percent.is_some() && t.progress_percent != job.progress_percent {
                job.progress_percent = t.progress_percent;
                progressed = true;
            }
            if t.layer_current.is_some() && t.layer_current != job.layer_current {
                job.layer_current = t.layer_current;
                progressed = true;
            }
            if t.layer_total.is_some() {
                job.layer_total = t.layer_total;
            }
            if t.elapsed_min.is_some() {
                job.elapsed_min = t.elapsed_min;
            }
            if t.remaining_min.is_some() {
                job.remaining_min = t.remaining_min;
            }
            if t.job_name.is_some() && job.name.is_none() {
                job.name = t.job_name.clone();
            }
        }

        self.state.bed = t.bed;
        self.state.nozzle = t.nozzle;
        if t.nozzle_secondary.is_some() {
            self.state.nozzle_secondary = t.nozzle_secondary;
        }

        if progressed && new_state == old_state {
            events.push(Event::new(
                event_types::PRINTER_TELEMETRY,
                source,
                Payload::new()
                    .set("printer_id", source.to_string())
                    .set_opt("progress_percent", t.progress_percent)
                    .set_opt("layer_current", t.layer_current)
                    .set_opt("layer_total", t.layer_total)
                    .build(),
            ));
        }
    }
}

// ── Task wrapper ─────────────────────────────────────────────────────

/// Handle to a running monitor. Dropping the handle does not stop the
/// task; call [`stop`](Self::stop).
pub struct MonitorHandle {
    state_rx: watch::Receiver<Arc<PrinterState>>,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl MonitorHandle {
    /// Subscribe to state snapshots from this monitor.
    pub fn state(&self) -> watch::Receiver<Arc<PrinterState>> {
        self.state_rx.clone()
    }

    /// Signal shutdown and wait for the task to finish.
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.join.await;
    }
}

/// Spawn the monitor task for one printer.
///
/// `heartbeat` is invoked once per tick; the daemon wires it to the
/// alert dispatcher's digest-flush check.
pub fn spawn_monitor(
    info: PrinterInfo,
    adapter: Arc<dyn PrinterAdapter>,
    bus: Arc<EventBus>,
    config: MonitorConfig,
    cancel: CancellationToken,
    heartbeat: Option<Arc<dyn Fn() + Send + Sync>>,
) -> MonitorHandle {
    let core = MonitorCore::new(info, config.clone());
    let (state_tx, state_rx) = watch::channel(Arc::new(core.state().clone()));

    let task_cancel = cancel.clone();
    let join = tokio::spawn(monitor_task(
        core, adapter, bus, config, state_tx, task_cancel, heartbeat,
    ));

    MonitorHandle {
        state_rx,
        cancel,
        join,
    }
}

async fn monitor_task(
    mut core: MonitorCore,
    adapter: Arc<dyn PrinterAdapter>,
    bus: Arc<EventBus>,
    config: MonitorConfig,
    state_tx: watch::Sender<Arc<PrinterState>>,
    cancel: CancellationToken,
    heartbeat: Option<Arc<dyn Fn() + Send + Sync>>,
) {
    let printer = core.state().info.id.to_string();

    if let Err(e) = adapter.connect().await {
        warn!(printer = %printer, error = %e, "initial connect failed, will retry");
    } else {
        info!(printer = %printer, "adapter connected");
    }

    let mut interval = tokio::time::interval(config.poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut backoff = config.backoff_initial;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        let telemetry = adapter.get_status().await;
        let was_offline = core.is_offline();
        let events = core.apply(&telemetry);

        // Snapshot first, then publish: a handler reading the fleet
        // store during dispatch sees the state the events describe.
        state_tx.send_modify(|s| *s = Arc::new(core.state().clone()));
        for event in &events {
            bus.publish(event);
        }

        if let Some(beat) = &heartbeat {
            beat();
        }

        if core.is_offline() {
            // Reduced-frequency retry loop; keep trying forever.
            debug!(printer = %printer, delay_secs = backoff.as_secs(), "offline, backing off");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(config.backoff_max);
            if let Err(e) = adapter.connect().await {
                debug!(printer = %printer, error = %e, "reconnect attempt failed");
            }
        } else if was_offline {
            backoff = config.backoff_initial;
        }
    }

    adapter.disconnect().await;
    debug!(printer = %printer, "monitor stopped");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::{PrinterId, PrinterProtocol};
    use printwatch_proto::FilamentSlot;

    fn info() -> PrinterInfo {
        PrinterInfo {
            id: PrinterId::from("p1"),
            name: "Test Printer".into(),
            protocol: PrinterProtocol::Prusa,
            address: "http://printer.local".into(),
        }
    }

    fn core() -> MonitorCore {
        MonitorCore::new(info(), MonitorConfig::default())
    }

    fn connected_idle() -> Telemetry {
        Telemetry::connected(PrintState::Idle)
    }

    fn printing(job_id: &str) -> Telemetry {
        let mut t = Telemetry::connected(PrintState::Printing);
        t.job_id = Some(job_id.to_string());
        t
    }

    fn types(events: &[Event]) -> Vec<&str> {
        events.iter().map(|e| e.event_type.as_str()).collect()
    }

    #[test]
    fn first_successful_read_emits_connected_only() {
        let mut core = core();
        let events = core.apply(&connected_idle());
        assert_eq!(types(&events), vec![event_types::PRINTER_CONNECTED]);
        assert_eq!(core.state().print_state, PrintState::Idle);
    }

    #[test]
    fn disconnect_fires_once_per_transition_not_per_tick() {
        let mut core = core();
        core.apply(&connected_idle());

        let mut emitted = Vec::new();
        for _ in 0..6 {
            emitted.extend(core.apply(&Telemetry::unreachable()));
        }
        assert_eq!(types(&emitted), vec![event_types::PRINTER_DISCONNECTED]);
        assert!(core.is_offline());
    }

    #[test]
    fn short_blip_below_threshold_is_silent() {
        let mut core = core();
        core.apply(&connected_idle());
        assert!(core.apply(&Telemetry::unreachable()).is_empty());
        assert!(core.apply(&Telemetry::unreachable()).is_empty());
        // Back before the threshold: connectivity never changed.
        assert!(core.apply(&connected_idle()).is_empty());
    }

    #[test]
    fn job_start_on_first_read_is_tagged_resumed() {
        let mut core = core();
        let events = core.apply(&printing("42"));
        let started = events
            .iter()
            .find(|e| e.event_type == event_types::JOB_STARTED)
            .unwrap();
        assert_eq!(started.data["resumed"], serde_json::Value::Bool(true));
    }

    #[test]
    fn job_start_after_idle_is_a_genuine_start() {
        let mut core = core();
        core.apply(&connected_idle());
        let events = core.apply(&printing("42"));
        let started = events
            .iter()
            .find(|e| e.event_type == event_types::JOB_STARTED)
            .unwrap();
        assert_eq!(started.data["resumed"], serde_json::Value::Bool(false));
        // The start event covers the idle->printing transition.
        assert!(
            !events
                .iter()
                .any(|e| e.event_type == event_types::PRINTER_STATE_CHANGED)
        );
    }

    #[test]
    fn spool_low_fires_on_threshold_crossing_only() {
        let mut core = core();
        let mut t = connected_idle();
        t.slots = vec![FilamentSlot {
            index: 0,
            material: Some("PLA".into()),
            remaining_percent: Some(50),
            ..FilamentSlot::default()
        }];
        core.apply(&t);

        t.slots[0].remaining_percent = Some(8);
        let events = core.apply(&t);
        assert_eq!(types(&events), vec![event_types::INVENTORY_SPOOL_LOW]);

        // Still low: no repeat.
        t.slots[0].remaining_percent = Some(5);
        assert!(core.apply(&t).is_empty());
    }

    #[test]
    fn spool_empty_transition() {
        let mut core = core();
        let mut t = connected_idle();
        t.slots = vec![FilamentSlot {
            index: 1,
            material: Some("PETG".into()),
            remaining_percent: Some(3),
            ..FilamentSlot::default()
        }];
        core.apply(&t);

        t.slots[0].empty = true;
        t.slots[0].material = None;
        let events = core.apply(&t);
        assert_eq!(types(&events), vec![event_types::INVENTORY_SPOOL_EMPTY]);
        let spool = events[0].data_str("spool_id").unwrap();
        assert_eq!(spool, "p1:1");
    }

    #[test]
    fn hms_code_translated_and_emitted_once() {
        let mut core = core();
        core.apply(&connected_idle());

        let mut t = connected_idle();
        t.error_code = Some("0700_0100".into());
        let events = core.apply(&t);
        assert_eq!(types(&events), vec![event_types::PRINTER_HMS_CODE]);
        assert!(events[0].data_str("message").unwrap().contains("ran out"));

        // Same code again: no repeat.
        assert!(core.apply(&t).is_empty());
    }

    #[test]
    fn unknown_hms_code_passes_through() {
        let mut core = core();
        core.apply(&connected_idle());

        let mut t = connected_idle();
        t.error_code = Some("BEEF_0001".into());
        let events = core.apply(&t);
        assert_eq!(events[0].data_str("code").unwrap(), "BEEF_0001");
        assert_eq!(events[0].data_str("severity").unwrap(), "warning");
    }

    #[test]
    fn error_transition_carries_old_and_new_state() {
        let mut core = core();
        core.apply(&connected_idle());

        let events = core.apply(&Telemetry::connected(PrintState::Error));
        let error = events
            .iter()
            .find(|e| e.event_type == event_types::PRINTER_ERROR)
            .unwrap();
        assert_eq!(error.data_str("old_state").unwrap(), "idle");
        assert_eq!(error.data_str("new_state").unwrap(), "error");
    }

    #[test]
    fn progress_only_change_emits_telemetry_event() {
        let mut core = core();
        core.apply(&connected_idle());
        core.apply(&printing("7"));

        let mut t = printing("7");
        t.progress_percent = Some(12.0);
        let events = core.apply(&t);
        assert_eq!(types(&events), vec![event_types::PRINTER_TELEMETRY]);
    }

    #[test]
    fn all_optional_fields_absent_is_harmless() {
        let mut core = core();
        core.apply(&connected_idle());
        let events = core.apply(&connected_idle());
        assert!(events.is_empty());
        assert!(core.state().job.is_none());
    }
}
