// End-to-end monitor behavior against a scripted adapter: the event
// sequences a whole print lifecycle must produce, and the ones it must
// not repeat.

#![allow(clippy::unwrap_used)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use printwatch_core::model::{Event, PrinterId, PrinterInfo, PrinterProtocol, event_types};
use printwatch_core::monitor::{MonitorConfig, MonitorCore};
use printwatch_core::{EventBus, EventRelay, FleetStore, register_writer, spawn_monitor};
use printwatch_proto::{PrintState, PrinterAdapter, ProtoError, Telemetry};

fn info(id: &str) -> PrinterInfo {
    PrinterInfo {
        id: PrinterId::from(id),
        name: format!("printer {id}"),
        protocol: PrinterProtocol::Prusa,
        address: "http://printer.invalid".into(),
    }
}

fn printing(job: &str) -> Telemetry {
    let mut t = Telemetry::connected(PrintState::Printing);
    t.job_id = Some(job.to_string());
    t.job_name = Some("benchy.gcode".to_string());
    t
}

fn in_state(state: PrintState, job: &str) -> Telemetry {
    let mut t = Telemetry::connected(state);
    t.job_id = Some(job.to_string());
    t
}

fn run_script(core: &mut MonitorCore, script: Vec<Telemetry>) -> Vec<Event> {
    let mut events = Vec::new();
    for reading in &script {
        events.extend(core.apply(reading));
    }
    events
}

fn count(events: &[Event], event_type: &str) -> usize {
    events.iter().filter(|e| e.event_type == event_type).count()
}

#[test]
fn full_lifecycle_with_pause_and_resume() {
    let mut core = MonitorCore::new(info("p1"), MonitorConfig::default());

    let events = run_script(
        &mut core,
        vec![
            Telemetry::connected(PrintState::Idle),
            printing("42"),
            in_state(PrintState::Paused, "42"),
            in_state(PrintState::Printing, "42"),
            in_state(PrintState::Completed, "42"),
            in_state(PrintState::Completed, "42"),
            in_state(PrintState::Completed, "42"),
        ],
    );

    assert_eq!(count(&events, event_types::JOB_STARTED), 1);
    assert_eq!(count(&events, event_types::JOB_COMPLETED), 1);
    // Exactly the pause and the resume; start and completion are
    // covered by their job events.
    assert_eq!(count(&events, event_types::PRINTER_STATE_CHANGED), 2);

    let changes: Vec<(&str, &str)> = events
        .iter()
        .filter(|e| e.event_type == event_types::PRINTER_STATE_CHANGED)
        .map(|e| {
            (
                e.data_str("old_state").unwrap(),
                e.data_str("new_state").unwrap(),
            )
        })
        .collect();
    assert_eq!(
        changes,
        vec![("printing", "paused"), ("paused", "printing")]
    );
}

#[test]
fn terminal_event_survives_reconnect_without_repeating() {
    let config = MonitorConfig {
        failure_threshold: 3,
        ..MonitorConfig::default()
    };
    let mut core = MonitorCore::new(info("p1"), config);

    let mut events = run_script(
        &mut core,
        vec![
            printing("42"),
            in_state(PrintState::Completed, "42"),
            Telemetry::unreachable(),
            Telemetry::unreachable(),
            Telemetry::unreachable(),
        ],
    );
    assert_eq!(count(&events, event_types::JOB_COMPLETED), 1);
    assert_eq!(count(&events, event_types::PRINTER_DISCONNECTED), 1);

    // Printer comes back still reporting the finished job.
    events.extend(core.apply(&in_state(PrintState::Completed, "42")));
    assert_eq!(count(&events, event_types::JOB_COMPLETED), 1);
    assert_eq!(count(&events, event_types::PRINTER_CONNECTED), 2);

    // A genuinely new job on the same printer still starts cleanly.
    events.extend(core.apply(&printing("43")));
    events.extend(core.apply(&in_state(PrintState::Completed, "43")));
    assert_eq!(count(&events, event_types::JOB_STARTED), 2);
    assert_eq!(count(&events, event_types::JOB_COMPLETED), 2);
}

#[test]
fn job_without_terminal_state_resolves_on_return_to_idle() {
    // REST protocols without a finished flag end a print as a bare
    // printing -> idle drop, and reuse the file path as the job id on
    // the next run.
    let mut core = MonitorCore::new(info("p1"), MonitorConfig::default());

    let events = run_script(
        &mut core,
        vec![
            Telemetry::connected(PrintState::Idle),
            printing("local/benchy.gcode"),
            Telemetry::connected(PrintState::Idle),
            printing("local/benchy.gcode"),
            Telemetry::connected(PrintState::Idle),
        ],
    );

    // Each drop back to idle resolves the held job, and the repeat of
    // the same file is a fresh start, not a stale replay.
    assert_eq!(count(&events, event_types::JOB_STARTED), 2);
    assert_eq!(count(&events, event_types::JOB_COMPLETED), 2);
    // Job events cover every transition; nothing is left dangling.
    assert_eq!(count(&events, event_types::PRINTER_STATE_CHANGED), 0);
    assert!(core.state().job.is_none());
}

#[test]
fn flapping_below_threshold_never_announces() {
    let mut core = MonitorCore::new(info("p1"), MonitorConfig::default());
    let mut events = core.apply(&Telemetry::connected(PrintState::Idle));

    for _ in 0..10 {
        events.extend(core.apply(&Telemetry::unreachable()));
        events.extend(core.apply(&Telemetry::unreachable()));
        events.extend(core.apply(&Telemetry::connected(PrintState::Idle)));
    }
    assert_eq!(count(&events, event_types::PRINTER_DISCONNECTED), 0);
    // Only the initial connect; blips below threshold are invisible.
    assert_eq!(count(&events, event_types::PRINTER_CONNECTED), 1);
}

#[test]
fn bare_connected_reading_produces_no_job_events() {
    let mut core = MonitorCore::new(info("p1"), MonitorConfig::default());
    let events = run_script(
        &mut core,
        vec![
            Telemetry::connected(PrintState::Idle),
            Telemetry::connected(PrintState::Idle),
            Telemetry::connected(PrintState::Idle),
        ],
    );
    assert_eq!(count(&events, event_types::JOB_STARTED), 0);
    assert_eq!(count(&events, event_types::JOB_COMPLETED), 0);
    assert!(core.state().job.is_none());
}

// ── Spawned-task path ───────────────────────────────────────────────

struct ScriptedAdapter {
    script: Mutex<VecDeque<Telemetry>>,
    idle_after: Telemetry,
}

impl ScriptedAdapter {
    fn new(script: Vec<Telemetry>, idle_after: Telemetry) -> Self {
        Self {
            script: Mutex::new(script.into()),
            idle_after,
        }
    }
}

#[async_trait]
impl PrinterAdapter for ScriptedAdapter {
    async fn connect(&self) -> Result<(), ProtoError> {
        Ok(())
    }

    async fn disconnect(&self) {}

    async fn get_status(&self) -> Telemetry {
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.idle_after.clone())
    }
}

#[tokio::test]
async fn spawned_monitor_publishes_to_bus_and_fleet_store() {
    let bus = Arc::new(EventBus::new());
    let relay = Arc::new(EventRelay::in_memory().unwrap());
    register_writer(&bus, Arc::clone(&relay));

    let seen = Arc::new(Mutex::new(Vec::<String>::new()));
    let sink = Arc::clone(&seen);
    bus.subscribe(printwatch_core::WILDCARD, move |event| {
        sink.lock().unwrap().push(event.event_type.clone());
        Ok(())
    });

    let adapter = Arc::new(ScriptedAdapter::new(
        vec![
            Telemetry::connected(PrintState::Idle),
            printing("7"),
            in_state(PrintState::Completed, "7"),
        ],
        in_state(PrintState::Completed, "7"),
    ));

    let config = MonitorConfig {
        poll_interval: Duration::from_millis(10),
        ..MonitorConfig::default()
    };
    let fleet = FleetStore::new();
    let handle = spawn_monitor(
        info("p1"),
        adapter,
        Arc::clone(&bus),
        config,
        CancellationToken::new(),
        None,
    );
    fleet.register(PrinterId::from("p1"), handle.state());

    // Wait until the completion event lands.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        {
            let types = seen.lock().unwrap();
            if types.iter().any(|t| t == event_types::JOB_COMPLETED) {
                break;
            }
        }
        assert!(tokio::time::Instant::now() < deadline, "timed out");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    handle.stop().await;

    let types = seen.lock().unwrap().clone();
    assert_eq!(
        types
            .iter()
            .filter(|t| *t == event_types::JOB_STARTED)
            .count(),
        1
    );
    assert_eq!(
        types
            .iter()
            .filter(|t| *t == event_types::JOB_COMPLETED)
            .count(),
        1
    );

    // The fleet store saw the final snapshot.
    let state = fleet.status(&PrinterId::from("p1")).unwrap();
    assert_eq!(state.print_state, PrintState::Completed);
    assert!(state.job.is_none());

    // Every bus event was mirrored into the relay in order.
    let records = relay.read_after(0, 100).unwrap();
    let relayed: Vec<&str> = records.iter().map(|r| r.event_type.as_str()).collect();
    assert_eq!(relayed, types.iter().map(String::as_str).collect::<Vec<_>>());
}
