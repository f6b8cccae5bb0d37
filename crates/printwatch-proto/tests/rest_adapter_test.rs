// Integration tests for the REST-poll adapters using wiremock.

use std::time::Duration;

use secrecy::SecretString;
use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use printwatch_proto::{
    Connectivity, OctoAdapter, OctoConfig, PrintState, PrinterAdapter, PrusaAdapter, PrusaConfig,
};

// ── Helpers ─────────────────────────────────────────────────────────

fn prusa(server: &MockServer) -> PrusaAdapter {
    PrusaAdapter::new(PrusaConfig {
        base_url: server.uri().parse().expect("mock server uri"),
        api_key: SecretString::from("test-key".to_string()),
        timeout: Duration::from_secs(2),
    })
    .expect("adapter")
}

fn octo(server: &MockServer) -> OctoAdapter {
    OctoAdapter::new(OctoConfig {
        base_url: server.uri().parse().expect("mock server uri"),
        api_key: SecretString::from("test-key".to_string()),
        timeout: Duration::from_secs(2),
    })
    .expect("adapter")
}

// ── Type A (PrusaLink-style) ────────────────────────────────────────

#[tokio::test]
async fn prusa_status_and_job_normalize() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/v1/status"))
        .and(header("x-api-key", "test-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "printer": {
                "state": "PRINTING",
                "temp_bed": 60.2, "target_bed": 60.0,
                "temp_nozzle": 215.0, "target_nozzle": 215.0
            },
            "job": { "progress": 33.0, "time_remaining": 3600, "time_printing": 1800 }
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/api/v1/job"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": 128,
            "file": { "display_name": "benchy.gcode" }
        })))
        .mount(&server)
        .await;

    let t = prusa(&server).get_status().await;

    assert_eq!(t.connectivity, Connectivity::Connected);
    assert_eq!(t.print_state, Some(PrintState::Printing));
    assert_eq!(t.progress_percent, Some(33.0));
    assert_eq!(t.remaining_min, Some(60));
    assert_eq!(t.elapsed_min, Some(30));
    assert_eq!(t.job_id.as_deref(), Some("128"));
    assert_eq!(t.job_name.as_deref(), Some("benchy.gcode"));
    assert_eq!(t.bed.current, Some(60.2));
}

#[tokio::test]
async fn prusa_no_active_job_returns_204() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/v1/status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "printer": { "state": "IDLE" }
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/api/v1/job"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let t = prusa(&server).get_status().await;
    assert_eq!(t.print_state, Some(PrintState::Idle));
    assert!(t.job_id.is_none());
    assert!(t.progress_percent.is_none());
}

#[tokio::test]
async fn prusa_unreachable_is_a_value_not_an_error() {
    let server = MockServer::start().await;
    let adapter = prusa(&server);
    // Kill the server so the poll hits a refused connection.
    drop(server);

    let t = adapter.get_status().await;
    assert_eq!(t.connectivity, Connectivity::Disconnected);
    assert!(t.print_state.is_none());
}

#[tokio::test]
async fn prusa_connect_rejects_bad_key() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/v1/status"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let err = prusa(&server).connect().await.expect_err("401 must fail");
    assert!(err.to_string().contains("rejected"));
}

#[tokio::test]
async fn prusa_failed_job_poll_degrades_gracefully() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/v1/status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "printer": { "state": "PRINTING" }
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/api/v1/job"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let t = prusa(&server).get_status().await;
    // Printer reading survives the broken job endpoint.
    assert_eq!(t.print_state, Some(PrintState::Printing));
    assert!(t.job_id.is_none());
}

// ── Type B (OctoPrint-style) ────────────────────────────────────────

#[tokio::test]
async fn octo_flags_and_job_normalize() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/printer"))
        .and(header("x-api-key", "test-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "state": { "flags": { "printing": true, "operational": true } },
            "temperature": {
                "tool0": { "actual": 210.1, "target": 210.0 },
                "bed": { "actual": 55.0, "target": 55.0 }
            }
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/api/job"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "job": { "file": { "name": "vase.gcode", "path": "prints/vase.gcode" } },
            "progress": { "completion": 71.5, "printTime": 4000, "printTimeLeft": 1600 }
        })))
        .mount(&server)
        .await;

    let t = octo(&server).get_status().await;

    assert_eq!(t.print_state, Some(PrintState::Printing));
    assert_eq!(t.job_id.as_deref(), Some("prints/vase.gcode"));
    assert_eq!(t.progress_percent, Some(71.5));
    assert_eq!(t.elapsed_min, Some(66));
    assert_eq!(t.remaining_min, Some(26));
    assert_eq!(t.nozzle.current, Some(210.1));
}

#[tokio::test]
async fn octo_conflict_means_host_up_printer_offline() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/printer"))
        .respond_with(ResponseTemplate::new(409))
        .mount(&server)
        .await;

    let t = octo(&server).get_status().await;
    assert_eq!(t.connectivity, Connectivity::Connected);
    assert_eq!(t.print_state, Some(PrintState::Offline));
}

#[tokio::test]
async fn octo_partial_payload_leaves_fields_unset() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/printer"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "state": { "flags": { "operational": true } }
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/api/job"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;

    let t = octo(&server).get_status().await;
    assert_eq!(t.print_state, Some(PrintState::Idle));
    assert!(t.bed.current.is_none());
    assert!(t.job_name.is_none());
}
