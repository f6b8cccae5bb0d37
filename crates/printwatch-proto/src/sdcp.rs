//! WebSocket discovery/control adapter (SDCP-style).
//!
//! Identity comes first: the printer answers a UDP broadcast probe with
//! its name and mainboard id, and every subsequent WebSocket exchange is
//! addressed to that mainboard id. After discovery the adapter enters the
//! same read contract as the poll adapters: each `get_status` sends a
//! status-request frame and waits for the next status push.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};
use url::Url;

use crate::adapter::PrinterAdapter;
use crate::error::ProtoError;
use crate::telemetry::{Connectivity, PrintState, Telemetry, TempReading};

const DISCOVERY_PORT: u16 = 3000;
const DISCOVERY_PROBE: &str = "M99999";
const WEBSOCKET_PORT: u16 = 3030;
const CMD_REQUEST_STATUS: u8 = 0;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Connection settings for one SDCP-style printer.
#[derive(Debug, Clone)]
pub struct SdcpConfig {
    /// Printer hostname or IP.
    pub host: String,
    pub timeout: Duration,
}

/// Identity resolved by the discovery exchange.
#[derive(Debug, Clone)]
pub struct SdcpIdentity {
    pub name: String,
    pub mainboard_id: String,
    pub firmware: Option<String>,
}

struct SdcpSession {
    identity: SdcpIdentity,
    stream: WsStream,
}

pub struct SdcpAdapter {
    config: SdcpConfig,
    session: Mutex<Option<SdcpSession>>,
}

impl SdcpAdapter {
    pub fn new(config: SdcpConfig) -> Self {
        Self {
            config,
            session: Mutex::new(None),
        }
    }

    /// The identity from the last successful discovery, if connected.
    pub async fn identity(&self) -> Option<SdcpIdentity> {
        self.session.lock().await.as_ref().map(|s| s.identity.clone())
    }

    /// Broadcast the discovery probe and wait for this host's reply.
    async fn discover(&self) -> Result<SdcpIdentity, ProtoError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.set_broadcast(true)?;
        let target = format!("{}:{DISCOVERY_PORT}", self.config.host);
        socket.send_to(DISCOVERY_PROBE.as_bytes(), &target).await?;

        let mut buf = [0u8; 2048];
        let recv = tokio::time::timeout(self.config.timeout, socket.recv_from(&mut buf))
            .await
            .map_err(|_| ProtoError::Discovery("no reply to discovery probe".into()))?;
        let (len, _addr) = recv?;

        let reply: Value = serde_json::from_slice(&buf[..len])
            .map_err(|e| ProtoError::Discovery(format!("malformed discovery reply: {e}")))?;
        parse_discovery_reply(&reply)
    }

    async fn open_websocket(&self) -> Result<WsStream, ProtoError> {
        let url = Url::parse(&format!(
            "ws://{}:{WEBSOCKET_PORT}/websocket",
            self.config.host
        ))?;
        let connect = tokio_tungstenite::connect_async(url.as_str());
        let (stream, _response) = tokio::time::timeout(self.config.timeout, connect)
            .await
            .map_err(|_| ProtoError::Timeout {
                timeout_secs: self.config.timeout.as_secs(),
            })?
            .map_err(|e| ProtoError::WebSocket(e.to_string()))?;
        Ok(stream)
    }

    /// Request a status push and read frames until one arrives.
    async fn request_status(&self, session: &mut SdcpSession) -> Result<Telemetry, ProtoError> {
        let mainboard = &session.identity.mainboard_id;
        let request = json!({
            "Id": uuid::Uuid::new_v4().to_string(),
            "Data": {
                "Cmd": CMD_REQUEST_STATUS,
                "Data": {},
                "RequestID": uuid::Uuid::new_v4().simple().to_string(),
                "MainboardID": mainboard,
                "TimeStamp": chrono::Utc::now().timestamp(),
                "From": 0
            },
            "Topic": format!("sdcp/request/{mainboard}")
        });

        session
            .stream
            .send(Message::Text(request.to_string().into()))
            .await
            .map_err(|e| ProtoError::WebSocket(e.to_string()))?;

        let read = async {
            loop {
                match session.stream.next().await {
                    Some(Ok(Message::Text(text))) => {
                        let frame: Value = match serde_json::from_str(&text) {
                            Ok(v) => v,
                            Err(e) => {
                                trace!(error = %e, "unparseable frame, skipping");
                                continue;
                            }
                        };
                        if let Some(status) = frame.pointer("/Status") {
                            return Ok(normalize(status));
                        }
                        // Acks and attribute pushes are not status frames.
                        trace!("non-status frame, waiting for status push");
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => {
                        return Err(ProtoError::WebSocket("connection closed".into()));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(ProtoError::WebSocket(e.to_string())),
                }
            }
        };

        tokio::time::timeout(self.config.timeout, read)
            .await
            .map_err(|_| ProtoError::Timeout {
                timeout_secs: self.config.timeout.as_secs(),
            })?
    }
}

#[async_trait::async_trait]
impl PrinterAdapter for SdcpAdapter {
    async fn connect(&self) -> Result<(), ProtoError> {
        let identity = self.discover().await?;
        debug!(
            name = %identity.name,
            mainboard = %identity.mainboard_id,
            "discovery resolved printer identity"
        );
        let stream = self.open_websocket().await?;
        *self.session.lock().await = Some(SdcpSession { identity, stream });
        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(mut session) = self.session.lock().await.take() {
            let _ = session.stream.close(None).await;
        }
    }

    async fn get_status(&self) -> Telemetry {
        let mut guard = self.session.lock().await;
        let Some(session) = guard.as_mut() else {
            return Telemetry::unreachable();
        };

        match self.request_status(session).await {
            Ok(telemetry) => telemetry,
            Err(e) => {
                debug!(host = %self.config.host, error = %e, "status exchange failed");
                // Drop the session; the monitor's backoff path calls
                // connect() to rebuild it.
                *guard = None;
                Telemetry::unreachable()
            }
        }
    }
}

// ── Parsing ──────────────────────────────────────────────────────────

fn parse_discovery_reply(reply: &Value) -> Result<SdcpIdentity, ProtoError> {
    let data = reply
        .get("Data")
        .ok_or_else(|| ProtoError::Discovery("discovery reply missing Data".into()))?;

    let mainboard_id = data
        .get("MainboardID")
        .and_then(Value::as_str)
        .ok_or_else(|| ProtoError::Discovery("discovery reply missing MainboardID".into()))?
        .to_string();

    Ok(SdcpIdentity {
        name: data
            .get("Name")
            .and_then(Value::as_str)
            .unwrap_or("sdcp-printer")
            .to_string(),
        mainboard_id,
        firmware: data
            .get("FirmwareVersion")
            .and_then(Value::as_str)
            .map(String::from),
    })
}

// PrintInfo.Status values.
const PRINT_IDLE: u64 = 0;
const PRINT_PAUSING: u64 = 5;
const PRINT_PAUSED: u64 = 6;
const PRINT_STOPPING: u64 = 7;
const PRINT_STOPPED: u64 = 8;
const PRINT_COMPLETE: u64 = 9;

fn normalize(status: &Value) -> Telemetry {
    let mut t = Telemetry {
        connectivity: Connectivity::Connected,
        ..Telemetry::default()
    };

    let print_info = status.get("PrintInfo");
    if let Some(info) = print_info {
        if let Some(code) = info.get("Status").and_then(Value::as_u64) {
            t.print_state = Some(map_print_status(code));
        }
        t.progress_percent = info.get("Progress").and_then(Value::as_f64);
        t.layer_current = info
            .get("CurrentLayer")
            .and_then(Value::as_u64)
            .map(|v| v as u32);
        t.layer_total = info
            .get("TotalLayer")
            .and_then(Value::as_u64)
            .map(|v| v as u32);
        t.elapsed_min = info
            .get("CurrentTicks")
            .and_then(Value::as_u64)
            .map(|ms| (ms / 60_000) as u32);
        t.remaining_min = info
            .get("TotalTicks")
            .and_then(Value::as_u64)
            .zip(info.get("CurrentTicks").and_then(Value::as_u64))
            .map(|(total, current)| (total.saturating_sub(current) / 60_000) as u32);
        t.job_id = info
            .get("TaskId")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(String::from);
        t.job_name = info
            .get("Filename")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(String::from);

        t.error_code = info
            .get("ErrorNumber")
            .and_then(Value::as_u64)
            .filter(|&n| n != 0)
            .map(|n| format!("E{n:04}"));
        if t.error_code.is_some() {
            t.print_state = Some(PrintState::Error);
        }
    }

    t.bed = TempReading {
        current: status.get("TempOfHotbed").and_then(Value::as_f64),
        target: status.get("TempTargetHotbed").and_then(Value::as_f64),
    };
    t.nozzle = TempReading {
        current: status.get("TempOfNozzle").and_then(Value::as_f64),
        target: status.get("TempTargetNozzle").and_then(Value::as_f64),
    };

    t
}

fn map_print_status(code: u64) -> PrintState {
    match code {
        PRINT_IDLE => PrintState::Idle,
        PRINT_PAUSING | PRINT_PAUSED => PrintState::Paused,
        PRINT_STOPPING | PRINT_STOPPED => PrintState::Cancelled,
        PRINT_COMPLETE => PrintState::Completed,
        // Homing, exposure, lifting, file-checking: all mid-print.
        _ => PrintState::Printing,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn discovery_reply_parses_identity() {
        let reply = json!({
            "Id": "abc",
            "Data": {
                "Name": "Centauri Carbon",
                "MainboardID": "0001a3",
                "FirmwareVersion": "V1.1.25"
            }
        });
        let id = parse_discovery_reply(&reply).expect("identity");
        assert_eq!(id.name, "Centauri Carbon");
        assert_eq!(id.mainboard_id, "0001a3");
        assert_eq!(id.firmware.as_deref(), Some("V1.1.25"));
    }

    #[test]
    fn discovery_reply_without_mainboard_is_an_error() {
        let reply = json!({ "Data": { "Name": "x" } });
        assert!(parse_discovery_reply(&reply).is_err());
    }

    #[test]
    fn status_push_normalizes() {
        let status = json!({
            "TempOfHotbed": 59.8,
            "TempTargetHotbed": 60.0,
            "TempOfNozzle": 220.3,
            "TempTargetNozzle": 220.0,
            "PrintInfo": {
                "Status": 3,
                "Progress": 37.0,
                "CurrentLayer": 80,
                "TotalLayer": 214,
                "CurrentTicks": 1_800_000u64,
                "TotalTicks": 7_200_000u64,
                "Filename": "bracket.gcode",
                "TaskId": "t-991",
                "ErrorNumber": 0
            }
        });
        let t = normalize(&status);
        assert_eq!(t.print_state, Some(PrintState::Printing));
        assert_eq!(t.progress_percent, Some(37.0));
        assert_eq!(t.layer_current, Some(80));
        assert_eq!(t.elapsed_min, Some(30));
        assert_eq!(t.remaining_min, Some(90));
        assert_eq!(t.job_id.as_deref(), Some("t-991"));
        assert_eq!(t.bed.target, Some(60.0));
    }

    #[test]
    fn paused_and_terminal_status_codes() {
        for (code, expected) in [
            (PRINT_PAUSED, PrintState::Paused),
            (PRINT_STOPPED, PrintState::Cancelled),
            (PRINT_COMPLETE, PrintState::Completed),
            (PRINT_IDLE, PrintState::Idle),
        ] {
            let status = json!({ "PrintInfo": { "Status": code } });
            assert_eq!(normalize(&status).print_state, Some(expected));
        }
    }

    #[test]
    fn nonzero_error_number_forces_error_state() {
        let status = json!({ "PrintInfo": { "Status": 3, "ErrorNumber": 17 } });
        let t = normalize(&status);
        assert_eq!(t.print_state, Some(PrintState::Error));
        assert_eq!(t.error_code.as_deref(), Some("E0017"));
    }
}
