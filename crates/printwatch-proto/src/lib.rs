// printwatch-proto: wire-protocol adapters and the normalized telemetry
// contract they all produce.
//
// One adapter per protocol family, four families total:
//   - bambu: vendor MQTT, push-style
//   - prusa: REST polling, type A
//   - octo:  REST polling, type B
//   - sdcp:  WebSocket with UDP discovery
//
// Everything downstream of this crate sees only `PrinterAdapter` and
// `Telemetry`.

pub mod adapter;
pub mod bambu;
pub mod codes;
pub mod error;
pub mod octo;
pub mod prusa;
pub mod sdcp;
pub mod telemetry;
pub mod transport;

// ── Primary re-exports ──────────────────────────────────────────────
pub use adapter::PrinterAdapter;
pub use error::ProtoError;
pub use telemetry::{
    Connectivity, Environment, FilamentSlot, PrintState, Telemetry, TempReading,
};
pub use transport::{TlsMode, TransportConfig};

pub use bambu::{BambuAdapter, BambuConfig};
pub use octo::{OctoAdapter, OctoConfig};
pub use prusa::{PrusaAdapter, PrusaConfig};
pub use sdcp::{SdcpAdapter, SdcpConfig, SdcpIdentity};
