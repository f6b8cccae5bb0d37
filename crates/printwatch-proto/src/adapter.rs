// ── The one contract every wire protocol hides behind ──

use async_trait::async_trait;

use crate::error::ProtoError;
use crate::telemetry::Telemetry;

/// Uniform adapter contract over the four printer wire protocols.
///
/// One adapter owns one connection to one printer. `get_status` never
/// errors: a printer that cannot be reached yields
/// [`Telemetry::unreachable`](crate::Telemetry::unreachable), because
/// "unreachable" is a state the monitor must be able to hold, not an
/// exceptional condition.
#[async_trait]
pub trait PrinterAdapter: Send + Sync {
    /// Establish (or re-establish) the underlying connection.
    ///
    /// Push-style adapters start their subscription here; poll-style
    /// adapters may verify reachability and return immediately.
    async fn connect(&self) -> Result<(), ProtoError>;

    /// Tear down the connection. Idempotent.
    async fn disconnect(&self);

    /// Read the current normalized status.
    ///
    /// Bounded by the adapter's configured timeout. Fields the protocol
    /// does not report (or that were missing from this particular
    /// response) are left unset.
    async fn get_status(&self) -> Telemetry;
}
