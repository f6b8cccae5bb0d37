// printwatch-core: fleet monitoring and event dispatch.
//
// The pipeline, end to end:
//
//   adapter -> MonitorCore -> EventBus -> { relay writer, alert dispatcher }
//                   |
//                   +-> watch snapshots -> FleetStore
//
// Monitors own printer state, the bus decouples producers from
// consumers inside one process, the relay carries events across the
// process boundary, and the dispatcher turns them into notifications.

pub mod bus;
pub mod dispatch;
pub mod error;
pub mod fleet;
pub mod model;
pub mod monitor;
pub mod registry;
pub mod relay;

pub use bus::{EventBus, HandlerError, SubscriptionId, WILDCARD};
pub use dispatch::{
    AlertConfig, AlertDispatcher, AlertStore, DispatcherHandle, QuietHours, spawn_dispatcher,
};
pub use error::CoreError;
pub use fleet::FleetStore;
pub use model::{
    AlertDraft, AlertPreference, AlertRecord, Event, JobContext, Payload, PrinterId, PrinterInfo,
    PrinterProtocol, PrinterState, Severity, UserId, event_types,
};
pub use monitor::{MonitorConfig, MonitorCore, MonitorHandle, spawn_monitor};
pub use registry::{
    JobStateProvider, NotificationDispatcher, NullJobState, OrgSettingsProvider, PendingJob,
    PrinterStateProvider, Runtime, RuntimeBuilder, StaticOrgSettings,
};
pub use relay::{
    EventRelay, RelayRecord, RelayRetention, register_writer, spawn_janitor, spawn_tailer,
};
