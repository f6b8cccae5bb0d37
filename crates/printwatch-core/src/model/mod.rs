// ── Domain model ──

mod alert;
mod event;
mod printer;

pub use alert::{AlertDraft, AlertPreference, AlertRecord, Severity};
pub use event::{Event, Payload, event_types};
pub use printer::{JobContext, PrinterId, PrinterInfo, PrinterProtocol, PrinterState, UserId};
