// ── Fleet store ──
//
// Read side of the monitors: one watch receiver per printer, holding
// the latest `Arc<PrinterState>` snapshot. Lookups never touch a
// monitor task; `borrow().clone()` is an Arc bump.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::watch;

use printwatch_proto::{Connectivity, FilamentSlot, PrintState};

use crate::model::{PrinterId, PrinterInfo, PrinterState};
use crate::registry::PrinterStateProvider;

#[derive(Default)]
pub struct FleetStore {
    printers: DashMap<PrinterId, watch::Receiver<Arc<PrinterState>>>,
}

impl FleetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a monitor's state channel. Replaces any previous entry
    /// for the same printer.
    pub fn register(&self, id: PrinterId, state: watch::Receiver<Arc<PrinterState>>) {
        self.printers.insert(id, state);
    }

    pub fn remove(&self, id: &PrinterId) {
        self.printers.remove(id);
    }

    pub fn ids(&self) -> Vec<PrinterId> {
        self.printers.iter().map(|e| e.key().clone()).collect()
    }

    /// Latest snapshot for one printer.
    pub fn status(&self, id: &PrinterId) -> Option<Arc<PrinterState>> {
        self.printers.get(id).map(|rx| rx.borrow().clone())
    }

    /// Latest snapshot for every printer, unordered.
    pub fn snapshot(&self) -> Vec<Arc<PrinterState>> {
        self.printers
            .iter()
            .map(|entry| entry.value().borrow().clone())
            .collect()
    }
}

impl PrinterStateProvider for FleetStore {
    fn printer_state(&self, id: &PrinterId) -> Option<Arc<PrinterState>> {
        self.status(id)
    }

    fn printer_info(&self, id: &PrinterId) -> Option<PrinterInfo> {
        self.status(id).map(|s| s.info.clone())
    }

    fn available_printers(&self) -> Vec<PrinterId> {
        self.snapshot()
            .into_iter()
            .filter(|s| {
                s.connectivity == Connectivity::Connected && s.print_state == PrintState::Idle
            })
            .map(|s| s.info.id.clone())
            .collect()
    }

    fn printer_slots(&self, id: &PrinterId) -> Vec<FilamentSlot> {
        self.status(id).map(|s| s.slots.clone()).unwrap_or_default()
    }
}
