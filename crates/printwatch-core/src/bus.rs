// ── In-process event bus ──
//
// Synchronous fan-out: publish delivers to every matching handler before
// returning, exact-type subscribers in registration order first, then
// wildcard subscribers. A handler that errors or panics is logged and
// isolated -- one broken consumer must never stop alerting or
// persistence for the rest of the fleet.
//
// The bus holds no history. It is valid only for the lifetime of the
// process; cross-process delivery goes through the relay.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::{error, trace};

use crate::model::Event;

/// Wildcard subscription key.
pub const WILDCARD: &str = "*";

/// Errors a handler may surface; logged, never propagated.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl From<String> for HandlerError {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for HandlerError {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

type Handler = Arc<dyn Fn(&Event) -> Result<(), HandlerError> + Send + Sync>;

/// Opaque handle for unsubscribing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Registry {
    by_type: HashMap<String, Vec<(SubscriptionId, Handler)>>,
    wildcard: Vec<(SubscriptionId, Handler)>,
}

/// Synchronous publish/subscribe router.
pub struct EventBus {
    registry: RwLock<Registry>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            registry: RwLock::new(Registry {
                by_type: HashMap::new(),
                wildcard: Vec::new(),
            }),
            next_id: AtomicU64::new(1),
        }
    }

    /// Subscribe a handler to an event type, or to [`WILDCARD`] for all
    /// events. Dispatch order is registration order within each group.
    pub fn subscribe<F>(&self, event_type: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let handler: Handler = Arc::new(handler);

        let mut registry = self.registry.write().unwrap_or_else(|e| e.into_inner());
        if event_type == WILDCARD {
            registry.wildcard.push((id, handler));
        } else {
            registry
                .by_type
                .entry(event_type.to_string())
                .or_default()
                .push((id, handler));
        }
        id
    }

    /// Remove a subscription. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut registry = self.registry.write().unwrap_or_else(|e| e.into_inner());
        for handlers in registry.by_type.values_mut() {
            handlers.retain(|(hid, _)| *hid != id);
        }
        registry.wildcard.retain(|(hid, _)| *hid != id);
    }

    /// Deliver an event to all matching handlers, synchronously.
    ///
    /// Handlers are snapshotted before dispatch, so a handler may
    /// subscribe or publish without deadlocking the bus.
    pub fn publish(&self, event: &Event) {
        let handlers: Vec<(SubscriptionId, Handler)> = {
            let registry = self.registry.read().unwrap_or_else(|e| e.into_inner());
            let exact = registry
                .by_type
                .get(&event.event_type)
                .into_iter()
                .flatten()
                .cloned();
            exact.chain(registry.wildcard.iter().cloned()).collect()
        };

        trace!(
            event_type = %event.event_type,
            source = %event.source,
            handlers = handlers.len(),
            "publishing event"
        );

        for (id, handler) in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(
                        event_type = %event.event_type,
                        subscription = id.0,
                        error = %e,
                        "event handler failed"
                    );
                }
                Err(_) => {
                    error!(
                        event_type = %event.event_type,
                        subscription = id.0,
                        "event handler panicked"
                    );
                }
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
