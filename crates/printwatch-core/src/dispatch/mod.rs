// ── Alert dispatcher ──
//
// Bus subscriber that turns domain events into user notifications.
// Policy runs on a dedicated task fed by an mpsc queue, so publishers
// never wait on preference lookups or network channels. Per recipient:
// map, preference check, dedup, quiet hours, persist, then fan out to
// channels under independent timeouts.

pub mod channels;
pub mod digest;
pub mod store;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bus::{EventBus, WILDCARD};
use crate::error::CoreError;
use crate::model::{AlertDraft, AlertPreference, AlertRecord, Event, Severity, UserId, event_types};
use crate::registry::OrgSettingsProvider;

pub use channels::{
    BotWebhookChannel, ChannelError, EmailChannel, MqttRepublishChannel, NotificationChannel,
    NtfyChannel, PushChannel, PushSubscription, SmtpSettings, WebhookChannel,
};
pub use digest::{DigestQueue, QuietHours};
pub use store::AlertStore;

/// Dispatcher policy knobs.
#[derive(Debug, Clone)]
pub struct AlertConfig {
    /// Dedup window for `(user, alert_type, related_entity)`.
    pub suppression_window: Duration,
    /// Hard cap on each channel delivery attempt.
    pub channel_timeout: Duration,
    /// How often the dispatcher checks for a pending digest flush on
    /// its own, in addition to monitor heartbeats.
    pub digest_check_interval: Duration,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            suppression_window: Duration::from_secs(30 * 60),
            channel_timeout: Duration::from_secs(10),
            digest_check_interval: Duration::from_secs(60),
        }
    }
}

/// Who receives fleet-wide alerts. The membership module owns the real
/// answer; this seam keeps the dispatcher free of it.
pub trait UserDirectory: Send + Sync {
    fn alert_recipients(&self) -> Vec<UserId>;
}

/// Fixed recipient list, seeded from configuration.
pub struct StaticDirectory(pub Vec<UserId>);

impl UserDirectory for StaticDirectory {
    fn alert_recipients(&self) -> Vec<UserId> {
        self.0.clone()
    }
}

pub struct AlertDispatcher {
    store: Arc<AlertStore>,
    directory: Arc<dyn UserDirectory>,
    /// Org-level policy the dispatcher reads live: quiet hours can be
    /// changed without restarting the worker.
    settings: Arc<dyn OrgSettingsProvider>,
    channels: Vec<Arc<dyn NotificationChannel>>,
    config: AlertConfig,
    digest: DigestQueue,
}

impl AlertDispatcher {
    pub fn new(
        store: Arc<AlertStore>,
        directory: Arc<dyn UserDirectory>,
        settings: Arc<dyn OrgSettingsProvider>,
        channels: Vec<Arc<dyn NotificationChannel>>,
        config: AlertConfig,
    ) -> Self {
        Self {
            store,
            directory,
            settings,
            channels,
            config,
            digest: DigestQueue::new(),
        }
    }

    pub fn store(&self) -> &Arc<AlertStore> {
        &self.store
    }

    /// Process one event at the current wall-clock time.
    pub async fn handle_event(&self, event: &Event) {
        if let Some(draft) = map_event(event) {
            self.process_at(draft, chrono::Local::now().time()).await;
        }
    }

    /// Full policy pass for one draft. `now` is the local time used for
    /// the quiet-hours check.
    pub async fn process_at(&self, draft: AlertDraft, now: chrono::NaiveTime) {
        let mut recipients = self.directory.alert_recipients();
        if let Some(target) = &draft.target_user {
            if !recipients.contains(target) {
                recipients.push(target.clone());
            }
        }

        let quiet = self
            .settings
            .quiet_hours()
            .is_some_and(|window| window.contains(now));

        for user in recipients {
            let pref = match self.store.preference(&user, &draft.alert_type) {
                Ok(pref) => pref,
                Err(e) => {
                    warn!(user = %user, error = %e, "preference lookup failed");
                    continue;
                }
            };
            if !pref.any_channel_enabled() {
                continue;
            }

            let related = draft
                .spool_id
                .as_deref()
                .or(draft.job_id.as_deref())
                .or(draft.printer_id.as_deref());
            let duplicate = self
                .store
                .recent_unresolved_exists(
                    &user,
                    &draft.alert_type,
                    related,
                    self.config.suppression_window,
                )
                .unwrap_or_else(|e| {
                    warn!(user = %user, error = %e, "dedup query failed");
                    false
                });

            // A duplicate inside the window never creates a second
            // in-app record, but channels are still attempted: each
            // channel's own state decides what a resend means.
            let record = draft.clone().into_record(user);
            if duplicate {
                debug!(alert_type = %record.alert_type, user = %record.user_id,
                    "duplicate alert, record suppressed");
            } else if let Err(e) = self.store.insert(&record) {
                warn!(error = %e, "alert persist failed");
            }

            if quiet && record.severity < Severity::Critical {
                if !duplicate {
                    debug!(alert_type = %record.alert_type, "deferred to digest");
                    self.digest.enqueue(record);
                }
                continue;
            }

            self.deliver(&record, &pref).await;
        }
    }

    /// Flush the digest queue if we are outside the quiet window.
    /// Invoked from monitor heartbeats and from the dispatcher's own
    /// ticker; cheap when there is nothing queued.
    pub async fn flush_digest_at(&self, now: chrono::NaiveTime) {
        let quiet = self
            .settings
            .quiet_hours()
            .is_some_and(|window| window.contains(now));
        if quiet || self.digest.is_empty() {
            return;
        }

        for (user, records) in self.digest.drain() {
            let summary = digest::summarize(&user, &records);
            let pref = match self.store.preference(&user, &summary.alert_type) {
                Ok(pref) => pref,
                Err(e) => {
                    warn!(user = %user, error = %e, "digest preference lookup failed");
                    continue;
                }
            };
            let record = summary.into_record(user);
            if let Err(e) = self.store.insert(&record) {
                warn!(error = %e, "digest persist failed");
            }
            self.deliver(&record, &pref).await;
        }
    }

    /// Fan out to every applicable channel. Channels run one after the
    /// other but fail independently: a timeout or error is logged and
    /// the next channel still runs.
    async fn deliver(&self, record: &AlertRecord, pref: &AlertPreference) {
        for channel in &self.channels {
            let enabled = match channel.name() {
                "push" => pref.push,
                "email" => pref.email,
                _ => true,
            };
            if !enabled || !channel.accepts(&record.user_id) {
                continue;
            }

            let outcome =
                tokio::time::timeout(self.config.channel_timeout, channel.deliver(record)).await;
            match outcome {
                Ok(Ok(())) => {
                    debug!(channel = channel.name(), alert = %record.id, "delivered");
                }
                Ok(Err(ChannelError::Permanent(e))) => {
                    warn!(channel = channel.name(), alert = %record.id, error = %e,
                        "permanent channel failure");
                }
                Ok(Err(ChannelError::Transient(e))) => {
                    warn!(channel = channel.name(), alert = %record.id, error = %e,
                        "channel delivery failed");
                }
                Err(_) => {
                    warn!(channel = channel.name(), alert = %record.id,
                        timeout_secs = self.config.channel_timeout.as_secs(),
                        "channel delivery timed out");
                }
            }
        }
    }
}

enum DispatchMsg {
    Event(Event),
    Draft(AlertDraft),
    DigestTick,
}

/// Handle to the running dispatcher task.
pub struct DispatcherHandle {
    tx: mpsc::Sender<DispatchMsg>,
    store: Arc<AlertStore>,
    suppression_window: Duration,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl DispatcherHandle {
    /// Queue a draft directly, bypassing event mapping. Used by modules
    /// that raise alerts without going through the bus.
    pub async fn dispatch(&self, draft: AlertDraft) -> Result<(), CoreError> {
        self.tx
            .send(DispatchMsg::Draft(draft))
            .await
            .map_err(|_| CoreError::Internal("alert dispatcher stopped".to_string()))
    }

    /// Would this alert currently be suppressed by the dedup window?
    pub fn is_suppressed(
        &self,
        user: &UserId,
        alert_type: &str,
        related_entity: Option<&str>,
    ) -> bool {
        self.store
            .recent_unresolved_exists(user, alert_type, related_entity, self.suppression_window)
            .unwrap_or(false)
    }

    /// Cheap callback for monitor heartbeats: nudges the digest check.
    pub fn heartbeat_hook(&self) -> Arc<dyn Fn() + Send + Sync> {
        let tx = self.tx.clone();
        Arc::new(move || {
            // Queue full just means a check is already pending.
            let _ = tx.try_send(DispatchMsg::DigestTick);
        })
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.join.await;
    }
}

/// Subscribe the dispatcher to the bus and start its worker task.
pub fn spawn_dispatcher(
    dispatcher: AlertDispatcher,
    bus: &EventBus,
    cancel: CancellationToken,
) -> DispatcherHandle {
    let (tx, mut rx) = mpsc::channel::<DispatchMsg>(256);
    let store = Arc::clone(dispatcher.store());
    let suppression_window = dispatcher.config.suppression_window;
    let check_interval = dispatcher.config.digest_check_interval;

    let bus_tx = tx.clone();
    bus.subscribe(WILDCARD, move |event| {
        if bus_tx.try_send(DispatchMsg::Event(event.clone())).is_err() {
            warn!(event_type = %event.event_type, "alert queue full, event dropped");
        }
        Ok(())
    });

    let task_cancel = cancel.clone();
    let join = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                _ = task_cancel.cancelled() => break,
                _ = ticker.tick() => {
                    dispatcher.flush_digest_at(chrono::Local::now().time()).await;
                }
                msg = rx.recv() => {
                    match msg {
                        Some(DispatchMsg::Event(event)) => dispatcher.handle_event(&event).await,
                        Some(DispatchMsg::Draft(draft)) => {
                            dispatcher.process_at(draft, chrono::Local::now().time()).await;
                        }
                        Some(DispatchMsg::DigestTick) => {
                            dispatcher.flush_digest_at(chrono::Local::now().time()).await;
                        }
                        None => break,
                    }
                }
            }
        }
    });

    DispatcherHandle {
        tx,
        store,
        suppression_window,
        cancel,
        join,
    }
}

/// Map a domain event to an alert draft, or `None` for event types that
/// never alert (connectivity restored, plain telemetry, state noise).
pub fn map_event(event: &Event) -> Option<AlertDraft> {
    let printer_id = event.data_str("printer_id").map(String::from);
    let printer_name = event
        .data_str("printer_name")
        .or(event.data_str("printer_id"))
        .unwrap_or(&event.source)
        .to_string();
    let target_user = event.data_str("user_id").map(|u| UserId(u.to_string()));

    let payload_severity = || match event.data_str("severity") {
        Some("critical") => Severity::Critical,
        Some("info") => Severity::Info,
        _ => Severity::Warning,
    };

    let draft = match event.event_type.as_str() {
        event_types::PRINTER_DISCONNECTED => AlertDraft {
            alert_type: "printer_offline".into(),
            severity: Severity::Warning,
            title: format!("Printer offline: {printer_name}"),
            message: format!("{printer_name} stopped responding and is considered offline."),
            printer_id,
            job_id: None,
            spool_id: None,
            target_user,
        },
        event_types::PRINTER_ERROR => AlertDraft {
            alert_type: "printer_error".into(),
            severity: payload_severity(),
            title: format!("Printer error: {printer_name}"),
            message: event
                .data_str("message")
                .unwrap_or("The printer reported an error state.")
                .to_string(),
            printer_id,
            job_id: None,
            spool_id: None,
            target_user,
        },
        event_types::PRINTER_HMS_CODE => AlertDraft {
            alert_type: "hms_code".into(),
            severity: payload_severity(),
            title: format!("Printer warning: {printer_name}"),
            message: format!(
                "{} (code {})",
                event.data_str("message").unwrap_or("Vendor code reported"),
                event.data_str("code").unwrap_or("unknown"),
            ),
            printer_id,
            job_id: None,
            spool_id: None,
            target_user,
        },
        event_types::JOB_COMPLETED => AlertDraft {
            alert_type: "job_complete".into(),
            severity: Severity::Info,
            title: format!("Print complete on {printer_name}"),
            message: job_message(event, "finished"),
            printer_id,
            job_id: event.data_str("job_id").map(String::from),
            spool_id: None,
            target_user,
        },
        event_types::JOB_FAILED => AlertDraft {
            alert_type: "job_failed".into(),
            severity: Severity::Warning,
            title: format!("Print failed on {printer_name}"),
            message: job_message(event, "failed"),
            printer_id,
            job_id: event.data_str("job_id").map(String::from),
            spool_id: None,
            target_user,
        },
        event_types::JOB_CANCELLED => AlertDraft {
            alert_type: "job_cancelled".into(),
            severity: Severity::Info,
            title: format!("Print cancelled on {printer_name}"),
            message: job_message(event, "was cancelled"),
            printer_id,
            job_id: event.data_str("job_id").map(String::from),
            spool_id: None,
            target_user,
        },
        event_types::INVENTORY_SPOOL_LOW => AlertDraft {
            alert_type: "spool_low".into(),
            severity: Severity::Warning,
            title: format!("Filament low on {printer_name}"),
            message: format!(
                "Slot {} is down to {}% remaining.",
                event
                    .data
                    .get("slot")
                    .map(ToString::to_string)
                    .unwrap_or_default(),
                event
                    .data
                    .get("remaining_percent")
                    .map(ToString::to_string)
                    .unwrap_or_else(|| "?".to_string()),
            ),
            printer_id,
            job_id: None,
            spool_id: event.data_str("spool_id").map(String::from),
            target_user,
        },
        event_types::INVENTORY_SPOOL_EMPTY => AlertDraft {
            alert_type: "spool_empty".into(),
            severity: Severity::Warning,
            title: format!("Spool empty on {printer_name}"),
            message: "A feeder slot ran out of filament.".to_string(),
            printer_id,
            job_id: None,
            spool_id: event.data_str("spool_id").map(String::from),
            target_user,
        },
        event_types::INVENTORY_CONSUMABLE_LOW => AlertDraft {
            alert_type: "consumable_low".into(),
            severity: Severity::Warning,
            title: "Consumable running low".to_string(),
            message: event
                .data_str("message")
                .unwrap_or("A tracked consumable is below its threshold.")
                .to_string(),
            printer_id,
            job_id: None,
            spool_id: None,
            target_user,
        },
        event_types::VISION_DETECTION => AlertDraft {
            alert_type: "vision_detection".into(),
            severity: Severity::Warning,
            title: format!("Possible print failure on {printer_name}"),
            message: event
                .data_str("message")
                .unwrap_or("The camera watcher flagged this print.")
                .to_string(),
            printer_id,
            job_id: event.data_str("job_id").map(String::from),
            spool_id: None,
            target_user,
        },
        event_types::VISION_AUTO_PAUSE => AlertDraft {
            alert_type: "vision_auto_pause".into(),
            severity: Severity::Critical,
            title: format!("Print auto-paused on {printer_name}"),
            message: "The print was paused automatically after a failure detection.".to_string(),
            printer_id,
            job_id: event.data_str("job_id").map(String::from),
            spool_id: None,
            target_user,
        },
        _ => return None,
    };
    Some(draft)
}

fn job_message(event: &Event, verb: &str) -> String {
    match event.data_str("job_name") {
        Some(name) => format!("\"{name}\" {verb}."),
        None => format!("The active print {verb}."),
    }
}
