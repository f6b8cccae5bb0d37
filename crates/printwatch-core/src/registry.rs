// ── Capability seams and the composition root ──
//
// Cross-module dependencies are typed interfaces wired once at startup,
// not a runtime lookup table. `RuntimeBuilder::build` refuses to
// produce a `Runtime` with any capability missing, so a wiring mistake
// is a startup error instead of a latent panic.

use std::sync::Arc;

use async_trait::async_trait;

use printwatch_proto::{FilamentSlot, PrintState};

use crate::dispatch::{DispatcherHandle, QuietHours};
use crate::error::CoreError;
use crate::model::{AlertDraft, PrinterId, PrinterInfo, PrinterState, UserId};

/// Read access to live printer state. Consumed by scheduling and the
/// camera watcher.
pub trait PrinterStateProvider: Send + Sync {
    fn printer_state(&self, id: &PrinterId) -> Option<Arc<PrinterState>>;
    fn printer_info(&self, id: &PrinterId) -> Option<PrinterInfo>;
    /// Printers currently reachable and idle.
    fn available_printers(&self) -> Vec<PrinterId>;
    fn printer_slots(&self, id: &PrinterId) -> Vec<FilamentSlot>;
}

/// A print job queued for a printer, as the scheduling module sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingJob {
    pub id: String,
    pub name: String,
    pub printer_id: Option<PrinterId>,
}

/// Job-queue access owned by the scheduling module.
#[async_trait]
pub trait JobStateProvider: Send + Sync {
    async fn pending_jobs(&self, printer: &PrinterId) -> Result<Vec<PendingJob>, CoreError>;
    async fn update_job_status(&self, job_id: &str, state: PrintState) -> Result<(), CoreError>;
}

/// Raise a user-facing alert without depending on dispatcher internals.
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn dispatch(&self, draft: AlertDraft) -> Result<(), CoreError>;
    fn is_suppressed(&self, user: &UserId, alert_type: &str, related_entity: Option<&str>)
    -> bool;
}

#[async_trait]
impl NotificationDispatcher for DispatcherHandle {
    async fn dispatch(&self, draft: AlertDraft) -> Result<(), CoreError> {
        DispatcherHandle::dispatch(self, draft).await
    }

    fn is_suppressed(
        &self,
        user: &UserId,
        alert_type: &str,
        related_entity: Option<&str>,
    ) -> bool {
        DispatcherHandle::is_suppressed(self, user, alert_type, related_entity)
    }
}

/// Org-level settings the dispatcher reads.
pub trait OrgSettingsProvider: Send + Sync {
    fn quiet_hours(&self) -> Option<QuietHours>;
    fn webhook_urls(&self) -> Vec<url::Url>;
}

/// Static settings loaded from configuration.
pub struct StaticOrgSettings {
    pub quiet_hours: Option<QuietHours>,
    pub webhook_urls: Vec<url::Url>,
}

impl OrgSettingsProvider for StaticOrgSettings {
    fn quiet_hours(&self) -> Option<QuietHours> {
        self.quiet_hours
    }

    fn webhook_urls(&self) -> Vec<url::Url> {
        self.webhook_urls.clone()
    }
}

/// Every capability, wired and validated.
#[derive(Clone)]
pub struct Runtime {
    printer_state: Arc<dyn PrinterStateProvider>,
    job_state: Arc<dyn JobStateProvider>,
    notifications: Arc<dyn NotificationDispatcher>,
    org_settings: Arc<dyn OrgSettingsProvider>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime").finish_non_exhaustive()
    }
}

impl Runtime {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::default()
    }

    pub fn printer_state(&self) -> &Arc<dyn PrinterStateProvider> {
        &self.printer_state
    }

    pub fn job_state(&self) -> &Arc<dyn JobStateProvider> {
        &self.job_state
    }

    pub fn notifications(&self) -> &Arc<dyn NotificationDispatcher> {
        &self.notifications
    }

    pub fn org_settings(&self) -> &Arc<dyn OrgSettingsProvider> {
        &self.org_settings
    }
}

#[derive(Default)]
pub struct RuntimeBuilder {
    printer_state: Option<Arc<dyn PrinterStateProvider>>,
    job_state: Option<Arc<dyn JobStateProvider>>,
    notifications: Option<Arc<dyn NotificationDispatcher>>,
    org_settings: Option<Arc<dyn OrgSettingsProvider>>,
}

impl RuntimeBuilder {
    pub fn printer_state(mut self, provider: Arc<dyn PrinterStateProvider>) -> Self {
        self.printer_state = Some(provider);
        self
    }

    pub fn job_state(mut self, provider: Arc<dyn JobStateProvider>) -> Self {
        self.job_state = Some(provider);
        self
    }

    pub fn notifications(mut self, dispatcher: Arc<dyn NotificationDispatcher>) -> Self {
        self.notifications = Some(dispatcher);
        self
    }

    pub fn org_settings(mut self, provider: Arc<dyn OrgSettingsProvider>) -> Self {
        self.org_settings = Some(provider);
        self
    }

    /// Fail fast: a missing capability is a startup error.
    pub fn build(self) -> Result<Runtime, CoreError> {
        Ok(Runtime {
            printer_state: self.printer_state.ok_or(CoreError::MissingCapability {
                capability: "PrinterStateProvider",
            })?,
            job_state: self.job_state.ok_or(CoreError::MissingCapability {
                capability: "JobStateProvider",
            })?,
            notifications: self.notifications.ok_or(CoreError::MissingCapability {
                capability: "NotificationDispatcher",
            })?,
            org_settings: self.org_settings.ok_or(CoreError::MissingCapability {
                capability: "OrgSettingsProvider",
            })?,
        })
    }
}

/// Job-state stub for deployments running without the scheduling
/// module: no queue, and status updates are dropped with a log line.
pub struct NullJobState;

#[async_trait]
impl JobStateProvider for NullJobState {
    async fn pending_jobs(&self, _printer: &PrinterId) -> Result<Vec<PendingJob>, CoreError> {
        Ok(Vec::new())
    }

    async fn update_job_status(&self, job_id: &str, state: PrintState) -> Result<(), CoreError> {
        tracing::debug!(job_id, state = %state, "no job queue attached, status update dropped");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::fleet::FleetStore;

    struct NoopNotifications;

    #[async_trait]
    impl NotificationDispatcher for NoopNotifications {
        async fn dispatch(&self, _draft: AlertDraft) -> Result<(), CoreError> {
            Ok(())
        }

        fn is_suppressed(&self, _: &UserId, _: &str, _: Option<&str>) -> bool {
            false
        }
    }

    #[test]
    fn missing_capability_fails_fast_with_its_name() {
        let err = Runtime::builder()
            .printer_state(Arc::new(FleetStore::new()))
            .job_state(Arc::new(NullJobState))
            .org_settings(Arc::new(StaticOrgSettings {
                quiet_hours: None,
                webhook_urls: Vec::new(),
            }))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("NotificationDispatcher"));
    }

    #[test]
    fn complete_wiring_builds() {
        let runtime = Runtime::builder()
            .printer_state(Arc::new(FleetStore::new()))
            .job_state(Arc::new(NullJobState))
            .notifications(Arc::new(NoopNotifications))
            .org_settings(Arc::new(StaticOrgSettings {
                quiet_hours: None,
                webhook_urls: Vec::new(),
            }))
            .build()
            .unwrap();
        assert!(runtime.printer_state().available_printers().is_empty());
    }
}
