// ── Alert domain types ──

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::UserId;

/// Severity drives quiet-hours suppression policy only; channel
/// selection is entirely preference-driven.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// A user-facing alert derived from a domain event.
///
/// Created by the dispatcher; read/dismiss flags are mutated by the
/// user-facing API, never by monitors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub id: String,
    pub user_id: UserId,
    pub alert_type: String,
    pub severity: Severity,
    pub title: String,
    pub message: String,

    pub printer_id: Option<String>,
    pub job_id: Option<String>,
    pub spool_id: Option<String>,

    pub is_read: bool,
    pub is_dismissed: bool,
    pub created_at: DateTime<Utc>,
}

impl AlertRecord {
    /// The entity this alert is about, for dedup keying. Priority order
    /// matches how specific the alert is: spool, then job, then printer.
    pub fn related_entity(&self) -> Option<&str> {
        self.spool_id
            .as_deref()
            .or(self.job_id.as_deref())
            .or(self.printer_id.as_deref())
    }
}

/// Everything needed to create an alert, before a recipient is chosen.
#[derive(Debug, Clone)]
pub struct AlertDraft {
    pub alert_type: String,
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub printer_id: Option<String>,
    pub job_id: Option<String>,
    pub spool_id: Option<String>,
    /// Explicit target; when set, the user is notified in addition to
    /// role-resolved recipients.
    pub target_user: Option<UserId>,
}

impl AlertDraft {
    pub fn into_record(self, user_id: UserId) -> AlertRecord {
        AlertRecord {
            id: uuid::Uuid::new_v4().to_string(),
            user_id,
            alert_type: self.alert_type,
            severity: self.severity,
            title: self.title,
            message: self.message,
            printer_id: self.printer_id,
            job_id: self.job_id,
            spool_id: self.spool_id,
            is_read: false,
            is_dismissed: false,
            created_at: Utc::now(),
        }
    }
}

/// Per user, per alert type channel flags. Read-only to the dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertPreference {
    pub user_id: UserId,
    /// Alert type this preference applies to, or `"*"` for all.
    pub alert_type: String,
    pub in_app: bool,
    pub push: bool,
    pub email: bool,
    /// Optional numeric threshold (e.g. spool-low percent).
    pub threshold: Option<f64>,
}

impl AlertPreference {
    pub fn any_channel_enabled(&self) -> bool {
        self.in_app || self.push || self.email
    }
}
