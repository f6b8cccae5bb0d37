// ── Quiet hours and the digest queue ──
//
// During a quiet window, non-critical alerts skip immediate channel
// delivery and accumulate here instead. When the window ends the queue
// is flushed as one batched summary per user.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

use crate::model::{AlertDraft, AlertRecord, Severity, UserId};

/// A configured daily window. `start == end` means no window;
/// `start > end` wraps past midnight (e.g. 22:00-07:00).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuietHours {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl QuietHours {
    pub fn contains(&self, t: NaiveTime) -> bool {
        if self.start == self.end {
            return false;
        }
        if self.start < self.end {
            self.start <= t && t < self.end
        } else {
            t >= self.start || t < self.end
        }
    }
}

/// Alerts deferred during quiet hours, grouped per recipient.
#[derive(Default)]
pub struct DigestQueue {
    queued: Mutex<HashMap<UserId, Vec<AlertRecord>>>,
}

impl DigestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, record: AlertRecord) {
        self.lock()
            .entry(record.user_id.clone())
            .or_default()
            .push(record);
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Take everything queued, grouped by user.
    pub fn drain(&self) -> Vec<(UserId, Vec<AlertRecord>)> {
        self.lock().drain().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<UserId, Vec<AlertRecord>>> {
        self.queued.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Collapse one user's deferred alerts into a single summary draft.
/// Severity is the maximum over the batch.
pub fn summarize(user: &UserId, records: &[AlertRecord]) -> AlertDraft {
    let severity = records
        .iter()
        .map(|r| r.severity)
        .max()
        .unwrap_or(Severity::Info);
    let mut lines: Vec<String> = records
        .iter()
        .map(|r| format!("- {}: {}", r.title, r.message))
        .collect();
    lines.sort();
    AlertDraft {
        alert_type: "digest".to_string(),
        severity,
        title: format!("{} alerts during quiet hours", records.len()),
        message: lines.join("\n"),
        printer_id: None,
        job_id: None,
        spool_id: None,
        target_user: Some(user.clone()),
    }
}
