// ── Alert persistence ──
//
// In-app alerts and per-user preferences live in SQLite, in the same
// database file as the relay so one path in config covers both. The
// dedup query here is what makes alert creation idempotent within the
// suppression window.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, params};

use crate::error::CoreError;
use crate::model::{AlertPreference, AlertRecord, Severity, UserId};

pub struct AlertStore {
    conn: Mutex<Connection>,
}

impl AlertStore {
    pub fn in_memory() -> Result<Self, CoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open(path: &Path) -> Result<Self, CoreError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), CoreError> {
        self.lock().execute_batch(
            "CREATE TABLE IF NOT EXISTS alerts (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                alert_type TEXT NOT NULL,
                severity TEXT NOT NULL,
                title TEXT NOT NULL,
                message TEXT NOT NULL,
                printer_id TEXT,
                job_id TEXT,
                spool_id TEXT,
                is_read INTEGER NOT NULL DEFAULT 0,
                is_dismissed INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_alerts_dedup
                ON alerts (user_id, alert_type, created_at);
            CREATE TABLE IF NOT EXISTS alert_preferences (
                user_id TEXT NOT NULL,
                alert_type TEXT NOT NULL,
                in_app INTEGER NOT NULL,
                push INTEGER NOT NULL,
                email INTEGER NOT NULL,
                threshold REAL,
                PRIMARY KEY (user_id, alert_type)
            );",
        )?;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert(&self, record: &AlertRecord) -> Result<(), CoreError> {
        self.lock().execute(
            "INSERT INTO alerts (id, user_id, alert_type, severity, title, message,
                printer_id, job_id, spool_id, is_read, is_dismissed, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                &record.id,
                record.user_id.0,
                &record.alert_type,
                severity_str(record.severity),
                &record.title,
                &record.message,
                &record.printer_id,
                &record.job_id,
                &record.spool_id,
                record.is_read,
                record.is_dismissed,
                record.created_at.timestamp(),
            ],
        )?;
        Ok(())
    }

    /// True when an unresolved alert with the same dedup key exists
    /// inside the suppression window. "Unresolved" means neither read
    /// nor dismissed; a resolved alert does not suppress a fresh one.
    pub fn recent_unresolved_exists(
        &self,
        user: &UserId,
        alert_type: &str,
        related_entity: Option<&str>,
        window: Duration,
    ) -> Result<bool, CoreError> {
        let since = chrono::Utc::now().timestamp() - window.as_secs() as i64;
        let count: i64 = self.lock().query_row(
            "SELECT COUNT(*) FROM alerts
             WHERE user_id = ?1 AND alert_type = ?2
               AND COALESCE(spool_id, job_id, printer_id, '') = COALESCE(?3, '')
               AND is_read = 0 AND is_dismissed = 0
               AND created_at >= ?4",
            params![user.0, alert_type, related_entity, since],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn mark_read(&self, alert_id: &str) -> Result<(), CoreError> {
        self.lock().execute(
            "UPDATE alerts SET is_read = 1 WHERE id = ?1",
            params![alert_id],
        )?;
        Ok(())
    }

    pub fn mark_dismissed(&self, alert_id: &str) -> Result<(), CoreError> {
        self.lock().execute(
            "UPDATE alerts SET is_dismissed = 1 WHERE id = ?1",
            params![alert_id],
        )?;
        Ok(())
    }

    pub fn list_for_user(&self, user: &UserId, limit: usize) -> Result<Vec<AlertRecord>, CoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, alert_type, severity, title, message,
                    printer_id, job_id, spool_id, is_read, is_dismissed, created_at
             FROM alerts WHERE user_id = ?1
             ORDER BY created_at DESC, id DESC LIMIT ?2",
        )?;
        let mut rows = stmt.query(params![user.0, limit as i64])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(parse_alert_row(row)?);
        }
        Ok(records)
    }

    pub fn seed_preferences(&self, prefs: &[AlertPreference]) -> Result<(), CoreError> {
        let conn = self.lock();
        for p in prefs {
            conn.execute(
                "INSERT INTO alert_preferences (user_id, alert_type, in_app, push, email, threshold)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(user_id, alert_type) DO UPDATE SET
                    in_app = excluded.in_app,
                    push = excluded.push,
                    email = excluded.email,
                    threshold = excluded.threshold",
                params![p.user_id.0, p.alert_type, p.in_app, p.push, p.email, p.threshold],
            )?;
        }
        Ok(())
    }

    /// Preference for `(user, alert_type)`, falling back to the user's
    /// `"*"` row, then to in-app only.
    pub fn preference(&self, user: &UserId, alert_type: &str) -> Result<AlertPreference, CoreError> {
        let conn = self.lock();
        let mut lookup = |at: &str| -> Result<Option<AlertPreference>, CoreError> {
            let pref = conn
                .query_row(
                    "SELECT in_app, push, email, threshold FROM alert_preferences
                     WHERE user_id = ?1 AND alert_type = ?2",
                    params![user.0, at],
                    |row| {
                        Ok(AlertPreference {
                            user_id: user.clone(),
                            alert_type: at.to_string(),
                            in_app: row.get(0)?,
                            push: row.get(1)?,
                            email: row.get(2)?,
                            threshold: row.get(3)?,
                        })
                    },
                )
                .optional()?;
            Ok(pref)
        };
        if let Some(pref) = lookup(alert_type)? {
            return Ok(pref);
        }
        if let Some(pref) = lookup("*")? {
            return Ok(pref);
        }
        Ok(AlertPreference {
            user_id: user.clone(),
            alert_type: alert_type.to_string(),
            in_app: true,
            push: false,
            email: false,
            threshold: None,
        })
    }
}

fn severity_str(s: Severity) -> &'static str {
    match s {
        Severity::Info => "info",
        Severity::Warning => "warning",
        Severity::Critical => "critical",
    }
}

fn parse_severity(s: &str) -> Severity {
    match s {
        "critical" => Severity::Critical,
        "warning" => Severity::Warning,
        _ => Severity::Info,
    }
}

fn parse_alert_row(row: &rusqlite::Row) -> Result<AlertRecord, rusqlite::Error> {
    let severity: String = row.get(3)?;
    let created_at: i64 = row.get(11)?;
    Ok(AlertRecord {
        id: row.get(0)?,
        user_id: UserId(row.get(1)?),
        alert_type: row.get(2)?,
        severity: parse_severity(&severity),
        title: row.get(4)?,
        message: row.get(5)?,
        printer_id: row.get(6)?,
        job_id: row.get(7)?,
        spool_id: row.get(8)?,
        is_read: row.get(9)?,
        is_dismissed: row.get(10)?,
        created_at: chrono::DateTime::from_timestamp(created_at, 0).unwrap_or_default(),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::AlertDraft;

    fn draft(alert_type: &str, spool: Option<&str>) -> AlertDraft {
        AlertDraft {
            alert_type: alert_type.to_string(),
            severity: Severity::Warning,
            title: "t".into(),
            message: "m".into(),
            printer_id: Some("p1".into()),
            job_id: None,
            spool_id: spool.map(String::from),
            target_user: None,
        }
    }

    #[test]
    fn dedup_matches_same_key_within_window() {
        let store = AlertStore::in_memory().unwrap();
        let user = UserId("u1".to_string());
        let record = draft("spool_low", Some("p1:0")).into_record(user.clone());
        store.insert(&record).unwrap();

        let window = Duration::from_secs(1800);
        assert!(
            store
                .recent_unresolved_exists(&user, "spool_low", Some("p1:0"), window)
                .unwrap()
        );
        // Different spool: no suppression.
        assert!(
            !store
                .recent_unresolved_exists(&user, "spool_low", Some("p1:1"), window)
                .unwrap()
        );
        // Different type: no suppression.
        assert!(
            !store
                .recent_unresolved_exists(&user, "spool_empty", Some("p1:0"), window)
                .unwrap()
        );
    }

    #[test]
    fn dismissed_alert_does_not_suppress() {
        let store = AlertStore::in_memory().unwrap();
        let user = UserId("u1".to_string());
        let record = draft("spool_low", Some("p1:0")).into_record(user.clone());
        store.insert(&record).unwrap();
        store.mark_dismissed(&record.id).unwrap();

        assert!(
            !store
                .recent_unresolved_exists(
                    &user,
                    "spool_low",
                    Some("p1:0"),
                    Duration::from_secs(1800)
                )
                .unwrap()
        );
    }

    #[test]
    fn preference_falls_back_to_wildcard_then_default() {
        let store = AlertStore::in_memory().unwrap();
        let user = UserId("u1".to_string());
        store
            .seed_preferences(&[AlertPreference {
                user_id: user.clone(),
                alert_type: "*".into(),
                in_app: true,
                push: true,
                email: false,
                threshold: None,
            }])
            .unwrap();

        let pref = store.preference(&user, "spool_low").unwrap();
        assert!(pref.push);

        let other = UserId("nobody".to_string());
        let fallback = store.preference(&other, "spool_low").unwrap();
        assert!(fallback.in_app);
        assert!(!fallback.push);
        assert!(!fallback.email);
    }

    #[test]
    fn list_returns_newest_first() {
        let store = AlertStore::in_memory().unwrap();
        let user = UserId("u1".to_string());
        for i in 0..3 {
            let mut r = draft("job_done", None).into_record(user.clone());
            r.title = format!("alert {i}");
            store.insert(&r).unwrap();
        }
        let listed = store.list_for_user(&user, 10).unwrap();
        assert_eq!(listed.len(), 3);
    }
}
