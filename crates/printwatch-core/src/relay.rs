// ── Cross-process event relay ──
//
// Monitor processes and the API process do not share memory. Events
// cross that boundary through a SQLite table: the writer side appends
// every bus event, the tailer side polls with a cursor. The sequence
// column is the AUTOINCREMENT rowid, so committed writes are strictly
// increasing with no gaps inside the retention window, and a tailer
// that remembers its cursor resumes without loss or duplication.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{Connection, params};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bus::{EventBus, SubscriptionId, WILDCARD};
use crate::error::CoreError;
use crate::model::Event;

/// One row read back from the relay.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayRecord {
    /// Strictly increasing, assigned by the database at commit.
    pub sequence: i64,
    pub event_type: String,
    pub source: String,
    pub payload: Value,
    /// Unix seconds at append time.
    pub created_at: i64,
}

/// Retention policy applied by the janitor.
#[derive(Debug, Clone)]
pub struct RelayRetention {
    /// Rows older than this are deleted.
    pub max_age: Duration,
    /// Row-count cap; oldest rows beyond it are deleted.
    pub max_rows: u64,
}

impl Default for RelayRetention {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(24 * 3600),
            max_rows: 100_000,
        }
    }
}

/// Durable event log shared between processes through a SQLite file.
pub struct EventRelay {
    conn: Mutex<Connection>,
}

impl EventRelay {
    pub fn in_memory() -> Result<Self, CoreError> {
        let conn = Connection::open_in_memory()?;
        let relay = Self {
            conn: Mutex::new(conn),
        };
        relay.init_schema()?;
        Ok(relay)
    }

    pub fn open(path: &Path) -> Result<Self, CoreError> {
        let conn = Connection::open(path)?;
        // Readers in another process must not block the writer.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        let relay = Self {
            conn: Mutex::new(conn),
        };
        relay.init_schema()?;
        Ok(relay)
    }

    fn init_schema(&self) -> Result<(), CoreError> {
        self.lock().execute_batch(
            "CREATE TABLE IF NOT EXISTS relay_events (
                sequence INTEGER PRIMARY KEY AUTOINCREMENT,
                event_type TEXT NOT NULL,
                source TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_relay_events_created_at
                ON relay_events (created_at);",
        )?;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append one event. Returns the assigned sequence.
    pub fn append(&self, event: &Event) -> Result<i64, CoreError> {
        let payload = serde_json::to_string(&event.data)
            .map_err(|e| CoreError::Internal(format!("payload serialization: {e}")))?;
        let conn = self.lock();
        conn.execute(
            "INSERT INTO relay_events (event_type, source, payload, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                &event.event_type,
                &event.source,
                payload,
                event.timestamp.timestamp(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Read up to `limit` records with sequence strictly greater than
    /// `cursor`, in sequence order.
    pub fn read_after(&self, cursor: i64, limit: usize) -> Result<Vec<RelayRecord>, CoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT sequence, event_type, source, payload, created_at
             FROM relay_events
             WHERE sequence > ?1
             ORDER BY sequence ASC
             LIMIT ?2",
        )?;
        let mut rows = stmt.query(params![cursor, limit as i64])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            let payload_json: String = row.get(3)?;
            let payload = serde_json::from_str(&payload_json).unwrap_or(Value::Null);
            records.push(RelayRecord {
                sequence: row.get(0)?,
                event_type: row.get(1)?,
                source: row.get(2)?,
                payload,
                created_at: row.get(4)?,
            });
        }
        Ok(records)
    }

    /// Highest sequence committed so far, 0 when empty. New tailers that
    /// only want future events start from here.
    pub fn latest_sequence(&self) -> Result<i64, CoreError> {
        let seq: i64 = self.lock().query_row(
            "SELECT COALESCE(MAX(sequence), 0) FROM relay_events",
            [],
            |row| row.get(0),
        )?;
        Ok(seq)
    }

    /// Apply the retention policy. Returns the number of rows deleted.
    /// Pruning trims the oldest end only, so the sequence run of the
    /// surviving rows stays contiguous.
    pub fn prune(&self, retention: &RelayRetention) -> Result<usize, CoreError> {
        let cutoff = chrono::Utc::now().timestamp() - retention.max_age.as_secs() as i64;
        let conn = self.lock();
        let mut deleted = conn.execute(
            "DELETE FROM relay_events WHERE created_at < ?1",
            params![cutoff],
        )?;
        deleted += conn.execute(
            "DELETE FROM relay_events WHERE sequence <= (
                SELECT COALESCE(MAX(sequence), 0) - ?1 FROM relay_events
            )",
            params![retention.max_rows as i64],
        )?;
        Ok(deleted)
    }
}

/// Subscribe the relay to every event on the bus. An append failure is
/// logged and swallowed; in-process consumers must keep receiving even
/// when the disk is unhappy.
pub fn register_writer(bus: &EventBus, relay: Arc<EventRelay>) -> SubscriptionId {
    bus.subscribe(WILDCARD, move |event| {
        if let Err(e) = relay.append(event) {
            warn!(event_type = %event.event_type, error = %e, "relay append failed");
        }
        Ok(())
    })
}

/// Poll loop for the consuming process: reads past `cursor` on an
/// interval and forwards records in order. Stops when cancelled or when
/// the receiver side is dropped.
pub fn spawn_tailer(
    relay: Arc<EventRelay>,
    mut cursor: i64,
    poll_interval: Duration,
    cancel: CancellationToken,
    tx: mpsc::Sender<RelayRecord>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            let batch = match relay.read_after(cursor, 256) {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(cursor, error = %e, "relay read failed");
                    continue;
                }
            };
            for record in batch {
                cursor = record.sequence;
                if tx.send(record).await.is_err() {
                    return;
                }
            }
        }
    })
}

/// Periodic retention enforcement.
pub fn spawn_janitor(
    relay: Arc<EventRelay>,
    retention: RelayRetention,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match relay.prune(&retention) {
                Ok(0) => {}
                Ok(n) => debug!(deleted = n, "relay pruned"),
                Err(e) => warn!(error = %e, "relay prune failed"),
            }
        }
    })
}
