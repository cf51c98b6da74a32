// src/store.rs
//! SQLite persistence for normalized alerts.
//!
//! The `alerts` table is keyed by the full 4-tuple
//! (alert_type, src_ip, sensor, attack_time). Inserts are `INSERT OR IGNORE`,
//! so re-ingesting an already stored event is a no-op.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use std::sync::{Mutex, MutexGuard};

/// Sensor name used when an event carries no recognizable host identity.
pub const UNKNOWN_SENSOR: &str = "unknown";

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Canonical alert row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AlertRecord {
    pub alert_type: String,
    pub src_ip: String,
    pub sensor: String,
    pub attack_time: DateTime<Utc>,
}

impl AlertRecord {
    /// Stored text form of `attack_time`.
    pub fn attack_time_text(&self) -> String {
        format_attack_time(&self.attack_time)
    }
}

/// Fixed-width UTC rendering (`2024-05-01T12:00:00.000000+00:00`).
///
/// Every stored timestamp and every prune cutoff goes through this, so TEXT
/// comparison in SQL orders the same way the instants do.
pub fn format_attack_time(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, false)
}

/// Row as read back by exporters and the HTTP API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredAlert {
    pub alert_type: String,
    pub src_ip: String,
    pub sensor: String,
    pub attack_time: String,
}

pub struct AlertStore {
    conn: Mutex<Connection>,
}

impl AlertStore {
    /// Open (or create) the store file, creating the parent directory if needed.
    pub fn open(path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|e| {
                tracing::error!(dir = %dir.display(), error = %e, "cannot create data dir");
                rusqlite::Error::InvalidPath(dir.to_path_buf())
            })?;
        }
        let conn = Connection::open(path)?;
        // overlapping jobs wait for each other's page commits
        conn.busy_timeout(BUSY_TIMEOUT)?;
        // WAL lets the API read while a fetch job is committing pages.
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        if !mode.eq_ignore_ascii_case("wal") {
            tracing::warn!(%mode, "journal_mode WAL not applied");
        }
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        tracing::debug!(path = %path.display(), "alert store ready");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, rusqlite::Error> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn init_schema(&self) -> Result<(), rusqlite::Error> {
        let conn = self.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS alerts (
                alert_type   TEXT,
                src_ip       TEXT,
                sensor       TEXT,
                attack_time  TEXT,
                UNIQUE(alert_type, src_ip, sensor, attack_time)
            );

            CREATE INDEX IF NOT EXISTS idx_alerts_type ON alerts(alert_type);
            CREATE INDEX IF NOT EXISTS idx_alerts_ip   ON alerts(src_ip);
            CREATE INDEX IF NOT EXISTS idx_alerts_time ON alerts(attack_time);
        "#,
        )?;
        Ok(())
    }

    /// Insert one page of records in a single transaction.
    /// Returns how many rows were actually created (duplicates are skipped).
    pub fn insert_batch(&self, records: &[AlertRecord]) -> Result<usize, rusqlite::Error> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let mut created = 0usize;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO alerts (alert_type, src_ip, sensor, attack_time)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for r in records {
                created += stmt.execute(params![
                    r.alert_type,
                    r.src_ip,
                    r.sensor,
                    r.attack_time_text()
                ])?;
            }
        }
        tx.commit()?;
        Ok(created)
    }

    /// Single-record convenience over [`insert_batch`](Self::insert_batch).
    pub fn insert(&self, record: &AlertRecord) -> Result<bool, rusqlite::Error> {
        Ok(self.insert_batch(std::slice::from_ref(record))? == 1)
    }

    /// Delete every row with `attack_time` strictly before `cutoff`.
    pub fn delete_older_than(&self, cutoff: &DateTime<Utc>) -> Result<usize, rusqlite::Error> {
        let conn = self.lock();
        conn.execute(
            "DELETE FROM alerts WHERE attack_time < ?1",
            params![format_attack_time(cutoff)],
        )
    }

    pub fn count(&self) -> Result<i64, rusqlite::Error> {
        let conn = self.lock();
        conn.query_row("SELECT COUNT(*) FROM alerts", [], |r| r.get(0))
    }

    /// All rows, newest first.
    pub fn list_recent(&self) -> Result<Vec<StoredAlert>, rusqlite::Error> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT alert_type, src_ip, sensor, attack_time
             FROM alerts ORDER BY attack_time DESC",
        )?;
        let rows = stmt.query_map([], row_to_alert)?;
        rows.collect()
    }

    /// Distinct rows oldest first, the order the MISP forwarder sends them in.
    pub fn list_for_forwarding(&self) -> Result<Vec<StoredAlert>, rusqlite::Error> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT alert_type, src_ip, sensor, attack_time
             FROM alerts ORDER BY attack_time ASC",
        )?;
        let rows = stmt.query_map([], row_to_alert)?;
        rows.collect()
    }

    pub fn distinct_source_ips(&self) -> Result<Vec<String>, rusqlite::Error> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT DISTINCT src_ip FROM alerts")?;
        let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
        rows.collect()
    }
}

fn row_to_alert(row: &rusqlite::Row<'_>) -> Result<StoredAlert, rusqlite::Error> {
    Ok(StoredAlert {
        alert_type: row.get(0)?,
        src_ip: row.get(1)?,
        sensor: row.get(2)?,
        attack_time: row.get(3)?,
    })
}
