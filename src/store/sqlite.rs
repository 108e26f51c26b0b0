//! SQLite-backed activity log.

use super::{ActivityLogRow, ActivityLogStore, StoreError};
use crate::event::{Event, EventType};
use async_trait::async_trait;
use rusqlite::{params, Connection, Row};
use std::path::Path;
use std::sync::Mutex;

pub struct SqliteActivityStore {
    conn: Mutex<Connection>,
    now_fn: Box<dyn Fn() -> i64 + Send + Sync>,
}

impl SqliteActivityStore {
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::new_with_timestamp_fn(db_path, Box::new(|| chrono::Utc::now().timestamp()))
    }

    /// Open (or create) the database with an injected clock for the
    /// `ingested_at` column. Used by tests needing deterministic rows.
    pub fn new_with_timestamp_fn(
        db_path: impl AsRef<Path>,
        now_fn: Box<dyn Fn() -> i64 + Send + Sync>,
    ) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Unavailable(e.to_string()))?;
            }
        }

        let conn = Connection::open(db_path)?;
        apply_pragmas(&conn)?;
        create_schema(&conn)?;

        log::info!("✅ Activity log store initialized");

        Ok(Self {
            conn: Mutex::new(conn),
            now_fn,
        })
    }

    /// In-memory database, schema included. Handy for tests that want real
    /// SQL semantics without touching disk.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        create_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            now_fn: Box::new(|| chrono::Utc::now().timestamp()),
        })
    }
}

fn apply_pragmas(conn: &Connection) -> Result<(), StoreError> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    log::debug!("📊 Enabled WAL mode for activity log database");
    Ok(())
}

fn create_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS activity_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_type TEXT NOT NULL,
            user_id TEXT,
            ip_address TEXT,
            user_agent TEXT,
            payload TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            ingested_at INTEGER NOT NULL
        )",
        [],
    )?;

    // Range-scan indexes backing the ETL Load stage
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_activity_user_ts ON activity_log(user_id, timestamp)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_activity_type_ts ON activity_log(event_type, timestamp)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_activity_ts ON activity_log(timestamp)",
        [],
    )?;

    Ok(())
}

fn row_from_sql(row: &Row<'_>) -> rusqlite::Result<ActivityLogRow> {
    let type_str: String = row.get(1)?;
    let payload_str: String = row.get(5)?;
    Ok(ActivityLogRow {
        id: row.get(0)?,
        event_type: EventType::from_str(&type_str).unwrap_or(EventType::Unknown),
        user_id: row.get(2)?,
        ip_address: row.get(3)?,
        user_agent: row.get(4)?,
        payload: serde_json::from_str(&payload_str).unwrap_or(serde_json::Value::Null),
        timestamp: row.get(6)?,
        ingested_at: row.get(7)?,
    })
}

const SELECT_COLUMNS: &str =
    "id, event_type, user_id, ip_address, user_agent, payload, timestamp, ingested_at";

#[async_trait]
impl ActivityLogStore for SqliteActivityStore {
    async fn append(&self, event: &Event) -> Result<i64, StoreError> {
        let payload = serde_json::to_string(&event.payload)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let ingested_at = (self.now_fn)();

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO activity_log
                (event_type, user_id, ip_address, user_agent, payload, timestamp, ingested_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                event.event_type.as_str(),
                event.origin.user_id,
                event.origin.ip_address,
                event.origin.user_agent,
                payload,
                event.timestamp,
                ingested_at,
            ],
        )?;

        Ok(conn.last_insert_rowid())
    }

    async fn query_range(
        &self,
        start_ts: i64,
        end_ts: i64,
    ) -> Result<Vec<ActivityLogRow>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM activity_log
             WHERE timestamp >= ?1 AND timestamp < ?2
             ORDER BY timestamp ASC, id ASC",
            SELECT_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![start_ts, end_ts], row_from_sql)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    async fn query_by_user(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<ActivityLogRow>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM activity_log
             WHERE user_id = ?1
             ORDER BY timestamp DESC, id DESC
             LIMIT ?2",
            SELECT_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![user_id, limit as i64], row_from_sql)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    async fn recent(&self, limit: usize) -> Result<Vec<ActivityLogRow>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM activity_log
             ORDER BY timestamp DESC, id DESC
             LIMIT ?1",
            SELECT_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![limit as i64], row_from_sql)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    async fn count(&self) -> Result<u64, StoreError> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM activity_log", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}
