//! Persistence Store
//!
//! Embedded SQLite storage for events, incidents and the audit chain.
//! One connection serialised behind a mutex, WAL journaling, cached prepared
//! statements, idempotent schema creation.

use crate::core::event::{timestamp_to_iso8601, Event};
use crate::response::incident::Incident;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::path::Path;
use uuid::Uuid;

/// Storage errors
#[derive(Debug)]
pub enum StoreError {
    Sqlite(rusqlite::Error),
    Serde(serde_json::Error),
    Io(std::io::Error),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Sqlite(e) => write!(f, "Database error: {}", e),
            StoreError::Serde(e) => write!(f, "Serialization error: {}", e),
            StoreError::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Sqlite(e)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serde(e)
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e)
    }
}

/// Aggregate counters for the shared status view
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusSnapshot {
    pub active_incident_count: u64,
    pub total_incident_count: u64,
    pub total_event_count: u64,
    pub highest_risk_score: u32,
}

/// Raw audit row projection used by integrity verification and export
#[derive(Debug, Clone)]
pub struct AuditEntryRow {
    pub sequence_id: u64,
    pub timestamp: String,
    pub action: String,
    pub actor: String,
    pub target: String,
    pub details: String,
    pub prev_hash: String,
    pub entry_hash: String,
}

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (creating if needed) the database at `path` and run migrations.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        Self::configure(&conn)?;
        log::info!("Store initialized (db_path={})", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store, used by tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::configure(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn configure(conn: &Connection) -> Result<(), StoreError> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    // --- Events ---

    pub fn insert_event(&self, event: &Event, risk_score: u32) -> Result<(), StoreError> {
        let details = serde_json::to_string(&event.metadata)?;
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "INSERT INTO events (timestamp, event_type, pid, process_name, risk_score, details) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        stmt.execute(params![
            timestamp_to_iso8601(event.timestamp),
            event.kind.as_str(),
            event.pid,
            event.process_name,
            risk_score,
            details,
        ])?;
        Ok(())
    }

    /// Query events as JSON strings. The caller owns the `WHERE` clause; it
    /// must be parameterless and pre-escaped.
    pub fn query_events_json(
        &self,
        where_clause: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<String>, StoreError> {
        let mut sql = String::from(
            "SELECT timestamp, event_type, pid, process_name, risk_score, details FROM events",
        );
        if !where_clause.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(where_clause);
        }
        sql.push_str(&format!(" ORDER BY id DESC LIMIT {} OFFSET {}", limit, offset));

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| {
            let details: String = row.get(5)?;
            let details_value = serde_json::from_str::<serde_json::Value>(&details)
                .unwrap_or(serde_json::Value::String(details));
            let obj = serde_json::json!({
                "timestamp": row.get::<_, String>(0)?,
                "event_type": row.get::<_, String>(1)?,
                "pid": row.get::<_, u32>(2)?,
                "process_name": row.get::<_, String>(3)?,
                "risk_score": row.get::<_, u32>(4)?,
                "details": details_value,
            });
            Ok(obj.to_string())
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub fn event_count(&self) -> Result<u64, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT COUNT(*) FROM events")?;
        Ok(stmt.query_row([], |row| row.get(0))?)
    }

    // --- Incidents ---

    /// Full-row replace keyed by uuid; nested arrays JSON-serialised.
    pub fn upsert_incident(&self, incident: &Incident) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "INSERT OR REPLACE INTO incidents \
             (uuid, pid, process_name, state, created_at, updated_at, \
              associated_events, risk_timeline, containment_actions, state_history) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )?;
        stmt.execute(params![
            incident.uuid.to_string(),
            incident.pid,
            incident.process_name,
            incident.state.as_str(),
            timestamp_to_iso8601(incident.created_at),
            timestamp_to_iso8601(incident.updated_at),
            incident.events_to_json().to_string(),
            incident.risk_to_json().to_string(),
            incident.actions_to_json().to_string(),
            incident.history_to_json().to_string(),
        ])?;
        Ok(())
    }

    pub fn load_incident(&self, uuid: &Uuid) -> Result<Option<Incident>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT uuid, pid, process_name, state, created_at, updated_at, \
             associated_events, risk_timeline, containment_actions, state_history \
             FROM incidents WHERE uuid = ?1",
        )?;
        let mut rows = stmt.query(params![uuid.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(incident_from_row(row)),
            None => Ok(None),
        }
    }

    pub fn load_all_incidents(&self) -> Result<Vec<Incident>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT uuid, pid, process_name, state, created_at, updated_at, \
             associated_events, risk_timeline, containment_actions, state_history \
             FROM incidents",
        )?;
        let mut rows = stmt.query([])?;
        let mut results = Vec::new();
        while let Some(row) = rows.next()? {
            if let Some(incident) = incident_from_row(row) {
                results.push(incident);
            }
        }
        Ok(results)
    }

    // --- Audit log ---

    pub fn insert_audit_entry(
        &self,
        timestamp_ms: u64,
        action: &str,
        actor: &str,
        target: &str,
        details: &str,
        prev_hash: &str,
        entry_hash: &str,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "INSERT INTO audit_log (timestamp, action, actor, target, details, prev_hash, entry_hash) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )?;
        stmt.execute(params![
            timestamp_to_iso8601(timestamp_ms),
            action,
            actor,
            target,
            details,
            prev_hash,
            entry_hash,
        ])?;
        Ok(())
    }

    /// Raw audit rows ordered by sequence id. `limit == 0` means no limit.
    pub fn query_audit_entries_raw(
        &self,
        where_clause: &str,
        limit: u32,
        offset: u32,
        descending: bool,
    ) -> Result<Vec<AuditEntryRow>, StoreError> {
        let mut sql = String::from(
            "SELECT sequence_id, timestamp, action, actor, target, details, prev_hash, entry_hash \
             FROM audit_log",
        );
        if !where_clause.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(where_clause);
        }
        sql.push_str(if descending {
            " ORDER BY sequence_id DESC"
        } else {
            " ORDER BY sequence_id ASC"
        });
        if limit > 0 {
            sql.push_str(&format!(" LIMIT {} OFFSET {}", limit, offset));
        }

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| {
            Ok(AuditEntryRow {
                sequence_id: row.get(0)?,
                timestamp: row.get(1)?,
                action: row.get(2)?,
                actor: row.get(3)?,
                target: row.get(4)?,
                details: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
                prev_hash: row.get(6)?,
                entry_hash: row.get(7)?,
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub fn audit_entry_count(&self) -> Result<u64, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT COUNT(*) FROM audit_log")?;
        Ok(stmt.query_row([], |row| row.get(0))?)
    }

    // --- Status aggregation ---

    pub fn status_snapshot(&self) -> Result<StatusSnapshot, StoreError> {
        let conn = self.conn.lock();
        let total_event_count: u64 = conn
            .prepare_cached("SELECT COUNT(*) FROM events")?
            .query_row([], |row| row.get(0))?;
        let highest_risk_score: u32 = conn
            .prepare_cached("SELECT COALESCE(MAX(risk_score), 0) FROM events")?
            .query_row([], |row| row.get(0))?;
        let active_incident_count: u64 = conn
            .prepare_cached("SELECT COUNT(*) FROM incidents WHERE state != 'CLOSED'")?
            .query_row([], |row| row.get(0))?;
        let total_incident_count: u64 = conn
            .prepare_cached("SELECT COUNT(*) FROM incidents")?
            .query_row([], |row| row.get(0))?;

        Ok(StatusSnapshot {
            active_incident_count,
            total_incident_count,
            total_event_count,
            highest_risk_score,
        })
    }
}

fn incident_from_row(row: &rusqlite::Row<'_>) -> Option<Incident> {
    let uuid: String = row.get(0).ok()?;
    let pid: u32 = row.get(1).ok()?;
    let process_name: String = row.get(2).ok()?;
    let state: String = row.get(3).ok()?;
    let created_at: String = row.get(4).ok()?;
    let updated_at: String = row.get(5).ok()?;
    let events_json: String = row.get::<_, Option<String>>(6).ok()?.unwrap_or_default();
    let risk_json: String = row.get::<_, Option<String>>(7).ok()?.unwrap_or_default();
    let actions_json: String = row.get::<_, Option<String>>(8).ok()?.unwrap_or_default();
    let history_json: String = row.get::<_, Option<String>>(9).ok()?.unwrap_or_default();

    Incident::from_columns(
        &uuid,
        pid,
        &process_name,
        &state,
        &created_at,
        &updated_at,
        &events_json,
        &risk_json,
        &actions_json,
        &history_json,
    )
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS events (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp    TEXT    NOT NULL,
    event_type   TEXT    NOT NULL,
    pid          INTEGER NOT NULL,
    process_name TEXT    NOT NULL,
    risk_score   INTEGER DEFAULT 0,
    details      TEXT,
    created_at   TEXT    DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp);
CREATE INDEX IF NOT EXISTS idx_events_type ON events(event_type);
CREATE INDEX IF NOT EXISTS idx_events_pid ON events(pid);
CREATE INDEX IF NOT EXISTS idx_events_risk ON events(risk_score);

CREATE TABLE IF NOT EXISTS incidents (
    uuid                TEXT PRIMARY KEY,
    pid                 INTEGER NOT NULL,
    process_name        TEXT    NOT NULL,
    state               TEXT    NOT NULL,
    created_at          TEXT    NOT NULL,
    updated_at          TEXT    NOT NULL,
    associated_events   TEXT,
    risk_timeline       TEXT,
    containment_actions TEXT,
    state_history       TEXT
);

CREATE INDEX IF NOT EXISTS idx_incidents_state ON incidents(state);
CREATE INDEX IF NOT EXISTS idx_incidents_pid ON incidents(pid);

CREATE TABLE IF NOT EXISTS audit_log (
    sequence_id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp   TEXT    NOT NULL,
    action      TEXT    NOT NULL,
    actor       TEXT    NOT NULL,
    target      TEXT    NOT NULL,
    details     TEXT,
    prev_hash   TEXT    NOT NULL,
    entry_hash  TEXT    NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_log(timestamp);
CREATE INDEX IF NOT EXISTS idx_audit_action ON audit_log(action);
";
