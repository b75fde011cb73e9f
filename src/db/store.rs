//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, Result as SqlResult};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use super::models::*;
use crate::publish::{FaultEvent, PublishError, Publisher};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Database lock poisoned")]
    Poisoned,
}

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize the database with migrations.
    fn init(&self) -> Result<(), DbError> {
        let conn = self.lock()?;
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 1 failed: {}", e)))?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    // --- System state ---

    /// Insert or replace one state value.
    pub fn set_state(&self, key: &str, value: &str) -> Result<(), DbError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO system_state (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, Utc::now().format(TIME_FORMAT).to_string()],
        )?;
        Ok(())
    }

    /// Get every retained state value.
    pub fn get_state(&self) -> Result<BTreeMap<String, String>, DbError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT key, value FROM system_state")?;
        let state = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<SqlResult<BTreeMap<String, String>>>()?;
        Ok(state)
    }

    // --- Fault events ---

    /// Append an event and return its ID.
    pub fn add_event(&self, event: &FaultEvent) -> Result<i64, DbError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO fault_events (time, event_type, target, code, details, severity)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.time.format(TIME_FORMAT).to_string(),
                event.event_type.as_str(),
                event.target,
                event.code.as_str(),
                event.details,
                event.severity.as_str(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Get the most recent events, newest first.
    pub fn recent_events(&self, limit: u32) -> Result<Vec<StoredEvent>, DbError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, time, event_type, target, code, details, severity FROM fault_events
             ORDER BY time DESC, id DESC LIMIT ?1",
        )?;

        let events = stmt
            .query_map(params![limit], |row| {
                let time_str: String = row.get(1)?;
                let time = parse_db_time(&time_str).unwrap_or_else(Utc::now);
                Ok(StoredEvent {
                    id: row.get(0)?,
                    time,
                    event_type: row.get(2)?,
                    target: row.get(3)?,
                    code: row.get(4)?,
                    details: row.get(5)?,
                    severity: row.get(6)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(events)
    }
}

impl Publisher for Store {
    fn update_state(&self, key: &str, value: &str) -> Result<(), PublishError> {
        Ok(self.set_state(key, value)?)
    }

    fn log_event(&self, event: &FaultEvent) -> Result<(), PublishError> {
        self.add_event(event)?;
        Ok(())
    }
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [TIME_FORMAT, "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnosis::FaultCode;
    use crate::publish::{EventSeverity, EventType};
    use chrono::Duration;
    use tempfile::NamedTempFile;

    fn event(code: FaultCode, time: DateTime<Utc>) -> FaultEvent {
        FaultEvent {
            time,
            event_type: EventType::Outage,
            target: code.responsible_party().to_string(),
            code,
            details: "detail".to_string(),
            severity: EventSeverity::Critical,
        }
    }

    #[test]
    fn test_state_upsert() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();

        store.update_state("status", "HEALTHY").unwrap();
        store.update_state("jitter", "1.20").unwrap();
        store.update_state("status", "OUTAGE").unwrap();

        let state = store.get_state().unwrap();
        assert_eq!(state.len(), 2);
        assert_eq!(state.get("status").map(String::as_str), Some("OUTAGE"));
        assert_eq!(state.get("jitter").map(String::as_str), Some("1.20"));
    }

    #[test]
    fn test_events_newest_first() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();

        let now = Utc::now();
        store
            .log_event(&event(FaultCode::RouterDown, now - Duration::minutes(5)))
            .unwrap();
        store.log_event(&event(FaultCode::IspDns, now)).unwrap();

        let events = store.recent_events(10).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].code, "ISP_DNS");
        assert_eq!(events[1].code, "ROUTER_DOWN");
        assert_eq!(events[1].target, "YourRouter");
        assert_eq!(events[1].event_type, "OUTAGE");
        assert_eq!(events[1].severity, "CRITICAL");

        assert_eq!(store.recent_events(1).unwrap().len(), 1);
    }

    #[test]
    fn test_reopen_keeps_data() {
        let tmp = NamedTempFile::new().unwrap();
        {
            let store = Store::new(tmp.path()).unwrap();
            store.update_state("fault_code", "ISP_ROUTING").unwrap();
        }
        let store = Store::new(tmp.path()).unwrap();
        assert_eq!(
            store.get_state().unwrap().get("fault_code").map(String::as_str),
            Some("ISP_ROUTING")
        );
    }

    #[test]
    fn test_parse_db_time() {
        assert!(parse_db_time("2024-01-01 12:00:00.123456789").is_some());
        assert!(parse_db_time("2024-01-01 12:00:00").is_some());
        assert!(parse_db_time("2024-01-01T12:00:00Z").is_some());
        assert!(parse_db_time("yesterday").is_none());
    }
}
