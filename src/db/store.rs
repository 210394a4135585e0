//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, Transaction};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use super::models::*;
use crate::monitor::whole_seconds;

mod embedded {
    refinery::embed_migrations!("migrations");
}

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

const HEARTBEAT_COLUMNS: &str = "id, timestamp, connection_state, ipv4, ipv6, download_rate, \
     upload_rate, bytes_received, bytes_sent, metadata, received_at";

const DOWNTIME_COLUMNS: &str = "id, started_at, ended_at, duration, is_active, notes";

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Database lock poisoned")]
    LockPoisoned,
    #[error("A downtime event is already active")]
    ActiveDowntimeExists,
    #[error("Not found")]
    NotFound,
}

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let mut conn = Connection::open(path)?;
        embedded::migrations::runner()
            .run(&mut conn)
            .map_err(|e| DbError::Migration(e.to_string()))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::LockPoisoned)
    }

    // --- Heartbeats ---

    /// Insert a heartbeat and return its ID.
    pub fn insert_heartbeat(
        &self,
        heartbeat: &NewHeartbeat,
        received_at: DateTime<Utc>,
    ) -> Result<i64, DbError> {
        let metadata = serde_json::to_string(&heartbeat.metadata)?;
        let t = &heartbeat.telemetry;

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO heartbeats (timestamp, connection_state, ipv4, ipv6, download_rate,
                 upload_rate, bytes_received, bytes_sent, metadata, received_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                format_db_time(heartbeat.timestamp),
                heartbeat.connection_state.as_str(),
                t.ipv4,
                t.ipv6,
                t.download_rate,
                t.upload_rate,
                t.bytes_received,
                t.bytes_sent,
                metadata,
                format_db_time(received_at),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Get the most recent heartbeat by its reported timestamp.
    pub fn last_heartbeat(&self) -> Result<Option<Heartbeat>, DbError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM heartbeats ORDER BY timestamp DESC, id DESC LIMIT 1",
            HEARTBEAT_COLUMNS
        );
        Ok(conn.query_row(&sql, [], heartbeat_from_row).optional()?)
    }

    /// Get the latest heartbeats, newest first.
    pub fn recent_heartbeats(&self, limit: u32) -> Result<Vec<Heartbeat>, DbError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM heartbeats ORDER BY timestamp DESC, id DESC LIMIT ?1",
            HEARTBEAT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![limit], heartbeat_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // --- Downtime events ---

    /// Get the currently open downtime event, if any.
    pub fn active_downtime(&self) -> Result<Option<DowntimeEvent>, DbError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM downtime_events WHERE is_active = 1 ORDER BY id DESC LIMIT 1",
            DOWNTIME_COLUMNS
        );
        Ok(conn.query_row(&sql, [], downtime_from_row).optional()?)
    }

    /// Open a new downtime event.
    ///
    /// Fails with [`DbError::ActiveDowntimeExists`] if another event is still open.
    pub fn create_downtime(
        &self,
        started_at: DateTime<Utc>,
        notes: &str,
    ) -> Result<DowntimeEvent, DbError> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT INTO downtime_events (started_at, is_active, notes, created_at)
             VALUES (?1, 1, ?2, ?3)",
            params![format_db_time(started_at), notes, format_db_time(Utc::now())],
        );

        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == ErrorCode::ConstraintViolation =>
            {
                return Err(DbError::ActiveDowntimeExists);
            }
            Err(e) => return Err(e.into()),
        }

        Ok(DowntimeEvent {
            id: conn.last_insert_rowid(),
            started_at,
            ended_at: None,
            duration: None,
            is_active: true,
            notes: notes.to_string(),
        })
    }

    /// Close whichever downtime event is open, returning its final state.
    ///
    /// Lookup and update share one transaction under the store lock, so
    /// concurrent callers close the event exactly once and the rest get `None`.
    pub fn close_active_downtime(
        &self,
        ended_at: DateTime<Utc>,
    ) -> Result<Option<DowntimeEvent>, DbError> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;

        let active: Option<i64> = tx
            .query_row(
                "SELECT id FROM downtime_events WHERE is_active = 1 ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        let Some(id) = active else {
            return Ok(None);
        };

        let event = close_event(&tx, id, ended_at)?;
        tx.commit()?;
        Ok(Some(event))
    }

    /// Get the latest downtime events, newest first.
    pub fn recent_downtimes(&self, limit: u32) -> Result<Vec<DowntimeEvent>, DbError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM downtime_events ORDER BY started_at DESC, id DESC LIMIT ?1",
            DOWNTIME_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![limit], downtime_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

/// Mark an open event closed inside `tx`.
///
/// An unknown or already-closed id is reported as [`DbError::NotFound`].
fn close_event(
    tx: &Transaction<'_>,
    id: i64,
    ended_at: DateTime<Utc>,
) -> Result<DowntimeEvent, DbError> {
    let sql = format!(
        "SELECT {} FROM downtime_events WHERE id = ?1 AND is_active = 1",
        DOWNTIME_COLUMNS
    );
    let mut event = tx
        .query_row(&sql, params![id], downtime_from_row)
        .optional()?
        .ok_or(DbError::NotFound)?;

    let duration = whole_seconds(event.started_at, ended_at);
    tx.execute(
        "UPDATE downtime_events SET ended_at = ?1, duration = ?2, is_active = 0 WHERE id = ?3",
        params![format_db_time(ended_at), duration, id],
    )?;

    event.ended_at = Some(ended_at);
    event.duration = Some(duration);
    event.is_active = false;
    Ok(event)
}

fn heartbeat_from_row(row: &Row<'_>) -> rusqlite::Result<Heartbeat> {
    let state: String = row.get(2)?;
    let metadata_str: String = row.get(9)?;
    let metadata = serde_json::from_str(&metadata_str)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(9, Type::Text, Box::new(e)))?;

    Ok(Heartbeat {
        id: row.get(0)?,
        timestamp: time_column(row, 1)?,
        connection_state: ConnectionState::from(state),
        telemetry: Telemetry {
            ipv4: row.get(3)?,
            ipv6: row.get(4)?,
            download_rate: row.get(5)?,
            upload_rate: row.get(6)?,
            bytes_received: row.get(7)?,
            bytes_sent: row.get(8)?,
        },
        metadata,
        received_at: time_column(row, 10)?,
    })
}

fn downtime_from_row(row: &Row<'_>) -> rusqlite::Result<DowntimeEvent> {
    let ended_at: Option<String> = row.get(2)?;
    let ended_at = match ended_at {
        Some(s) => Some(parse_db_time(&s).ok_or_else(|| bad_time(2, &s))?),
        None => None,
    };

    Ok(DowntimeEvent {
        id: row.get(0)?,
        started_at: time_column(row, 1)?,
        ended_at,
        duration: row.get(3)?,
        is_active: row.get(4)?,
        notes: row.get(5)?,
    })
}

fn time_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    parse_db_time(&s).ok_or_else(|| bad_time(idx, &s))
}

fn bad_time(idx: usize, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        Type::Text,
        format!("unparseable timestamp {:?}", value).into(),
    )
}

fn format_db_time(t: DateTime<Utc>) -> String {
    t.format(TIME_FORMAT).to_string()
}

/// Parse a datetime string written by [`format_db_time`].
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s, TIME_FORMAT)
        .ok()
        .map(|dt| DateTime::from_naive_utc_and_offset(dt, Utc))
}
