//! SQLite event store implementation.

use crate::{Error, Event, Result, SessionId};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, Row, params};
use std::path::Path;

/// SQLite-backed audit event store.
pub struct EventStore {
    conn: Connection,
}

/// Aggregate view of one session's audit trail.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub id: SessionId,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub denial_count: u64,
    pub halted: bool,
}

impl EventStore {
    /// Open or create an event store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory event store (useful for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                kind TEXT NOT NULL,
                data TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_session
                ON events(session_id, timestamp);
            "#,
        )?;
        Ok(())
    }

    /// Append an event to the store.
    pub fn append(&self, event: &Event) -> Result<()> {
        self.conn.execute(
            "INSERT INTO events (id, session_id, timestamp, kind, data) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                event.id.to_string(),
                event.session_id.to_string(),
                format_timestamp(&event.timestamp),
                event.kind.name(),
                serde_json::to_string(&event.kind)?,
            ],
        )?;
        Ok(())
    }

    /// Load all events for a session, ordered by timestamp.
    pub fn load_session(&self, session_id: SessionId) -> Result<Vec<Event>> {
        self.load_events(session_id, None)
    }

    /// Load events for a session, optionally filtered by kind name.
    pub fn load_events(&self, session_id: SessionId, kind: Option<&str>) -> Result<Vec<Event>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, session_id, timestamp, data FROM events
             WHERE session_id = ?1 AND (?2 IS NULL OR kind = ?2)
             ORDER BY timestamp, rowid",
        )?;

        let events = stmt
            .query_map(params![session_id.to_string(), kind], |row| {
                let id: String = row.get(0)?;
                let session_id: String = row.get(1)?;
                let timestamp: String = row.get(2)?;
                let data: String = row.get(3)?;
                Ok((id, session_id, timestamp, data))
            })?
            .filter_map(|r| r.ok())
            .filter_map(|(id, session_id, timestamp, data)| {
                Some(Event {
                    id: id.parse().ok()?,
                    session_id: session_id.parse().ok()?,
                    timestamp: parse_timestamp(&timestamp)?,
                    kind: serde_json::from_str(&data).ok()?,
                })
            })
            .collect();

        Ok(events)
    }

    /// List every recorded session, most recently started first.
    pub fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        let mut stmt = self.conn.prepare(&format!(
            "{SUMMARY_SELECT} GROUP BY session_id ORDER BY started_at DESC"
        ))?;

        let sessions = stmt
            .query_map([], summary_row)?
            .filter_map(|r| r.ok())
            .filter_map(into_summary)
            .collect();

        Ok(sessions)
    }

    /// Summarize a single session.
    pub fn summary(&self, session_id: SessionId) -> Result<SessionSummary> {
        let mut stmt = self.conn.prepare(&format!(
            "{SUMMARY_SELECT} WHERE session_id = ?1 GROUP BY session_id"
        ))?;

        stmt.query_map([session_id.to_string()], summary_row)?
            .filter_map(|r| r.ok())
            .find_map(into_summary)
            .ok_or_else(|| Error::NotFound(session_id.to_string()))
    }
}

const SUMMARY_SELECT: &str = "SELECT session_id,
        MIN(timestamp) AS started_at,
        MAX(CASE WHEN kind = 'session_end' THEN timestamp END),
        SUM(CASE WHEN kind = 'denied' THEN 1 ELSE 0 END),
        SUM(CASE WHEN kind = 'halted' THEN 1 ELSE 0 END)
     FROM events";

type SummaryRow = (String, String, Option<String>, i64, i64);

fn summary_row(row: &Row<'_>) -> rusqlite::Result<SummaryRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn into_summary((id, started, ended, denials, halts): SummaryRow) -> Option<SessionSummary> {
    Some(SessionSummary {
        id: id.parse().ok()?,
        started_at: parse_timestamp(&started)?,
        ended_at: ended.as_deref().and_then(parse_timestamp),
        denial_count: u64::try_from(denials).unwrap_or(0),
        halted: halts > 0,
    })
}

// Fixed-width so that text ordering in SQLite matches time ordering.
fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}
