use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};

use crate::error::{Result, ResvError};
use crate::events::LifecycleEvent;
use crate::model::{Metadata, ReservationRecord};

// ---------------------------------------------------------------------------
// Helpers: TEXT columns back into typed values
// ---------------------------------------------------------------------------

fn parse_dt(column: &str, s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ResvError::StoreCorrupt(format!("bad {column} timestamp '{s}': {e}")))
}

fn parse_enum<T: std::str::FromStr<Err = String>>(s: &str) -> Result<T> {
    s.parse::<T>().map_err(ResvError::StoreCorrupt)
}

/// One `reservations` row as stored, before validation.
struct RawRecord {
    id: String,
    path: String,
    agent: String,
    mode: String,
    purpose: String,
    status: String,
    created_at: String,
    expires_at: String,
    released_at: Option<String>,
    batch_id: Option<String>,
    metadata: String,
}

impl RawRecord {
    fn into_record(self) -> Result<ReservationRecord> {
        let metadata: Metadata = serde_json::from_str(&self.metadata)?;
        Ok(ReservationRecord {
            mode: parse_enum(&self.mode)?,
            purpose: parse_enum(&self.purpose)?,
            status: parse_enum(&self.status)?,
            created_at: parse_dt("created_at", &self.created_at)?,
            expires_at: parse_dt("expires_at", &self.expires_at)?,
            released_at: self
                .released_at
                .as_deref()
                .map(|s| parse_dt("released_at", s))
                .transpose()?,
            id: self.id,
            resource_path: self.path,
            agent_id: self.agent,
            metadata,
            batch_id: self.batch_id,
        })
    }
}

struct RawEvent {
    ts: String,
    event_type: String,
    reservation_id: Option<String>,
    path: String,
    agent: String,
    purpose: Option<String>,
    held_secs: Option<i64>,
    actor: Option<String>,
    reason: Option<String>,
}

impl RawEvent {
    fn into_event(self) -> Result<LifecycleEvent> {
        Ok(LifecycleEvent {
            ts: parse_dt("ts", &self.ts)?,
            kind: parse_enum(&self.event_type)?,
            reservation_id: self.reservation_id,
            path: self.path,
            agent_id: self.agent,
            purpose: self
                .purpose
                .as_deref()
                .map(parse_enum::<crate::model::Purpose>)
                .transpose()?,
            held_secs: self.held_secs,
            actor: self.actor,
            reason: self.reason,
        })
    }
}

// ---------------------------------------------------------------------------
// ReservationDb
// ---------------------------------------------------------------------------

/// SQLite snapshot of the reservation table plus the append-only event log.
pub struct ReservationDb {
    conn: Connection,
}

impl ReservationDb {
    /// Open (or create) the database at the given file path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\
             PRAGMA busy_timeout=5000;",
        )?;
        let db = Self { conn };
        db.create_tables()?;
        Ok(db)
    }

    /// Open an in-memory database (for tests).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.create_tables()?;
        Ok(db)
    }

    fn create_tables(&self) -> Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS reservations (
                id TEXT PRIMARY KEY,
                path TEXT NOT NULL,
                agent TEXT NOT NULL,
                mode TEXT NOT NULL,
                purpose TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                released_at TEXT,
                batch_id TEXT,
                metadata TEXT NOT NULL DEFAULT '{}'
            );
            CREATE INDEX IF NOT EXISTS idx_reservations_path
                ON reservations(path);
            CREATE INDEX IF NOT EXISTS idx_reservations_status
                ON reservations(status);

            CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ts TEXT NOT NULL,
                event_type TEXT NOT NULL,
                reservation_id TEXT,
                path TEXT NOT NULL,
                agent TEXT NOT NULL,
                purpose TEXT,
                held_secs INTEGER,
                actor TEXT,
                reason TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_events_ts
                ON events(ts);",
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Reservations
    // -----------------------------------------------------------------------

    /// Every persisted record, oldest first.
    pub fn load_records(&self) -> Result<Vec<ReservationRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, path, agent, mode, purpose, status, created_at, expires_at,
                    released_at, batch_id, metadata
             FROM reservations
             ORDER BY created_at, id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(RawRecord {
                    id: row.get(0)?,
                    path: row.get(1)?,
                    agent: row.get(2)?,
                    mode: row.get(3)?,
                    purpose: row.get(4)?,
                    status: row.get(5)?,
                    created_at: row.get(6)?,
                    expires_at: row.get(7)?,
                    released_at: row.get(8)?,
                    batch_id: row.get(9)?,
                    metadata: row.get(10)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter().map(RawRecord::into_record).collect()
    }

    /// Replace the stored table with `records` in one transaction.
    pub fn save_records(&self, records: &[ReservationRecord]) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM reservations", [])?;
        {
            let mut insert = tx.prepare(
                "INSERT INTO reservations (id, path, agent, mode, purpose, status, created_at,
                                           expires_at, released_at, batch_id, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            )?;
            for r in records {
                insert.execute(params![
                    r.id,
                    r.resource_path,
                    r.agent_id,
                    r.mode.to_string(),
                    r.purpose.to_string(),
                    r.status.to_string(),
                    r.created_at.to_rfc3339(),
                    r.expires_at.to_rfc3339(),
                    r.released_at.map(|t| t.to_rfc3339()),
                    r.batch_id,
                    serde_json::to_string(&r.metadata)?,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Events (audit log)
    // -----------------------------------------------------------------------

    pub fn append_events(&self, events: &[LifecycleEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut insert = tx.prepare(
                "INSERT INTO events (ts, event_type, reservation_id, path, agent, purpose,
                                     held_secs, actor, reason)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for e in events {
                insert.execute(params![
                    e.ts.to_rfc3339(),
                    e.kind.as_str(),
                    e.reservation_id,
                    e.path,
                    e.agent_id,
                    e.purpose.map(|p| p.to_string()),
                    e.held_secs,
                    e.actor,
                    e.reason,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Read events, most recent first. Optional limit.
    pub fn read_events(&self, limit: Option<u32>) -> Result<Vec<LifecycleEvent>> {
        let mut stmt = self.conn.prepare(
            "SELECT ts, event_type, reservation_id, path, agent, purpose, held_secs, actor, reason
             FROM events ORDER BY id DESC LIMIT ?1",
        )?;
        let limit = limit.map(i64::from).unwrap_or(-1);
        let rows = stmt
            .query_map(params![limit], |row| {
                Ok(RawEvent {
                    ts: row.get(0)?,
                    event_type: row.get(1)?,
                    reservation_id: row.get(2)?,
                    path: row.get(3)?,
                    agent: row.get(4)?,
                    purpose: row.get(5)?,
                    held_secs: row.get(6)?,
                    actor: row.get(7)?,
                    reason: row.get(8)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter().map(RawEvent::into_event).collect()
    }

    /// Prune events older than `cutoff`. Returns the number deleted.
    pub fn prune_events(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let count = self.conn.execute(
            "DELETE FROM events WHERE ts < ?1",
            params![cutoff.to_rfc3339()],
        )?;
        Ok(count)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
