//! Event log repository: append-only rows in `event_log`.
//!
//! Rows are only ever inserted or marked processed. Replay reads them back
//! in ascending timestamp order.

use conduit_core::clock;
use conduit_protocol::EventPublication;
use rusqlite::types::ToSql;
use rusqlite::{Connection, OptionalExtension, params};

use crate::errors::Result;
use crate::sqlite::row_types::EventLogRow;

const COLUMNS: &str = "event_id, event_type, source_module, target_module, payload,
    organization_id, targeting, priority, correlation_id, parent_event_id,
    timestamp, processed, processed_at, retry_count";

/// Filters for a log scan.
#[derive(Clone, Debug, Default)]
pub struct EventLogQuery {
    /// Organization the events belong to.
    pub organization_id: String,
    /// Inclusive lower bound, Unix milliseconds.
    pub from_timestamp: i64,
    /// Inclusive upper bound, Unix milliseconds.
    pub to_timestamp: Option<i64>,
    /// Restrict to these event types (empty = all).
    pub event_types: Vec<String>,
    /// Restrict to one correlation id.
    pub correlation_id: Option<String>,
    /// Maximum rows returned.
    pub limit: usize,
}

/// Event log repository.
pub struct EventLogRepo;

impl EventLogRepo {
    /// Append a publication. Returns `false` if the event id was already logged.
    pub fn append(conn: &Connection, publication: &EventPublication) -> Result<bool> {
        let payload = serde_json::to_string(&publication.payload)?;
        let targeting = serde_json::to_string(&publication.targeting)?;
        let changed = conn.execute(
            "INSERT OR IGNORE INTO event_log (event_id, event_type, source_module, target_module,
                 payload, organization_id, targeting, priority, correlation_id, parent_event_id,
                 timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                publication.event_id.as_str(),
                publication.event_type,
                publication.source_module,
                publication.target_module,
                payload,
                publication.targeting.organization_id,
                targeting,
                publication.priority.as_str(),
                publication.correlation_id,
                publication.parent_event_id.as_ref().map(|id| id.as_str()),
                publication.timestamp,
            ],
        )?;
        Ok(changed > 0)
    }

    /// Fetch one row by event id.
    pub fn get(conn: &Connection, event_id: &str) -> Result<Option<EventLogRow>> {
        let row = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM event_log WHERE event_id = ?1"),
                params![event_id],
                Self::map_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Rows matching `query`, oldest first.
    pub fn query(conn: &Connection, query: &EventLogQuery) -> Result<Vec<EventLogRow>> {
        let mut sql = format!(
            "SELECT {COLUMNS} FROM event_log WHERE organization_id = ? AND timestamp >= ?"
        );
        let limit = i64::try_from(query.limit).unwrap_or(i64::MAX);
        let mut args: Vec<&dyn ToSql> = Vec::new();
        args.push(&query.organization_id);
        args.push(&query.from_timestamp);

        if let Some(to) = &query.to_timestamp {
            sql.push_str(" AND timestamp <= ?");
            args.push(to);
        }
        if let Some(correlation_id) = &query.correlation_id {
            sql.push_str(" AND correlation_id = ?");
            args.push(correlation_id);
        }
        if !query.event_types.is_empty() {
            let placeholders = vec!["?"; query.event_types.len()].join(", ");
            sql.push_str(&format!(" AND event_type IN ({placeholders})"));
            args.extend(query.event_types.iter().map(|t| t as &dyn ToSql));
        }
        sql.push_str(" ORDER BY timestamp ASC, rowid ASC LIMIT ?");
        args.push(&limit);

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(args.as_slice(), Self::map_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Mark a row handled. Returns whether a row was updated.
    pub fn mark_processed(conn: &Connection, event_id: &str) -> Result<bool> {
        let changed = conn.execute(
            "UPDATE event_log SET processed = 1, processed_at = ?1
             WHERE event_id = ?2 AND processed = 0",
            params![clock::now_rfc3339(), event_id],
        )?;
        Ok(changed > 0)
    }

    fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EventLogRow> {
        Ok(EventLogRow {
            event_id: row.get(0)?,
            event_type: row.get(1)?,
            source_module: row.get(2)?,
            target_module: row.get(3)?,
            payload: row.get(4)?,
            organization_id: row.get(5)?,
            targeting: row.get(6)?,
            priority: row.get(7)?,
            correlation_id: row.get(8)?,
            parent_event_id: row.get(9)?,
            timestamp: row.get(10)?,
            processed: row.get::<_, i32>(11)? == 1,
            processed_at: row.get(12)?,
            retry_count: row.get(13)?,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
