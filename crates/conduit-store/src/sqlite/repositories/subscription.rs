//! Subscription repository: audit trail of `subscriptions`.
//!
//! One row per (connection, event type). Unsubscribing deactivates the row
//! and stamps `deactivated_at`; rows are never deleted.

use conduit_core::clock;
use conduit_protocol::targeting::EventFilters;
use conduit_protocol::TargetType;
use rusqlite::{Connection, params};

use crate::errors::Result;
use crate::sqlite::row_types::SubscriptionRow;

const COLUMNS: &str = "id, connection_id, user_id, organization_id, event_type, target_type,
    target_id, filters, active, subscribed_at, deactivated_at";

/// Input for [`SubscriptionRepo::record`].
#[derive(Clone, Debug)]
pub struct NewSubscription<'a> {
    /// Owning connection.
    pub connection_id: &'a str,
    /// Owning user.
    pub user_id: &'a str,
    /// Owning organization.
    pub organization_id: &'a str,
    /// Subscribed event type.
    pub event_type: &'a str,
    /// Addressing mode.
    pub target_type: TargetType,
    /// Flow/room/user id.
    pub target_id: Option<&'a str>,
    /// Filters.
    pub filters: Option<&'a EventFilters>,
}

/// Subscription repository.
pub struct SubscriptionRepo;

impl SubscriptionRepo {
    /// Record an active subscription. Any earlier active row for the same
    /// connection and event type is deactivated first. Returns the new row id.
    pub fn record(conn: &Connection, sub: &NewSubscription<'_>) -> Result<i64> {
        let now = clock::now_rfc3339();
        let filters = sub.filters.map(serde_json::to_string).transpose()?;
        let tx = conn.unchecked_transaction()?;
        let _ = tx.execute(
            "UPDATE subscriptions SET active = 0, deactivated_at = ?1
             WHERE connection_id = ?2 AND event_type = ?3 AND active = 1",
            params![now, sub.connection_id, sub.event_type],
        )?;
        let _ = tx.execute(
            "INSERT INTO subscriptions (connection_id, user_id, organization_id, event_type,
                 target_type, target_id, filters, active, subscribed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8)",
            params![
                sub.connection_id,
                sub.user_id,
                sub.organization_id,
                sub.event_type,
                sub.target_type.as_str(),
                sub.target_id,
                filters,
                now
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(id)
    }

    /// Deactivate one subscription. Returns whether a live row existed.
    pub fn deactivate(conn: &Connection, connection_id: &str, event_type: &str) -> Result<bool> {
        let changed = conn.execute(
            "UPDATE subscriptions SET active = 0, deactivated_at = ?1
             WHERE connection_id = ?2 AND event_type = ?3 AND active = 1",
            params![clock::now_rfc3339(), connection_id, event_type],
        )?;
        Ok(changed > 0)
    }

    /// Deactivate every live subscription of a connection. Returns the count.
    pub fn deactivate_all(conn: &Connection, connection_id: &str) -> Result<usize> {
        let changed = conn.execute(
            "UPDATE subscriptions SET active = 0, deactivated_at = ?1
             WHERE connection_id = ?2 AND active = 1",
            params![clock::now_rfc3339(), connection_id],
        )?;
        Ok(changed)
    }

    /// Live subscriptions of a connection.
    pub fn list_active(conn: &Connection, connection_id: &str) -> Result<Vec<SubscriptionRow>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM subscriptions
             WHERE connection_id = ?1 AND active = 1 ORDER BY id"
        ))?;
        let rows = stmt
            .query_map(params![connection_id], Self::map_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Full history of a connection, live and inactive.
    pub fn history(conn: &Connection, connection_id: &str) -> Result<Vec<SubscriptionRow>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM subscriptions WHERE connection_id = ?1 ORDER BY id"
        ))?;
        let rows = stmt
            .query_map(params![connection_id], Self::map_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Count live subscriptions across every connection.
    pub fn count_active(conn: &Connection) -> Result<i64> {
        let count = conn.query_row(
            "SELECT COUNT(*) FROM subscriptions WHERE active = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SubscriptionRow> {
        Ok(SubscriptionRow {
            id: row.get(0)?,
            connection_id: row.get(1)?,
            user_id: row.get(2)?,
            organization_id: row.get(3)?,
            event_type: row.get(4)?,
            target_type: row.get(5)?,
            target_id: row.get(6)?,
            filters: row.get(7)?,
            active: row.get::<_, i32>(8)? == 1,
            subscribed_at: row.get(9)?,
            deactivated_at: row.get(10)?,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
