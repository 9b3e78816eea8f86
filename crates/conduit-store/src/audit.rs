//! [`AuditStore`]: the durable event log and subscription trail.
//!
//! Wraps a connection pool and the stateless repositories. Calls are
//! blocking; async callers go through `tokio::task::spawn_blocking`.

use conduit_protocol::EventPublication;
use tracing::warn;

use crate::errors::{Result, StoreError};
use crate::sqlite::connection::{self, ConnectionConfig, ConnectionPool, PooledConnection};
use crate::sqlite::migrations::run_migrations;
use crate::sqlite::repositories::{EventLogQuery, EventLogRepo, NewSubscription, SubscriptionRepo};
use crate::sqlite::row_types::{EventLogRow, SubscriptionRow};

/// Durable audit store. Cheap to clone; clones share the pool.
#[derive(Clone)]
pub struct AuditStore {
    pool: ConnectionPool,
}

impl AuditStore {
    /// Wrap an existing pool. The schema must already be migrated.
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    /// Open (or create) a database file and migrate it.
    pub fn open(path: &str, config: &ConnectionConfig) -> Result<Self> {
        let pool = connection::new_file(path, config)?;
        let _ = run_migrations(&*pool.get()?)?;
        Ok(Self::new(pool))
    }

    /// Fresh migrated in-memory database.
    pub fn in_memory() -> Result<Self> {
        let pool = connection::new_in_memory(&ConnectionConfig::default())?;
        let _ = run_migrations(&*pool.get()?)?;
        Ok(Self::new(pool))
    }

    fn conn(&self) -> Result<PooledConnection> {
        Ok(self.pool.get()?)
    }

    /// Run a blocking store call on tokio's blocking pool.
    pub async fn call<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&AuditStore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| StoreError::Internal(format!("audit task failed: {e}")))?
    }

    // ─────────────────────────────────────────────────────────────────────
    // Event log
    // ─────────────────────────────────────────────────────────────────────

    /// Append a publication to the log.
    pub fn append_event(&self, publication: &EventPublication) -> Result<bool> {
        let conn = self.conn()?;
        EventLogRepo::append(&conn, publication)
    }

    /// Raw rows matching `query`, oldest first.
    pub fn event_rows(&self, query: &EventLogQuery) -> Result<Vec<EventLogRow>> {
        let conn = self.conn()?;
        EventLogRepo::query(&conn, query)
    }

    /// Publications matching `query`, oldest first.
    ///
    /// A row that no longer decodes is skipped with a warning rather than
    /// failing the whole scan.
    pub fn replay_events(&self, query: &EventLogQuery) -> Result<Vec<EventPublication>> {
        let rows = self.event_rows(query)?;
        Ok(rows
            .into_iter()
            .filter_map(|row| match row.to_publication() {
                Ok(p) => Some(p),
                Err(e) => {
                    warn!(event_id = %row.event_id, error = %e, "skipping undecodable event_log row");
                    None
                }
            })
            .collect())
    }

    /// Mark a logged event handled.
    pub fn mark_processed(&self, event_id: &str) -> Result<bool> {
        let conn = self.conn()?;
        EventLogRepo::mark_processed(&conn, event_id)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Subscriptions
    // ─────────────────────────────────────────────────────────────────────

    /// Record an active subscription.
    pub fn record_subscription(&self, sub: &NewSubscription<'_>) -> Result<i64> {
        let conn = self.conn()?;
        SubscriptionRepo::record(&conn, sub)
    }

    /// Deactivate one subscription.
    pub fn deactivate_subscription(&self, connection_id: &str, event_type: &str) -> Result<bool> {
        let conn = self.conn()?;
        SubscriptionRepo::deactivate(&conn, connection_id, event_type)
    }

    /// Deactivate every subscription of a connection.
    pub fn deactivate_connection(&self, connection_id: &str) -> Result<usize> {
        let conn = self.conn()?;
        SubscriptionRepo::deactivate_all(&conn, connection_id)
    }

    /// Live subscriptions of a connection.
    pub fn active_subscriptions(&self, connection_id: &str) -> Result<Vec<SubscriptionRow>> {
        let conn = self.conn()?;
        SubscriptionRepo::list_active(&conn, connection_id)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(unused_results)]
mod tests {
    use super::*;
    use conduit_protocol::{PublishOptions, TargetType, Targeting};
    use serde_json::json;

    fn publication(org: &str, ts: i64) -> EventPublication {
        let mut p = EventPublication::new(
            "agent.done",
            json!({"ts": ts}),
            Targeting::tenant(org),
            PublishOptions::default(),
        );
        p.timestamp = ts;
        p
    }

    #[test]
    fn replay_returns_publications_in_order() {
        let store = AuditStore::in_memory().unwrap();
        for ts in [3, 1, 2] {
            store.append_event(&publication("org-1", ts)).unwrap();
        }
        let query = EventLogQuery {
            organization_id: "org-1".into(),
            limit: 10,
            ..EventLogQuery::default()
        };
        let events = store.replay_events(&query).unwrap();
        let ts: Vec<i64> = events.iter().map(|e| e.timestamp).collect();
        assert_eq!(ts, vec![1, 2, 3]);
    }

    #[test]
    fn replay_skips_corrupt_rows() {
        let store = AuditStore::in_memory().unwrap();
        let good = publication("org-1", 1);
        let bad = publication("org-1", 2);
        store.append_event(&good).unwrap();
        store.append_event(&bad).unwrap();
        store
            .conn()
            .unwrap()
            .execute(
                "UPDATE event_log SET payload = 'not json' WHERE event_id = ?1",
                [bad.event_id.as_str()],
            )
            .unwrap();

        let query = EventLogQuery {
            organization_id: "org-1".into(),
            limit: 10,
            ..EventLogQuery::default()
        };
        let events = store.replay_events(&query).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_id, good.event_id);
        assert_eq!(store.event_rows(&query).unwrap().len(), 2);
    }

    #[test]
    fn subscription_trail() {
        let store = AuditStore::in_memory().unwrap();
        let sub = NewSubscription {
            connection_id: "c1",
            user_id: "u1",
            organization_id: "org-1",
            event_type: "agent.done",
            target_type: TargetType::Tenant,
            target_id: None,
            filters: None,
        };
        store.record_subscription(&sub).unwrap();
        store
            .record_subscription(&NewSubscription {
                event_type: "tool.done",
                ..sub.clone()
            })
            .unwrap();
        assert_eq!(store.active_subscriptions("c1").unwrap().len(), 2);
        assert!(store.deactivate_subscription("c1", "agent.done").unwrap());
        assert_eq!(store.deactivate_connection("c1").unwrap(), 1);
        assert!(store.active_subscriptions("c1").unwrap().is_empty());
    }

    #[tokio::test]
    async fn call_runs_off_the_runtime() {
        let store = AuditStore::in_memory().unwrap();
        let p = publication("org-1", 7);
        let id = p.event_id.clone();
        assert!(store.call(move |s| s.append_event(&p)).await.unwrap());
        let processed = store
            .call(move |s| s.mark_processed(id.as_str()))
            .await
            .unwrap();
        assert!(processed);
    }

    #[test]
    fn file_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.db");
        let path = path.to_str().unwrap();
        let p = publication("org-1", 5);
        {
            let store = AuditStore::open(path, &ConnectionConfig::default()).unwrap();
            store.append_event(&p).unwrap();
            assert!(store.mark_processed(p.event_id.as_str()).unwrap());
        }
        let store = AuditStore::open(path, &ConnectionConfig::default()).unwrap();
        let rows = store
            .event_rows(&EventLogQuery {
                organization_id: "org-1".into(),
                limit: 10,
                ..EventLogQuery::default()
            })
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].processed);
    }
}
