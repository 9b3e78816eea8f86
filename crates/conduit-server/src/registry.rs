//! Connection registry.
//!
//! Tracks every live connection on this instance in a concurrent map,
//! indexed by user and by organization for group sends. Each admission also
//! writes a TTL'd connection record to the shared store so other instances
//! can see who is online. Removal cascades to every registered
//! [`ConnectionObserver`] (the subscription engine tears down the
//! connection's subscriptions there).

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use conduit_core::ConnectionId;
use conduit_protocol::{Envelope, Role};
use conduit_store::{SharedStore, keys};
use dashmap::DashMap;
use metrics::{counter, gauge, histogram};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::auth::AuthContext;
use crate::errors::RegistryError;
use crate::metrics::{
    WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL, WS_DISCONNECTIONS_TOTAL,
    WS_STALE_DISCONNECTIONS_TOTAL,
};
use crate::websocket::connection::ClientConnection;

/// Why a connection left the registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    /// The client closed the socket.
    ClientClosed,
    /// No heartbeat within the timeout.
    Stale,
    /// Older than the role's session timeout.
    SessionExpired,
    /// The server is shutting down.
    Shutdown,
}

impl DisconnectReason {
    /// Metric label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClientClosed => "client_closed",
            Self::Stale => "stale",
            Self::SessionExpired => "session_expired",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Lifecycle notifications emitted by the registry.
#[derive(Clone, Debug, PartialEq)]
pub enum ConnectionEvent {
    /// A connection was admitted.
    Established {
        /// Connection id.
        connection_id: ConnectionId,
        /// User.
        user_id: String,
        /// Organization.
        organization_id: String,
        /// Role.
        role: Role,
    },
    /// A connection was removed.
    Lost {
        /// Connection id.
        connection_id: ConnectionId,
        /// User.
        user_id: String,
        /// Organization.
        organization_id: String,
        /// How long it was connected.
        duration_ms: u64,
        /// Why it left.
        reason: DisconnectReason,
    },
}

/// Hook run for every removed connection, before its shared-store record
/// is deleted.
#[async_trait]
pub trait ConnectionObserver: Send + Sync {
    /// Called once per removal.
    async fn connection_removed(&self, connection: &ClientConnection);
}

/// Connection record kept in the shared store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRecord {
    /// Connection id.
    pub connection_id: String,
    /// User.
    pub user_id: String,
    /// Organization.
    pub organization_id: String,
    /// Role.
    pub role: Role,
    /// Instance holding the socket.
    pub instance_id: String,
    /// Admission time, Unix milliseconds.
    pub connected_at: i64,
    /// Last activity, Unix milliseconds.
    pub last_heartbeat: i64,
}

/// Live connection statistics.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStats {
    /// Live connections.
    pub total: usize,
    /// Live connections per organization.
    pub by_organization: BTreeMap<String, usize>,
    /// Live connections per role.
    pub by_role: BTreeMap<String, usize>,
    /// Mean age of live connections.
    pub average_duration_ms: u64,
    /// Admissions since start.
    pub connects_total: u64,
    /// Removals since start.
    pub disconnects_total: u64,
}

type Index = DashMap<String, HashSet<ConnectionId>>;

/// Registry of live connections on this instance.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<ClientConnection>>,
    by_user: Index,
    by_org: Index,
    store: Arc<dyn SharedStore>,
    instance_id: String,
    record_ttl: Duration,
    max_connections: usize,
    observers: RwLock<Vec<Arc<dyn ConnectionObserver>>>,
    events: broadcast::Sender<ConnectionEvent>,
    connects_total: AtomicU64,
    disconnects_total: AtomicU64,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new(
        store: Arc<dyn SharedStore>,
        instance_id: impl Into<String>,
        record_ttl: Duration,
        max_connections: usize,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            connections: DashMap::new(),
            by_user: DashMap::new(),
            by_org: DashMap::new(),
            store,
            instance_id: instance_id.into(),
            record_ttl,
            max_connections,
            observers: RwLock::new(Vec::new()),
            events,
            connects_total: AtomicU64::new(0),
            disconnects_total: AtomicU64::new(0),
        }
    }

    /// Register a removal hook.
    pub fn add_observer(&self, observer: Arc<dyn ConnectionObserver>) {
        self.observers.write().push(observer);
    }

    /// Subscribe to lifecycle notifications.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Admit an authenticated caller. `tx` is the session's outbound queue.
    pub async fn add(
        &self,
        auth: &AuthContext,
        tx: mpsc::Sender<Arc<String>>,
    ) -> Result<Arc<ClientConnection>, RegistryError> {
        if self.connections.len() >= self.max_connections {
            warn!(
                user_id = %auth.user_id,
                org_id = %auth.organization_id,
                limit = self.max_connections,
                "connection refused, registry at capacity"
            );
            return Err(RegistryError::AtCapacity(self.max_connections));
        }

        let connection = Arc::new(ClientConnection::new(ConnectionId::new(), auth, tx));
        let id = connection.id.clone();
        let _ = self.connections.insert(id.clone(), connection.clone());
        index_insert(&self.by_user, &connection.user_id, &id);
        index_insert(&self.by_org, &connection.organization_id, &id);
        let _ = self.connects_total.fetch_add(1, Ordering::Relaxed);
        counter!(WS_CONNECTIONS_TOTAL).increment(1);
        gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);

        self.write_record(&connection).await;

        info!(
            conn_id = %id,
            user_id = %connection.user_id,
            org_id = %connection.organization_id,
            role = connection.role.as_str(),
            "connection established"
        );
        let _ = self.events.send(ConnectionEvent::Established {
            connection_id: id,
            user_id: connection.user_id.clone(),
            organization_id: connection.organization_id.clone(),
            role: connection.role,
        });
        Ok(connection)
    }

    /// Remove a connection. Idempotent: returns `None` if it was already gone.
    pub async fn remove(&self, id: &str, reason: DisconnectReason) -> Option<Arc<ClientConnection>> {
        let (_, connection) = self.connections.remove(id)?;
        index_remove(&self.by_user, &connection.user_id, &connection.id);
        index_remove(&self.by_org, &connection.organization_id, &connection.id);

        let observers: Vec<Arc<dyn ConnectionObserver>> = self.observers.read().clone();
        for observer in observers {
            observer.connection_removed(&connection).await;
        }

        if let Err(e) = self.store.del(&keys::connection(id)).await {
            warn!(conn_id = id, error = %e, "failed to delete connection record");
        }

        connection.close();
        let _ = self.disconnects_total.fetch_add(1, Ordering::Relaxed);
        counter!(WS_DISCONNECTIONS_TOTAL, "reason" => reason.as_str()).increment(1);
        gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
        let age = connection.age();
        histogram!("ws_connection_duration_seconds").record(age.as_secs_f64());
        let duration_ms = u64::try_from(age.as_millis()).unwrap_or(u64::MAX);

        match reason {
            DisconnectReason::Stale => {
                counter!(WS_STALE_DISCONNECTIONS_TOTAL).increment(1);
                warn!(conn_id = id, idle_ms = connection.idle_for().as_millis(), "removed stale connection");
            }
            _ => info!(conn_id = id, duration_ms, reason = reason.as_str(), "connection closed"),
        }

        let _ = self.events.send(ConnectionEvent::Lost {
            connection_id: connection.id.clone(),
            user_id: connection.user_id.clone(),
            organization_id: connection.organization_id.clone(),
            duration_ms,
            reason,
        });
        Some(connection)
    }

    /// Record activity and refresh the shared-store record. Subscriptions
    /// are untouched. Returns `false` for an unknown connection.
    pub async fn update_heartbeat(&self, id: &str) -> bool {
        let Some(connection) = self.get(id) else {
            return false;
        };
        connection.mark_alive();
        self.write_record(&connection).await;
        true
    }

    /// Record inbound activity. The shared-store record is rewritten at
    /// most once per `refresh_every`, so busy clients that never send `PING`
    /// stay visible to other instances.
    pub async fn record_activity(&self, connection: &ClientConnection, refresh_every: Duration) {
        connection.mark_alive();
        if connection.claim_record_refresh(refresh_every) {
            self.write_record(connection).await;
        }
    }

    /// Look up a live connection.
    pub fn get(&self, id: &str) -> Option<Arc<ClientConnection>> {
        self.connections.get(id).map(|c| c.value().clone())
    }

    /// Live connection count.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether no connection is live.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Every live connection.
    pub fn all(&self) -> Vec<Arc<ClientConnection>> {
        self.connections.iter().map(|c| c.value().clone()).collect()
    }

    /// A user's live connections.
    pub fn connections_for_user(&self, user_id: &str) -> Vec<Arc<ClientConnection>> {
        self.resolve(&self.by_user, user_id)
    }

    /// An organization's live connections.
    pub fn connections_for_org(&self, organization_id: &str) -> Vec<Arc<ClientConnection>> {
        self.resolve(&self.by_org, organization_id)
    }

    /// Organizations with at least one live connection.
    pub fn organizations(&self) -> Vec<String> {
        let mut orgs: Vec<String> = self.by_org.iter().map(|e| e.key().clone()).collect();
        orgs.sort();
        orgs
    }

    /// Send to every connection of a user. Returns how many were enqueued.
    pub fn send_to_user(&self, user_id: &str, envelope: &Envelope) -> usize {
        Self::send_all(&self.connections_for_user(user_id), envelope)
    }

    /// Send to every connection of an organization.
    pub fn send_to_org(&self, organization_id: &str, envelope: &Envelope) -> usize {
        Self::send_all(&self.connections_for_org(organization_id), envelope)
    }

    /// Statistics computed from the live local set.
    pub fn stats(&self) -> ConnectionStats {
        let mut stats = ConnectionStats {
            connects_total: self.connects_total.load(Ordering::Relaxed),
            disconnects_total: self.disconnects_total.load(Ordering::Relaxed),
            ..ConnectionStats::default()
        };
        let mut total_ms: u128 = 0;
        for entry in &self.connections {
            let c = entry.value();
            stats.total += 1;
            *stats.by_organization.entry(c.organization_id.clone()).or_default() += 1;
            *stats.by_role.entry(c.role.as_str().to_owned()).or_default() += 1;
            total_ms += c.age().as_millis();
        }
        if stats.total > 0 {
            let avg = total_ms / stats.total as u128;
            stats.average_duration_ms = u64::try_from(avg).unwrap_or(u64::MAX);
        }
        stats
    }

    /// Remove connections silent for longer than `timeout`, and those older
    /// than their role's session timeout. Returns what was removed.
    pub async fn sweep(&self, timeout: Duration) -> Vec<(ConnectionId, DisconnectReason)> {
        let candidates: Vec<(ConnectionId, DisconnectReason)> = self
            .connections
            .iter()
            .filter_map(|entry| {
                let c = entry.value();
                if c.idle_for() > timeout {
                    Some((c.id.clone(), DisconnectReason::Stale))
                } else if c.age() > c.role.policy().session_timeout {
                    Some((c.id.clone(), DisconnectReason::SessionExpired))
                } else {
                    None
                }
            })
            .collect();

        let mut removed = Vec::with_capacity(candidates.len());
        for (id, reason) in candidates {
            if self.remove(id.as_str(), reason).await.is_some() {
                removed.push((id, reason));
            }
        }
        if !removed.is_empty() {
            debug!(removed = removed.len(), "heartbeat sweep complete");
        }
        removed
    }

    /// Remove every connection.
    pub async fn close_all(&self, reason: DisconnectReason) -> usize {
        let ids: Vec<ConnectionId> = self.connections.iter().map(|e| e.key().clone()).collect();
        let mut closed = 0;
        for id in ids {
            if self.remove(id.as_str(), reason).await.is_some() {
                closed += 1;
            }
        }
        closed
    }

    /// Read another instance's (or this one's) connection record.
    pub async fn shared_record(&self, id: &str) -> Option<ConnectionRecord> {
        match self.store.get(&keys::connection(id)).await {
            Ok(Some(raw)) => serde_json::from_str(&raw).ok(),
            Ok(None) => None,
            Err(e) => {
                warn!(conn_id = id, error = %e, "failed to read connection record");
                None
            }
        }
    }

    async fn write_record(&self, connection: &ClientConnection) {
        let record = ConnectionRecord {
            connection_id: connection.id.to_string(),
            user_id: connection.user_id.clone(),
            organization_id: connection.organization_id.clone(),
            role: connection.role,
            instance_id: self.instance_id.clone(),
            connected_at: connection.connected_at_ms,
            last_heartbeat: connection.last_heartbeat_ms(),
        };
        let Ok(json) = serde_json::to_string(&record) else {
            return;
        };
        let key = keys::connection(connection.id.as_str());
        if let Err(e) = self.store.set(&key, &json, Some(self.record_ttl)).await {
            warn!(conn_id = %connection.id, error = %e, "failed to write connection record");
        }
    }

    fn resolve(&self, index: &Index, key: &str) -> Vec<Arc<ClientConnection>> {
        let ids: Vec<ConnectionId> = index
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        ids.iter().filter_map(|id| self.get(id.as_str())).collect()
    }

    fn send_all(targets: &[Arc<ClientConnection>], envelope: &Envelope) -> usize {
        let Ok(text) = envelope.to_text() else {
            return 0;
        };
        let text = Arc::new(text);
        targets.iter().filter(|c| c.send(text.clone())).count()
    }
}

fn index_insert(index: &Index, key: &str, id: &ConnectionId) {
    let _ = index.entry(key.to_owned()).or_default().insert(id.clone());
}

fn index_remove(index: &Index, key: &str, id: &ConnectionId) {
    if let Some(mut set) = index.get_mut(key) {
        let _ = set.remove(id);
    }
    let _ = index.remove_if(key, |_, set| set.is_empty());
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
