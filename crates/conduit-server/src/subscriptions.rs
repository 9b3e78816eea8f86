//! Subscription and targeting engine.
//!
//! A subscription is one connection's interest in one event type. Each is
//! permission-checked, indexed locally (by event type, or by
//! `eventType:targetId` for FLOW/ROOM), mirrored into the shared store's
//! `(eventType, organizationId)` subscriber set, and recorded in the audit
//! store. Removing a connection removes all of its subscriptions.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use conduit_core::{ConnectionId, clock};
use conduit_protocol::policy::is_privileged_event_type;
use conduit_protocol::targeting::EventFilters;
use conduit_protocol::{Capability, EventPublication, TargetType, Targeting};
use conduit_store::{AuditStore, NewSubscription, SharedStore, keys};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::SubscribeError;
use crate::registry::{ConnectionObserver, ConnectionRegistry};
use crate::websocket::connection::ClientConnection;

/// One live subscription.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    /// Owning connection.
    pub connection_id: ConnectionId,
    /// Owning user.
    pub user_id: String,
    /// Organization whose events this subscription reads.
    pub organization_id: String,
    /// Subscribed event type.
    pub event_type: String,
    /// Addressing mode.
    pub target_type: TargetType,
    /// User, flow or room id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    /// Subscriber-side filters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<EventFilters>,
    /// Creation time, Unix milliseconds.
    pub subscribed_at: i64,
    /// Last delivery or renewal, Unix milliseconds.
    pub last_activity: i64,
}

type Index = DashMap<String, HashSet<ConnectionId>>;

/// Subscription engine for one gateway instance.
pub struct SubscriptionEngine {
    registry: Arc<ConnectionRegistry>,
    store: Arc<dyn SharedStore>,
    audit: Option<AuditStore>,
    by_connection: DashMap<ConnectionId, HashMap<String, Subscription>>,
    by_event: Index,
    by_scope: Index,
}

impl SubscriptionEngine {
    /// Create an engine over a registry.
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        store: Arc<dyn SharedStore>,
        audit: Option<AuditStore>,
    ) -> Self {
        Self {
            registry,
            store,
            audit,
            by_connection: DashMap::new(),
            by_event: DashMap::new(),
            by_scope: DashMap::new(),
        }
    }

    /// Subscribe a connection to an event type.
    ///
    /// Subscribing again to the same event type replaces the previous
    /// targeting.
    pub async fn subscribe(
        &self,
        connection_id: &str,
        event_type: &str,
        target_type: TargetType,
        target_id: Option<&str>,
        filters: Option<EventFilters>,
    ) -> Result<Subscription, SubscribeError> {
        let connection = self
            .registry
            .get(connection_id)
            .ok_or_else(|| SubscribeError::UnknownConnection(connection_id.to_owned()))?;
        let organization_id = authorize(&connection, event_type, target_type, target_id)?;

        let now = clock::now_ms();
        let subscription = Subscription {
            connection_id: connection.id.clone(),
            user_id: connection.user_id.clone(),
            organization_id,
            event_type: event_type.to_owned(),
            target_type,
            target_id: target_id.map(str::to_owned),
            filters,
            subscribed_at: now,
            last_activity: now,
        };

        let previous = self
            .by_connection
            .entry(connection.id.clone())
            .or_default()
            .insert(event_type.to_owned(), subscription.clone());
        if let Some(prev) = &previous {
            self.unindex(prev);
            if prev.organization_id != subscription.organization_id {
                self.remove_shared(prev).await;
            }
        }
        self.index(&subscription);
        connection.add_subscription(event_type);

        // The connection may have been removed while we were inserting.
        if self.registry.get(connection_id).is_none() {
            let _ = self.unsubscribe_all(connection_id).await;
            return Err(SubscribeError::UnknownConnection(connection_id.to_owned()));
        }

        let set_key = keys::subscribers(event_type, &subscription.organization_id);
        if let Err(e) = self.store.sadd(&set_key, connection_id).await {
            warn!(conn_id = connection_id, event_type, error = %e, "failed to publish subscriber set");
        }
        self.audit_record(&subscription).await;

        debug!(
            conn_id = connection_id,
            event_type,
            target_type = target_type.as_str(),
            "subscribed"
        );
        Ok(subscription)
    }

    /// Drop one subscription. Returns whether it existed.
    pub async fn unsubscribe(&self, connection_id: &str, event_type: &str) -> bool {
        let removed = self
            .by_connection
            .get_mut(connection_id)
            .and_then(|mut subs| subs.remove(event_type));
        let _ = self.by_connection.remove_if(connection_id, |_, subs| subs.is_empty());
        let Some(subscription) = removed else {
            return false;
        };

        self.unindex(&subscription);
        if let Some(connection) = self.registry.get(connection_id) {
            let _ = connection.remove_subscription(event_type);
        }
        self.remove_shared(&subscription).await;
        if let Some(audit) = &self.audit {
            let (conn, ty) = (connection_id.to_owned(), event_type.to_owned());
            if let Err(e) = audit.call(move |s| s.deactivate_subscription(&conn, &ty)).await {
                warn!(conn_id = connection_id, event_type, error = %e, "failed to deactivate subscription record");
            }
        }
        debug!(conn_id = connection_id, event_type, "unsubscribed");
        true
    }

    /// Drop every subscription of a connection. Returns how many existed.
    pub async fn unsubscribe_all(&self, connection_id: &str) -> usize {
        let Some((_, subs)) = self.by_connection.remove(connection_id) else {
            return 0;
        };
        for subscription in subs.values() {
            self.unindex(subscription);
            self.remove_shared(subscription).await;
        }
        if let Some(connection) = self.registry.get(connection_id) {
            connection.clear_subscriptions();
        }
        if let Some(audit) = &self.audit {
            let conn = connection_id.to_owned();
            if let Err(e) = audit.call(move |s| s.deactivate_connection(&conn)).await {
                warn!(conn_id = connection_id, error = %e, "failed to deactivate subscription records");
            }
        }
        subs.len()
    }

    /// A connection's live subscriptions, sorted by event type.
    pub fn subscriptions_of(&self, connection_id: &str) -> Vec<Subscription> {
        let mut subs: Vec<Subscription> = self
            .by_connection
            .get(connection_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        subs.sort_by(|a, b| a.event_type.cmp(&b.event_type));
        subs
    }

    /// Live subscription count.
    pub fn len(&self) -> usize {
        self.by_connection.iter().map(|e| e.value().len()).sum()
    }

    /// Whether no subscription is live.
    pub fn is_empty(&self) -> bool {
        self.by_connection.is_empty()
    }

    /// Local subscribers of an event type, optionally scoped to an
    /// organization (ALL subscriptions match every organization).
    /// FLOW/ROOM subscriptions are only reachable through their target.
    pub fn subscribers_for(&self, event_type: &str, organization_id: Option<&str>) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = ids_in(&self.by_event, event_type)
            .into_iter()
            .filter(|id| {
                let Some(org) = organization_id else {
                    return true;
                };
                self.by_connection
                    .get(id.as_str())
                    .and_then(|subs| {
                        subs.get(event_type)
                            .map(|s| s.target_type == TargetType::All || s.organization_id == org)
                    })
                    .unwrap_or(false)
            })
            .collect();
        ids.sort();
        ids
    }

    /// Subscriber set for `(eventType, organizationId)` in the shared store,
    /// across every instance.
    pub async fn shared_subscribers(&self, event_type: &str, organization_id: &str) -> Vec<String> {
        match self.store.smembers(&keys::subscribers(event_type, organization_id)).await {
            Ok(members) => members,
            Err(e) => {
                warn!(event_type, org_id = organization_id, error = %e, "failed to read subscriber set");
                Vec::new()
            }
        }
    }

    /// Local connections a publication must be delivered to.
    pub fn resolve_targets(&self, publication: &EventPublication) -> Vec<Arc<ClientConnection>> {
        let event_type = publication.event_type.as_str();
        let targeting = &publication.targeting;
        let candidates = match (targeting.target_type, targeting.target_id.as_deref()) {
            (TargetType::Flow | TargetType::Room, Some(target)) => {
                ids_in(&self.by_scope, &scope_key(event_type, target))
            }
            (TargetType::Flow | TargetType::Room, None) => Vec::new(),
            _ => ids_in(&self.by_event, event_type),
        };
        let role_filter = targeting.role_filter();
        let now = clock::now_ms();

        let mut targets = Vec::with_capacity(candidates.len());
        for id in candidates {
            let Some(connection) = self.registry.get(id.as_str()) else {
                continue;
            };
            if role_filter.is_some_and(|role| connection.role != role) {
                continue;
            }
            let matched = self
                .by_connection
                .get_mut(id.as_str())
                .and_then(|mut subs| {
                    let sub = subs.get_mut(event_type)?;
                    let ok = matches(sub, &connection, targeting);
                    if ok {
                        sub.last_activity = now;
                    }
                    Some(ok)
                })
                .unwrap_or(false);
            if matched {
                targets.push(connection);
            }
        }
        targets
    }

    fn index(&self, subscription: &Subscription) {
        let (index, key) = self.index_for(subscription);
        let _ = index
            .entry(key)
            .or_default()
            .insert(subscription.connection_id.clone());
    }

    fn unindex(&self, subscription: &Subscription) {
        let (index, key) = self.index_for(subscription);
        if let Some(mut set) = index.get_mut(&key) {
            let _ = set.remove(&subscription.connection_id);
        }
        let _ = index.remove_if(&key, |_, set| set.is_empty());
    }

    fn index_for(&self, subscription: &Subscription) -> (&Index, String) {
        match (subscription.target_type, subscription.target_id.as_deref()) {
            (TargetType::Flow | TargetType::Room, Some(target)) => {
                (&self.by_scope, scope_key(&subscription.event_type, target))
            }
            _ => (&self.by_event, subscription.event_type.clone()),
        }
    }

    async fn remove_shared(&self, subscription: &Subscription) {
        let key = keys::subscribers(&subscription.event_type, &subscription.organization_id);
        if let Err(e) = self.store.srem(&key, subscription.connection_id.as_str()).await {
            warn!(
                conn_id = %subscription.connection_id,
                event_type = %subscription.event_type,
                error = %e,
                "failed to prune subscriber set"
            );
        }
    }

    async fn audit_record(&self, subscription: &Subscription) {
        let Some(audit) = &self.audit else {
            return;
        };
        let sub = subscription.clone();
        let result = audit
            .call(move |s| {
                s.record_subscription(&NewSubscription {
                    connection_id: sub.connection_id.as_str(),
                    user_id: &sub.user_id,
                    organization_id: &sub.organization_id,
                    event_type: &sub.event_type,
                    target_type: sub.target_type,
                    target_id: sub.target_id.as_deref(),
                    filters: sub.filters.as_ref(),
                })
            })
            .await;
        if let Err(e) = result {
            warn!(
                conn_id = %subscription.connection_id,
                event_type = %subscription.event_type,
                error = %e,
                "failed to record subscription"
            );
        }
    }
}

#[async_trait]
impl ConnectionObserver for SubscriptionEngine {
    async fn connection_removed(&self, connection: &ClientConnection) {
        let removed = self.unsubscribe_all(connection.id.as_str()).await;
        connection.clear_subscriptions();
        if removed > 0 {
            debug!(conn_id = %connection.id, removed, "subscriptions torn down");
        }
    }
}

/// Permission check for a subscribe request. Returns the organization the
/// subscription reads from.
fn authorize(
    connection: &ClientConnection,
    event_type: &str,
    target_type: TargetType,
    target_id: Option<&str>,
) -> Result<String, SubscribeError> {
    let role = connection.role;
    if is_privileged_event_type(event_type) && !role.policy().has(Capability::Admin) {
        return Err(SubscribeError::InsufficientPermissions(format!(
            "subscribing to {event_type} requires the ADMIN capability"
        )));
    }
    let own_org = connection.organization_id.as_str();
    let target_id = target_id.filter(|t| !t.is_empty());

    match target_type {
        TargetType::All if !role.is_super_admin() => Err(SubscribeError::TenantAccessDenied(
            "ALL-targeted subscriptions require SUPER_ADMIN".into(),
        )),
        TargetType::All => Ok(own_org.to_owned()),
        TargetType::Tenant => {
            let org = target_id.unwrap_or(own_org);
            if org == own_org {
                Ok(org.to_owned())
            } else {
                Err(SubscribeError::TenantAccessDenied(format!(
                    "cannot subscribe to events of organization {org}"
                )))
            }
        }
        TargetType::User => {
            let user = target_id.ok_or_else(|| {
                SubscribeError::InvalidTarget("USER targeting requires targetId".into())
            })?;
            if user == connection.user_id || role.is_admin() {
                Ok(own_org.to_owned())
            } else {
                Err(SubscribeError::InsufficientPermissions(
                    "cannot subscribe to another user's events".into(),
                ))
            }
        }
        TargetType::Flow | TargetType::Room => {
            if target_id.is_none() {
                return Err(SubscribeError::InvalidTarget(format!(
                    "{} targeting requires targetId",
                    target_type.as_str()
                )));
            }
            Ok(own_org.to_owned())
        }
    }
}

/// Whether a subscription accepts a publication's targeting.
fn matches(sub: &Subscription, connection: &ClientConnection, targeting: &Targeting) -> bool {
    match targeting.target_type {
        TargetType::All => true,
        TargetType::Tenant => {
            sub.target_type == TargetType::All || sub.organization_id == targeting.organization_id
        }
        TargetType::User => {
            connection.organization_id == targeting.organization_id
                && targeting.target_id.as_deref() == Some(connection.user_id.as_str())
        }
        TargetType::Flow | TargetType::Room => {
            sub.organization_id == targeting.organization_id
                && sub.target_id.as_deref() == targeting.target_id.as_deref()
        }
    }
}

fn scope_key(event_type: &str, target_id: &str) -> String {
    format!("{event_type}:{target_id}")
}

fn ids_in(index: &Index, key: &str) -> Vec<ConnectionId> {
    index
        .get(key)
        .map(|set| set.iter().cloned().collect())
        .unwrap_or_default()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
