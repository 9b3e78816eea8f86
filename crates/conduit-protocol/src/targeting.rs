//! Event publication and addressing types.
//!
//! An [`EventPublication`] is built per publish call and is also the unit
//! carried on the cross-instance broker, so it round-trips through JSON.

use conduit_core::{EventId, clock};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::{SOURCE_GATEWAY, SOURCE_REPLAY};
use crate::policy::Role;

/// Addressing mode of a subscription or publication.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TargetType {
    /// Every subscriber of the event type, across organizations.
    All,
    /// Subscribers within one organization.
    #[default]
    Tenant,
    /// One user's connections.
    User,
    /// Subscribers of one flow.
    Flow,
    /// Subscribers of one room.
    Room,
}

impl TargetType {
    /// Wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::All => "ALL",
            Self::Tenant => "TENANT",
            Self::User => "USER",
            Self::Flow => "FLOW",
            Self::Room => "ROOM",
        }
    }

    /// Whether subscriptions of this type are indexed by target id.
    #[must_use]
    pub fn is_scoped(self) -> bool {
        matches!(self, Self::Flow | Self::Room)
    }
}

/// Extra delivery constraints.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EventFilters {
    /// Only deliver to connections holding this role.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
}

/// Addressing of a publication.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Targeting {
    /// Addressing mode.
    #[serde(rename = "type")]
    pub target_type: TargetType,
    /// Organization the event belongs to.
    pub organization_id: String,
    /// User, flow or room id, depending on the mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    /// Extra constraints.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<EventFilters>,
}

impl Targeting {
    fn build(target_type: TargetType, org: &str, target_id: Option<&str>) -> Self {
        Self {
            target_type,
            organization_id: org.to_owned(),
            target_id: target_id.map(str::to_owned),
            filters: None,
        }
    }

    /// Everyone subscribed, in every organization.
    pub fn all(org: &str) -> Self {
        Self::build(TargetType::All, org, None)
    }

    /// Subscribers in `org`.
    pub fn tenant(org: &str) -> Self {
        Self::build(TargetType::Tenant, org, None)
    }

    /// `user_id`'s subscribed connections.
    pub fn user(org: &str, user_id: &str) -> Self {
        Self::build(TargetType::User, org, Some(user_id))
    }

    /// Subscribers of flow `flow_id` in `org`.
    pub fn flow(org: &str, flow_id: &str) -> Self {
        Self::build(TargetType::Flow, org, Some(flow_id))
    }

    /// Subscribers of room `room_id` in `org`.
    pub fn room(org: &str, room_id: &str) -> Self {
        Self::build(TargetType::Room, org, Some(room_id))
    }

    /// Restrict delivery to one role.
    #[must_use]
    pub fn with_role_filter(mut self, role: Role) -> Self {
        self.filters = Some(EventFilters { role: Some(role) });
        self
    }

    /// Role filter, if any.
    pub fn role_filter(&self) -> Option<Role> {
        self.filters.as_ref().and_then(|f| f.role)
    }
}

/// Delivery priority.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Background.
    Low,
    /// Default.
    #[default]
    Normal,
    /// Alerts and cross-module signals.
    High,
}

impl Priority {
    /// Wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
        }
    }
}

/// Optional knobs for a publish call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishOptions {
    /// Delivery priority.
    pub priority: Priority,
    /// Correlation id.
    pub correlation_id: Option<String>,
    /// Causing event.
    pub parent_event_id: Option<EventId>,
    /// Emitting module.
    pub source_module: String,
    /// Intended consumer module.
    pub target_module: Option<String>,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            priority: Priority::Normal,
            correlation_id: None,
            parent_event_id: None,
            source_module: SOURCE_GATEWAY.to_owned(),
            target_module: None,
        }
    }
}

/// One emitted event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPublication {
    /// Unique id.
    pub event_id: EventId,
    /// Topic.
    pub event_type: String,
    /// Emitting module (`"replay"` for re-emitted log entries).
    pub source_module: String,
    /// Intended consumer module.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_module: Option<String>,
    /// Event data.
    pub payload: Value,
    /// Addressing.
    pub targeting: Targeting,
    /// Priority.
    #[serde(default)]
    pub priority: Priority,
    /// Correlation id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Causing event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_event_id: Option<EventId>,
    /// Unix milliseconds.
    pub timestamp: i64,
    /// Gateway instance that put this publication on the broker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_instance: Option<String>,
}

impl EventPublication {
    /// Build a new publication stamped now.
    pub fn new(
        event_type: impl Into<String>,
        payload: Value,
        targeting: Targeting,
        options: PublishOptions,
    ) -> Self {
        Self {
            event_id: EventId::new(),
            event_type: event_type.into(),
            source_module: options.source_module,
            target_module: options.target_module,
            payload,
            targeting,
            priority: options.priority,
            correlation_id: options.correlation_id,
            parent_event_id: options.parent_event_id,
            timestamp: clock::now_ms(),
            origin_instance: None,
        }
    }

    /// Whether this publication was re-emitted from the event log.
    #[must_use]
    pub fn is_replay(&self) -> bool {
        self.source_module == SOURCE_REPLAY
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn targeting_wire_shape() {
        let t = Targeting::room("org-1", "room-7").with_role_filter(Role::Admin);
        let json = serde_json::to_value(&t).unwrap();
        assert_eq!(json["type"], "ROOM");
        assert_eq!(json["organizationId"], "org-1");
        assert_eq!(json["targetId"], "room-7");
        assert_eq!(json["filters"]["role"], "ADMIN");
        assert_eq!(t.role_filter(), Some(Role::Admin));
        assert!(t.target_type.is_scoped());
    }

    #[test]
    fn publication_roundtrips_through_json() {
        let opts = PublishOptions {
            priority: Priority::High,
            correlation_id: Some("corr".into()),
            ..PublishOptions::default()
        };
        let publication = EventPublication::new("agent.done", json!({"ok": true}), Targeting::tenant("o"), opts);
        let text = serde_json::to_string(&publication).unwrap();
        let back: EventPublication = serde_json::from_str(&text).unwrap();
        assert_eq!(back, publication);
        assert_eq!(back.source_module, "gateway");
        assert!(!back.is_replay());
        assert!(text.contains("\"priority\":\"high\""));
    }

    #[test]
    fn defaults() {
        assert_eq!(TargetType::default(), TargetType::Tenant);
        assert_eq!(Priority::default(), Priority::Normal);
        assert!(!TargetType::User.is_scoped());
    }
}
