//! Raw row shapes for the audit tables.
//!
//! Conversion to the protocol types happens here and in the repositories.

use conduit_core::EventId;
use conduit_protocol::{EventPublication, Priority, Targeting};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::Result;

/// Raw row from `event_log`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventLogRow {
    /// Event id.
    pub event_id: String,
    /// Event type.
    pub event_type: String,
    /// Emitting module.
    pub source_module: String,
    /// Intended consumer module.
    pub target_module: Option<String>,
    /// Payload as JSON text.
    pub payload: String,
    /// Targeting organization (denormalized for indexing).
    pub organization_id: String,
    /// Targeting as JSON text.
    pub targeting: String,
    /// Priority wire name.
    pub priority: String,
    /// Correlation id.
    pub correlation_id: Option<String>,
    /// Causing event.
    pub parent_event_id: Option<String>,
    /// Unix milliseconds.
    pub timestamp: i64,
    /// Whether a consumer marked the row handled.
    pub processed: bool,
    /// When it was marked handled.
    pub processed_at: Option<String>,
    /// Delivery retries recorded against this row.
    pub retry_count: i64,
}

impl EventLogRow {
    /// Rebuild the publication this row was written from.
    pub fn to_publication(&self) -> Result<EventPublication> {
        let payload: Value = serde_json::from_str(&self.payload)?;
        let targeting: Targeting = serde_json::from_str(&self.targeting)?;
        let priority: Priority = serde_json::from_value(Value::String(self.priority.clone()))?;
        Ok(EventPublication {
            event_id: EventId::from(self.event_id.as_str()),
            event_type: self.event_type.clone(),
            source_module: self.source_module.clone(),
            target_module: self.target_module.clone(),
            payload,
            targeting,
            priority,
            correlation_id: self.correlation_id.clone(),
            parent_event_id: self.parent_event_id.as_deref().map(EventId::from),
            timestamp: self.timestamp,
            origin_instance: None,
        })
    }
}

/// Raw row from `subscriptions`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubscriptionRow {
    /// Row id.
    pub id: i64,
    /// Owning connection.
    pub connection_id: String,
    /// Owning user.
    pub user_id: String,
    /// Owning organization.
    pub organization_id: String,
    /// Subscribed event type.
    pub event_type: String,
    /// Target type wire name.
    pub target_type: String,
    /// Flow/room/user id.
    pub target_id: Option<String>,
    /// Filters as JSON text.
    pub filters: Option<String>,
    /// Whether the subscription is live.
    pub active: bool,
    /// RFC 3339 creation time.
    pub subscribed_at: String,
    /// RFC 3339 deactivation time.
    pub deactivated_at: Option<String>,
}
