//! Typed payloads and the [`ClientMessage`] sum type.
//!
//! A validated envelope's `(type, payload)` pair is turned into a
//! [`ClientMessage`] variant so handlers never touch untyped JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{self, FieldError, ValidationError};
use crate::message_type::MessageType;
use crate::policy::RolePolicy;
use crate::targeting::{EventFilters, EventPublication, Priority, TargetType, Targeting};

// ── Client → server payloads ────────────────────────────────────────

/// `SUBSCRIBE`.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribePayload {
    /// Topics to subscribe to.
    pub event_types: Vec<String>,
    /// Addressing mode (TENANT when absent).
    #[serde(default)]
    pub target_type: Option<TargetType>,
    /// User, flow or room id.
    #[serde(default)]
    pub target_id: Option<String>,
    /// Extra constraints.
    #[serde(default)]
    pub filters: Option<EventFilters>,
}

/// `UNSUBSCRIBE`. No event types means all of them.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsubscribePayload {
    /// Topics to drop.
    #[serde(default)]
    pub event_types: Option<Vec<String>>,
}

/// Addressing requested by a client; the organization defaults to the
/// sender's.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetingRequest {
    /// Addressing mode.
    #[serde(rename = "type")]
    pub target_type: TargetType,
    /// Organization, when different from the sender's.
    #[serde(default)]
    pub organization_id: Option<String>,
    /// User, flow or room id.
    #[serde(default)]
    pub target_id: Option<String>,
    /// Extra constraints.
    #[serde(default)]
    pub filters: Option<EventFilters>,
}

impl TargetingRequest {
    /// Fill in the sender's organization.
    pub fn resolve(self, sender_org: &str) -> Targeting {
        Targeting {
            target_type: self.target_type,
            organization_id: self.organization_id.unwrap_or_else(|| sender_org.to_owned()),
            target_id: self.target_id,
            filters: self.filters,
        }
    }
}

/// `EVENT_PUBLISH`.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPublishPayload {
    /// Topic.
    pub event_type: String,
    /// Event data.
    pub data: Value,
    /// Addressing (TENANT in the sender's organization when absent).
    #[serde(default)]
    pub targeting: Option<TargetingRequest>,
    /// Priority.
    #[serde(default)]
    pub priority: Option<Priority>,
    /// Intended consumer module.
    #[serde(default)]
    pub target_module: Option<String>,
}

/// `EVENT_REPLAY`.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventReplayPayload {
    /// Inclusive lower bound, Unix milliseconds.
    pub from_timestamp: i64,
    /// Inclusive upper bound, Unix milliseconds.
    #[serde(default)]
    pub to_timestamp: Option<i64>,
    /// Topic filter.
    #[serde(default)]
    pub event_types: Option<Vec<String>>,
    /// Correlation filter.
    #[serde(default)]
    pub correlation_id: Option<String>,
    /// Limit.
    #[serde(default)]
    pub max_events: Option<usize>,
    /// Organization, when different from the sender's.
    #[serde(default)]
    pub organization_id: Option<String>,
}

/// `AGENT_EXECUTE`.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentExecutePayload {
    /// Agent to run.
    pub agent_id: String,
    /// Agent input.
    pub input: Value,
    /// Run configuration.
    #[serde(default)]
    pub config: Option<Value>,
}

/// `TOOL_EXECUTE`.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolExecutePayload {
    /// Tool to run.
    pub tool_name: String,
    /// Tool arguments.
    pub arguments: Value,
}

/// `KB_SEARCH`.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KbSearchPayload {
    /// Knowledge base to query.
    pub knowledge_base_id: String,
    /// Query text.
    pub query: String,
    /// Result count.
    #[serde(default)]
    pub top_k: Option<u32>,
}

/// `HITL_RESPONSE`.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HitlResponsePayload {
    /// Request being answered.
    pub hitl_request_id: String,
    /// Decision (e.g. `approve`, `reject`).
    pub decision: String,
    /// Free-form comment.
    #[serde(default)]
    pub comment: Option<String>,
}

/// `AGENT_CANCEL`, `STREAM_PAUSE`, `STREAM_RESUME`, `STREAM_CANCEL`.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamControlPayload {
    /// Target stream.
    pub stream_id: String,
}

/// `METRICS_REQUEST`.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsRequestPayload {
    /// Window length in milliseconds.
    #[serde(default)]
    pub window_ms: Option<i64>,
    /// Organization, when different from the sender's.
    #[serde(default)]
    pub organization_id: Option<String>,
}

/// `SCHEMA_DESCRIBE`.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaDescribePayload {
    /// Type to describe.
    pub message_type: String,
}

/// Every message a client may send, with its typed payload.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientMessage {
    /// `PING`.
    Ping,
    /// `SUBSCRIBE`.
    Subscribe(SubscribePayload),
    /// `UNSUBSCRIBE`.
    Unsubscribe(UnsubscribePayload),
    /// `EVENT_PUBLISH`.
    EventPublish(EventPublishPayload),
    /// `EVENT_REPLAY`.
    EventReplay(EventReplayPayload),
    /// `AGENT_EXECUTE`.
    AgentExecute(AgentExecutePayload),
    /// `AGENT_CANCEL`.
    AgentCancel(StreamControlPayload),
    /// `TOOL_EXECUTE`.
    ToolExecute(ToolExecutePayload),
    /// `KB_SEARCH`.
    KbSearch(KbSearchPayload),
    /// `HITL_RESPONSE`.
    HitlResponse(HitlResponsePayload),
    /// `STREAM_PAUSE`.
    StreamPause(StreamControlPayload),
    /// `STREAM_RESUME`.
    StreamResume(StreamControlPayload),
    /// `STREAM_CANCEL`.
    StreamCancel(StreamControlPayload),
    /// `METRICS_REQUEST`.
    MetricsRequest(MetricsRequestPayload),
    /// `HEALTH_CHECK`.
    HealthCheck,
    /// `SCHEMA_DESCRIBE`.
    SchemaDescribe(SchemaDescribePayload),
}

fn typed<T: for<'de> Deserialize<'de>>(message_type: MessageType, payload: Value) -> Result<T, ValidationError> {
    serde_json::from_value(payload).map_err(|e| {
        ValidationError::with_fields(
            errors::SCHEMA_VALIDATION_FAILED,
            format!("invalid {message_type} payload"),
            vec![FieldError::new("payload", e.to_string())],
        )
    })
}

impl ClientMessage {
    /// Build the typed message for `message_type` from a payload that has
    /// already passed structural validation.
    pub fn parse(message_type: MessageType, payload: Value) -> Result<Self, ValidationError> {
        let t = message_type;
        Ok(match t {
            MessageType::Ping => Self::Ping,
            MessageType::Subscribe => Self::Subscribe(typed(t, payload)?),
            MessageType::Unsubscribe => Self::Unsubscribe(typed(t, payload)?),
            MessageType::EventPublish => Self::EventPublish(typed(t, payload)?),
            MessageType::EventReplay => Self::EventReplay(typed(t, payload)?),
            MessageType::AgentExecute => Self::AgentExecute(typed(t, payload)?),
            MessageType::AgentCancel => Self::AgentCancel(typed(t, payload)?),
            MessageType::ToolExecute => Self::ToolExecute(typed(t, payload)?),
            MessageType::KbSearch => Self::KbSearch(typed(t, payload)?),
            MessageType::HitlResponse => Self::HitlResponse(typed(t, payload)?),
            MessageType::StreamPause => Self::StreamPause(typed(t, payload)?),
            MessageType::StreamResume => Self::StreamResume(typed(t, payload)?),
            MessageType::StreamCancel => Self::StreamCancel(typed(t, payload)?),
            MessageType::MetricsRequest => Self::MetricsRequest(typed(t, payload)?),
            MessageType::HealthCheck => Self::HealthCheck,
            MessageType::SchemaDescribe => Self::SchemaDescribe(typed(t, payload)?),
            MessageType::ConnectionAck
            | MessageType::Pong
            | MessageType::Ack
            | MessageType::Error
            | MessageType::Event
            | MessageType::AgentExecutionStart
            | MessageType::AgentExecutionProgress
            | MessageType::AgentExecutionComplete
            | MessageType::AgentExecutionError
            | MessageType::ToolExecutionStart
            | MessageType::ToolExecutionComplete
            | MessageType::HitlRequest
            | MessageType::KbSearchResult
            | MessageType::StreamChunk
            | MessageType::StreamEnd
            | MessageType::MetricsResponse
            | MessageType::HealthStatus
            | MessageType::SchemaDescription
            | MessageType::Alert => {
                return Err(ValidationError::new(
                    errors::UNSUPPORTED_DIRECTION,
                    format!("{t} is a server-to-client message"),
                ));
            }
        })
    }

    /// Message type of this variant.
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Ping => MessageType::Ping,
            Self::Subscribe(_) => MessageType::Subscribe,
            Self::Unsubscribe(_) => MessageType::Unsubscribe,
            Self::EventPublish(_) => MessageType::EventPublish,
            Self::EventReplay(_) => MessageType::EventReplay,
            Self::AgentExecute(_) => MessageType::AgentExecute,
            Self::AgentCancel(_) => MessageType::AgentCancel,
            Self::ToolExecute(_) => MessageType::ToolExecute,
            Self::KbSearch(_) => MessageType::KbSearch,
            Self::HitlResponse(_) => MessageType::HitlResponse,
            Self::StreamPause(_) => MessageType::StreamPause,
            Self::StreamResume(_) => MessageType::StreamResume,
            Self::StreamCancel(_) => MessageType::StreamCancel,
            Self::MetricsRequest(_) => MessageType::MetricsRequest,
            Self::HealthCheck => MessageType::HealthCheck,
            Self::SchemaDescribe(_) => MessageType::SchemaDescribe,
        }
    }
}

// ── Server → client payloads ────────────────────────────────────────

/// Per-minute budgets advertised at handshake.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimits {
    /// Inbound messages per minute.
    pub messages_per_minute: u64,
    /// Executions per minute.
    pub executions_per_minute: u64,
    /// Stream starts per minute.
    pub streams_per_minute: u64,
}

impl From<&RolePolicy> for RateLimits {
    fn from(policy: &RolePolicy) -> Self {
        Self {
            messages_per_minute: policy.messages_per_window,
            executions_per_minute: policy.executions_per_window,
            streams_per_minute: policy.streams_per_window,
        }
    }
}

/// `CONNECTION_ACK`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionAckPayload {
    /// Assigned connection id.
    pub connection_id: String,
    /// Protocol version.
    pub protocol_version: String,
    /// Supported features.
    pub features: Vec<String>,
    /// Caller's budgets.
    pub rate_limits: RateLimits,
    /// Caller's payload cap.
    pub max_payload_bytes: usize,
    /// Expected heartbeat cadence.
    pub heartbeat_interval_secs: u64,
}

/// `ACK`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckPayload {
    /// Type of the acknowledged request.
    pub request_type: MessageType,
    /// Result detail.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

/// `EVENT`: one fan-out delivery.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventDelivery {
    /// Event id.
    pub event_id: String,
    /// Topic.
    pub event_type: String,
    /// Event data.
    pub data: Value,
    /// Unix milliseconds.
    pub timestamp: i64,
    /// Correlation id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Emitting module.
    pub source_module: String,
    /// Priority.
    pub priority: Priority,
}

impl From<&EventPublication> for EventDelivery {
    fn from(p: &EventPublication) -> Self {
        Self {
            event_id: p.event_id.to_string(),
            event_type: p.event_type.clone(),
            data: p.payload.clone(),
            timestamp: p.timestamp,
            correlation_id: p.correlation_id.clone(),
            source_module: p.source_module.clone(),
            priority: p.priority,
        }
    }
}
