//! The [`MessageType`] enum: every frame type the gateway understands.
//!
//! Each variant serializes to its `SCREAMING_SNAKE_CASE` wire name. The set is
//! closed; an unknown `type` string is a validation failure, not a panic.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Who is allowed to send a message type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Sent by clients, handled by the gateway.
    ClientToServer,
    /// Emitted by the gateway (or published through it).
    ServerToClient,
}

/// All protocol message types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    // -- Client → server --
    /// Application-level liveness probe.
    Ping,
    /// Register interest in event types.
    Subscribe,
    /// Drop interest in event types (or all).
    Unsubscribe,
    /// Publish an event through the gateway.
    EventPublish,
    /// Re-deliver logged events.
    EventReplay,
    /// Start an agent run.
    AgentExecute,
    /// Cancel an agent run.
    AgentCancel,
    /// Run a single tool.
    ToolExecute,
    /// Query a knowledge base.
    KbSearch,
    /// Answer a human-in-the-loop request.
    HitlResponse,
    /// Pause a stream.
    StreamPause,
    /// Resume a paused stream.
    StreamResume,
    /// Cancel a stream.
    StreamCancel,
    /// Ask for latency metrics.
    MetricsRequest,
    /// Ask for gateway health.
    HealthCheck,
    /// Ask for a message type's contract.
    SchemaDescribe,

    // -- Server → client --
    /// Handshake acknowledgment.
    ConnectionAck,
    /// Reply to `PING`.
    Pong,
    /// Generic success reply.
    Ack,
    /// Rejection of a client message.
    Error,
    /// Fan-out delivery of a published event.
    Event,
    /// Agent run started.
    AgentExecutionStart,
    /// Agent run progress.
    AgentExecutionProgress,
    /// Agent run finished.
    AgentExecutionComplete,
    /// Agent run failed.
    AgentExecutionError,
    /// Tool run started.
    ToolExecutionStart,
    /// Tool run finished.
    ToolExecutionComplete,
    /// Human input requested.
    HitlRequest,
    /// Knowledge-base search results.
    KbSearchResult,
    /// Streamed output fragment.
    StreamChunk,
    /// Stream finished.
    StreamEnd,
    /// Reply to `METRICS_REQUEST`.
    MetricsResponse,
    /// Reply to `HEALTH_CHECK`.
    HealthStatus,
    /// Reply to `SCHEMA_DESCRIBE`.
    SchemaDescription,
    /// Threshold alert.
    Alert,
}

/// Every variant, in declaration order.
pub const ALL_MESSAGE_TYPES: &[MessageType] = &[
    MessageType::Ping,
    MessageType::Subscribe,
    MessageType::Unsubscribe,
    MessageType::EventPublish,
    MessageType::EventReplay,
    MessageType::AgentExecute,
    MessageType::AgentCancel,
    MessageType::ToolExecute,
    MessageType::KbSearch,
    MessageType::HitlResponse,
    MessageType::StreamPause,
    MessageType::StreamResume,
    MessageType::StreamCancel,
    MessageType::MetricsRequest,
    MessageType::HealthCheck,
    MessageType::SchemaDescribe,
    MessageType::ConnectionAck,
    MessageType::Pong,
    MessageType::Ack,
    MessageType::Error,
    MessageType::Event,
    MessageType::AgentExecutionStart,
    MessageType::AgentExecutionProgress,
    MessageType::AgentExecutionComplete,
    MessageType::AgentExecutionError,
    MessageType::ToolExecutionStart,
    MessageType::ToolExecutionComplete,
    MessageType::HitlRequest,
    MessageType::KbSearchResult,
    MessageType::StreamChunk,
    MessageType::StreamEnd,
    MessageType::MetricsResponse,
    MessageType::HealthStatus,
    MessageType::SchemaDescription,
    MessageType::Alert,
];

impl MessageType {
    /// Wire name (e.g. `"EVENT_PUBLISH"`).
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ping => "PING",
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::EventPublish => "EVENT_PUBLISH",
            Self::EventReplay => "EVENT_REPLAY",
            Self::AgentExecute => "AGENT_EXECUTE",
            Self::AgentCancel => "AGENT_CANCEL",
            Self::ToolExecute => "TOOL_EXECUTE",
            Self::KbSearch => "KB_SEARCH",
            Self::HitlResponse => "HITL_RESPONSE",
            Self::StreamPause => "STREAM_PAUSE",
            Self::StreamResume => "STREAM_RESUME",
            Self::StreamCancel => "STREAM_CANCEL",
            Self::MetricsRequest => "METRICS_REQUEST",
            Self::HealthCheck => "HEALTH_CHECK",
            Self::SchemaDescribe => "SCHEMA_DESCRIBE",
            Self::ConnectionAck => "CONNECTION_ACK",
            Self::Pong => "PONG",
            Self::Ack => "ACK",
            Self::Error => "ERROR",
            Self::Event => "EVENT",
            Self::AgentExecutionStart => "AGENT_EXECUTION_START",
            Self::AgentExecutionProgress => "AGENT_EXECUTION_PROGRESS",
            Self::AgentExecutionComplete => "AGENT_EXECUTION_COMPLETE",
            Self::AgentExecutionError => "AGENT_EXECUTION_ERROR",
            Self::ToolExecutionStart => "TOOL_EXECUTION_START",
            Self::ToolExecutionComplete => "TOOL_EXECUTION_COMPLETE",
            Self::HitlRequest => "HITL_REQUEST",
            Self::KbSearchResult => "KB_SEARCH_RESULT",
            Self::StreamChunk => "STREAM_CHUNK",
            Self::StreamEnd => "STREAM_END",
            Self::MetricsResponse => "METRICS_RESPONSE",
            Self::HealthStatus => "HEALTH_STATUS",
            Self::SchemaDescription => "SCHEMA_DESCRIPTION",
            Self::Alert => "ALERT",
        }
    }

    /// Parse a wire name. Returns `None` for anything outside the catalogue.
    pub fn parse(s: &str) -> Option<Self> {
        ALL_MESSAGE_TYPES.iter().copied().find(|t| t.as_str() == s)
    }

    /// Who may send this type.
    #[must_use]
    pub fn direction(self) -> Direction {
        if (self as usize) <= (Self::SchemaDescribe as usize) {
            Direction::ClientToServer
        } else {
            Direction::ServerToClient
        }
    }

    /// Execution-engine lifecycle types that may also be published as events.
    #[must_use]
    pub fn is_lifecycle(self) -> bool {
        matches!(
            self,
            Self::AgentExecutionStart
                | Self::AgentExecutionProgress
                | Self::AgentExecutionComplete
                | Self::AgentExecutionError
                | Self::ToolExecutionStart
                | Self::ToolExecutionComplete
                | Self::HitlRequest
                | Self::KbSearchResult
                | Self::StreamChunk
                | Self::StreamEnd
        )
    }

    /// Client types counted against the execution budget.
    #[must_use]
    pub fn is_execution(self) -> bool {
        matches!(self, Self::AgentExecute | Self::ToolExecute)
    }

    /// Client types that open a streaming session.
    #[must_use]
    pub fn starts_stream(self) -> bool {
        matches!(self, Self::AgentExecute | Self::ToolExecute | Self::KbSearch)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("unknown message type: {s}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn as_str_matches_serde() {
        for t in ALL_MESSAGE_TYPES {
            let json = serde_json::to_value(t).unwrap();
            assert_eq!(json, serde_json::Value::String(t.as_str().to_owned()));
        }
    }

    #[test]
    fn parse_roundtrips_every_variant() {
        for t in ALL_MESSAGE_TYPES {
            assert_eq!(MessageType::parse(t.as_str()), Some(*t));
        }
        assert_eq!(MessageType::parse("NOPE"), None);
        assert!("ping".parse::<MessageType>().is_err());
    }

    #[test]
    fn direction_split() {
        assert_eq!(MessageType::Ping.direction(), Direction::ClientToServer);
        assert_eq!(MessageType::SchemaDescribe.direction(), Direction::ClientToServer);
        assert_eq!(MessageType::ConnectionAck.direction(), Direction::ServerToClient);
        assert_eq!(MessageType::Alert.direction(), Direction::ServerToClient);
        let client = ALL_MESSAGE_TYPES
            .iter()
            .filter(|t| t.direction() == Direction::ClientToServer)
            .count();
        assert_eq!(client, 16);
    }

    #[test]
    fn lifecycle_types_are_server_side() {
        for t in ALL_MESSAGE_TYPES.iter().filter(|t| t.is_lifecycle()) {
            assert_eq!(t.direction(), Direction::ServerToClient, "{t}");
        }
    }

    #[test]
    fn stream_starters() {
        assert!(MessageType::KbSearch.starts_stream());
        assert!(!MessageType::KbSearch.is_execution());
        assert!(MessageType::AgentExecute.is_execution());
        assert!(!MessageType::Subscribe.starts_stream());
    }
}
