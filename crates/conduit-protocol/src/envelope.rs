//! The JSON frame that wraps every message in both directions.
//!
//! ```json
//! {
//!   "type": "SUBSCRIBE",
//!   "session_id": "s-1",
//!   "request_id": "r-1",
//!   "payload": { "eventTypes": ["agent.completed"] },
//!   "timestamp": "2025-01-01T00:00:00.000Z"
//! }
//! ```

use conduit_core::clock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message_type::MessageType;
use crate::policy::SecurityLevel;

/// Wire envelope. Id fields keep their `snake_case` names on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message type.
    #[serde(rename = "type")]
    pub message_type: MessageType,
    /// Client session. Server pushes carry the connection or instance id.
    pub session_id: String,
    /// Request id, echoed in replies.
    pub request_id: String,
    /// Type-specific payload.
    #[serde(default)]
    pub payload: Value,
    /// RFC 3339 timestamp (or the client's own numeric form).
    #[serde(default)]
    pub timestamp: String,
    /// Ties related messages together across modules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Classification declared by the sender.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_level: Option<SecurityLevel>,
    /// Permissions declared by the sender.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<Vec<String>>,
    /// Free-form metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    /// Base64 HMAC-SHA256 signature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl Envelope {
    /// Build a server-originated envelope stamped with the current time.
    pub fn new(
        message_type: MessageType,
        session_id: impl Into<String>,
        request_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            message_type,
            session_id: session_id.into(),
            request_id: request_id.into(),
            payload,
            timestamp: clock::now_rfc3339(),
            correlation_id: None,
            security_level: None,
            permissions: None,
            metadata: None,
            signature: None,
        }
    }

    /// Build a reply that echoes this envelope's ids.
    #[must_use]
    pub fn reply(&self, message_type: MessageType, payload: Value) -> Self {
        let mut out = Self::new(message_type, &*self.session_id, &*self.request_id, payload);
        out.correlation_id.clone_from(&self.correlation_id);
        out
    }

    /// Attach a correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// Serialize to a text frame.
    pub fn to_text(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
