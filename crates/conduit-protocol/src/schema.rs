//! Per-type payload contracts.
//!
//! [`MessageType::schema`] is an exhaustive match, so adding a variant
//! without a contract does not compile.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::FieldError;
use crate::message_type::{Direction, MessageType};
use crate::policy::{Capability, SecurityLevel};

/// JSON shape a field must have.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldKind {
    /// JSON string.
    #[serde(rename = "string")]
    String,
    /// Any JSON number.
    #[serde(rename = "number")]
    Number,
    /// Integral JSON number.
    #[serde(rename = "integer")]
    Integer,
    /// JSON boolean.
    #[serde(rename = "boolean")]
    Boolean,
    /// JSON object.
    #[serde(rename = "object")]
    Object,
    /// JSON array of anything.
    #[serde(rename = "array")]
    Array,
    /// JSON array of strings.
    #[serde(rename = "string[]")]
    StringArray,
    /// Anything but `null`.
    #[serde(rename = "any")]
    Any,
}

impl FieldKind {
    /// Whether `value` has this shape.
    pub fn matches(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
            Self::StringArray => value
                .as_array()
                .is_some_and(|items| items.iter().all(Value::is_string)),
            Self::Any => !value.is_null(),
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
            Self::StringArray => "array of strings",
            Self::Any => "non-null value",
        }
    }
}

/// One named payload field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct FieldSpec {
    /// Payload key.
    pub name: &'static str,
    /// Expected shape.
    pub kind: FieldKind,
}

macro_rules! field {
    ($name:literal, $kind:expr) => {
        FieldSpec {
            name: $name,
            kind: $kind,
        }
    };
}

/// Static contract of one message type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageSchema {
    /// Fields that must be present and well-typed.
    pub required: &'static [FieldSpec],
    /// Fields that are checked only when present and non-null.
    pub optional: &'static [FieldSpec],
    /// Capability needed to send this type.
    pub min_permission: Capability,
    /// Minimum role classification.
    pub required_security: SecurityLevel,
    /// Whether any `organizationId` in the payload must match the sender's.
    pub tenant_isolation_required: bool,
    /// Who sends it.
    pub direction: Direction,
}

impl MessageSchema {
    /// Structural check of a payload. Returns every problem found.
    pub fn check_payload(&self, payload: &Value) -> Vec<FieldError> {
        let Some(obj) = payload.as_object() else {
            return vec![FieldError::new("payload", "must be an object")];
        };

        let mut errors = Vec::new();
        for spec in self.required {
            match obj.get(spec.name) {
                None | Some(Value::Null) => {
                    errors.push(FieldError::new(field_path(spec.name), "is required"));
                }
                Some(v) if !spec.kind.matches(v) => {
                    errors.push(FieldError::new(
                        field_path(spec.name),
                        format!("expected {}", spec.kind.label()),
                    ));
                }
                Some(_) => {}
            }
        }
        for spec in self.optional {
            if let Some(v) = obj.get(spec.name).filter(|v| !v.is_null()) {
                if !spec.kind.matches(v) {
                    errors.push(FieldError::new(
                        field_path(spec.name),
                        format!("expected {}", spec.kind.label()),
                    ));
                }
            }
        }
        errors
    }
}

fn field_path(name: &str) -> String {
    format!("payload.{name}")
}

/// Introspectable form of a schema, returned by `SCHEMA_DESCRIBE` and
/// `GET /schemas/{type}`.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaDescription {
    /// Wire name.
    pub message_type: MessageType,
    /// Who sends it.
    pub direction: Direction,
    /// Required fields.
    pub required_fields: Vec<FieldSpec>,
    /// Optional fields.
    pub optional_fields: Vec<FieldSpec>,
    /// Capability needed.
    pub min_permission: Capability,
    /// Minimum classification.
    pub required_security: SecurityLevel,
    /// Tenant isolation flag.
    pub tenant_isolation_required: bool,
}

impl MessageType {
    /// Contract for this type.
    #[allow(clippy::too_many_lines)]
    #[must_use]
    pub fn schema(self) -> MessageSchema {
        use Capability::{Execute, Read, Write};
        use Direction::{ClientToServer as C2S, ServerToClient as S2C};
        use FieldKind::{Any, Array, Boolean, Integer, Number, Object, String, StringArray};
        use SecurityLevel::{Confidential, Internal, Public};

        let (required, optional, min_permission, required_security, tenant, direction): (
            &'static [FieldSpec],
            &'static [FieldSpec],
            _,
            _,
            _,
            _,
        ) = match self {
            // -- Client → server --
            Self::Ping => (&[], &[], Read, Public, false, C2S),
            Self::Subscribe => (
                &[field!("eventTypes", StringArray)],
                &[
                    field!("targetType", String),
                    field!("targetId", String),
                    field!("filters", Object),
                ],
                Read,
                Internal,
                true,
                C2S,
            ),
            Self::Unsubscribe => (&[], &[field!("eventTypes", StringArray)], Read, Internal, true, C2S),
            Self::EventPublish => (
                &[field!("eventType", String), field!("data", Any)],
                &[
                    field!("targeting", Object),
                    field!("priority", String),
                    field!("targetModule", String),
                ],
                Write,
                Internal,
                true,
                C2S,
            ),
            Self::EventReplay => (
                &[field!("fromTimestamp", Integer)],
                &[
                    field!("toTimestamp", Integer),
                    field!("eventTypes", StringArray),
                    field!("correlationId", String),
                    field!("maxEvents", Integer),
                    field!("organizationId", String),
                ],
                Read,
                Internal,
                true,
                C2S,
            ),
            Self::AgentExecute => (
                &[field!("agentId", String), field!("input", Any)],
                &[field!("config", Object)],
                Execute,
                Internal,
                true,
                C2S,
            ),
            Self::AgentCancel => (&[field!("streamId", String)], &[], Execute, Internal, true, C2S),
            Self::ToolExecute => (
                &[field!("toolName", String), field!("arguments", Object)],
                &[],
                Execute,
                Internal,
                true,
                C2S,
            ),
            Self::KbSearch => (
                &[field!("knowledgeBaseId", String), field!("query", String)],
                &[field!("topK", Integer)],
                Read,
                Internal,
                true,
                C2S,
            ),
            Self::HitlResponse => (
                &[field!("hitlRequestId", String), field!("decision", String)],
                &[field!("comment", String)],
                Write,
                Internal,
                true,
                C2S,
            ),
            Self::StreamPause | Self::StreamResume | Self::StreamCancel => {
                (&[field!("streamId", String)], &[], Read, Internal, true, C2S)
            }
            Self::MetricsRequest => (
                &[],
                &[field!("windowMs", Integer), field!("organizationId", String)],
                Read,
                Confidential,
                true,
                C2S,
            ),
            Self::HealthCheck => (&[], &[], Read, Public, false, C2S),
            Self::SchemaDescribe => (&[field!("messageType", String)], &[], Read, Public, false, C2S),

            // -- Server → client --
            Self::ConnectionAck => (
                &[
                    field!("connectionId", String),
                    field!("protocolVersion", String),
                    field!("features", StringArray),
                    field!("rateLimits", Object),
                    field!("maxPayloadBytes", Integer),
                    field!("heartbeatIntervalSecs", Integer),
                ],
                &[],
                Read,
                Public,
                false,
                S2C,
            ),
            Self::Pong => (&[], &[field!("serverTime", Integer)], Read, Public, false, S2C),
            Self::Ack => (
                &[],
                &[field!("requestType", String), field!("data", Any)],
                Read,
                Public,
                false,
                S2C,
            ),
            Self::Error => (
                &[field!("code", String), field!("category", String), field!("message", String)],
                &[field!("fieldErrors", Array), field!("retryAfterMs", Integer)],
                Read,
                Public,
                false,
                S2C,
            ),
            Self::Event => (
                &[
                    field!("eventId", String),
                    field!("eventType", String),
                    field!("data", Any),
                    field!("timestamp", Integer),
                ],
                &[
                    field!("correlationId", String),
                    field!("sourceModule", String),
                    field!("priority", String),
                ],
                Read,
                Internal,
                true,
                S2C,
            ),
            Self::AgentExecutionStart => (
                &[field!("streamId", String), field!("agentId", String)],
                &[field!("startedAt", Integer)],
                Read,
                Internal,
                true,
                S2C,
            ),
            Self::AgentExecutionProgress => (
                &[field!("streamId", String)],
                &[
                    field!("progress", Number),
                    field!("message", String),
                    field!("data", Any),
                ],
                Read,
                Internal,
                true,
                S2C,
            ),
            Self::AgentExecutionComplete => (
                &[field!("streamId", String)],
                &[field!("result", Any), field!("durationMs", Integer)],
                Read,
                Internal,
                true,
                S2C,
            ),
            Self::AgentExecutionError => (
                &[field!("streamId", String), field!("error", String)],
                &[field!("code", String)],
                Read,
                Internal,
                true,
                S2C,
            ),
            Self::ToolExecutionStart => (
                &[field!("streamId", String), field!("toolName", String)],
                &[],
                Read,
                Internal,
                true,
                S2C,
            ),
            Self::ToolExecutionComplete => (
                &[field!("streamId", String), field!("toolName", String)],
                &[field!("result", Any), field!("durationMs", Integer)],
                Read,
                Internal,
                true,
                S2C,
            ),
            Self::HitlRequest => (
                &[field!("hitlRequestId", String), field!("prompt", String)],
                &[
                    field!("options", Array),
                    field!("streamId", String),
                    field!("timeoutMs", Integer),
                ],
                Read,
                Internal,
                true,
                S2C,
            ),
            Self::KbSearchResult => (
                &[field!("streamId", String), field!("results", Array)],
                &[],
                Read,
                Internal,
                true,
                S2C,
            ),
            Self::StreamChunk => (
                &[field!("streamId", String), field!("chunk", Any)],
                &[field!("sequence", Integer)],
                Read,
                Internal,
                true,
                S2C,
            ),
            Self::StreamEnd => (
                &[field!("streamId", String)],
                &[field!("reason", String)],
                Read,
                Internal,
                true,
                S2C,
            ),
            Self::MetricsResponse => (
                &[
                    field!("windowMs", Integer),
                    field!("avgLatencyMs", Number),
                    field!("p95LatencyMs", Number),
                    field!("p99LatencyMs", Number),
                    field!("throughput", Number),
                    field!("errorRate", Number),
                    field!("activeConnections", Integer),
                    field!("sampleCount", Integer),
                ],
                &[field!("organizationId", String)],
                Read,
                Confidential,
                true,
                S2C,
            ),
            Self::HealthStatus => (
                &[field!("status", String)],
                &[field!("checks", Object), field!("instanceId", String)],
                Read,
                Public,
                false,
                S2C,
            ),
            Self::SchemaDescription => (
                &[
                    field!("messageType", String),
                    field!("direction", String),
                    field!("requiredFields", Array),
                    field!("optionalFields", Array),
                    field!("minPermission", String),
                    field!("requiredSecurity", String),
                    field!("tenantIsolationRequired", Boolean),
                ],
                &[],
                Read,
                Public,
                false,
                S2C,
            ),
            Self::Alert => (
                &[
                    field!("rule", String),
                    field!("severity", String),
                    field!("message", String),
                    field!("organizationId", String),
                ],
                &[field!("value", Number), field!("threshold", Number)],
                Read,
                Internal,
                true,
                S2C,
            ),
        };

        MessageSchema {
            required,
            optional,
            min_permission,
            required_security,
            tenant_isolation_required: tenant,
            direction,
        }
    }

    /// Introspectable description of [`schema`](Self::schema).
    #[must_use]
    pub fn describe(self) -> SchemaDescription {
        let schema = self.schema();
        SchemaDescription {
            message_type: self,
            direction: schema.direction,
            required_fields: schema.required.to_vec(),
            optional_fields: schema.optional.to_vec(),
            min_permission: schema.min_permission,
            required_security: schema.required_security,
            tenant_isolation_required: schema.tenant_isolation_required,
        }
    }
}
