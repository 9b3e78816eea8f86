//! The inbound validation pipeline.
//!
//! [`SchemaRegistry::validate`] runs, in order:
//! 1. envelope ids (`type`, `session_id`, `request_id`) present
//! 2. serialized payload within the size limit
//! 3. string sanitization over the whole payload
//! 4. structural check against the registered schema
//!
//! It never panics on malformed input; every failure is a [`ValidationError`].

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::constants::MAX_PAYLOAD_BYTES;
use crate::envelope::Envelope;
use crate::errors::{self, FieldError, ValidationError};
use crate::message_type::{Direction, MessageType};
use crate::sanitize::sanitize_value;
use crate::schema::SchemaDescription;
use crate::signing::signing_input;

/// A message that passed validation.
#[derive(Clone, Debug, PartialEq)]
pub struct ValidatedEnvelope {
    /// The envelope with its payload sanitized.
    pub envelope: Envelope,
    /// Serialized payload size as received.
    pub payload_bytes: usize,
    /// How many payload strings the sanitizer rewrote.
    pub sanitized_strings: usize,
    /// Canonical signing input computed over the payload as received.
    pub signing_input: String,
}

impl ValidatedEnvelope {
    /// Message type.
    pub fn message_type(&self) -> MessageType {
        self.envelope.message_type
    }
}

/// Static table of message contracts plus the validation pipeline.
#[derive(Clone, Debug)]
pub struct SchemaRegistry {
    max_payload_bytes: usize,
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaRegistry {
    /// Registry with the standard 1 MiB payload ceiling.
    pub fn new() -> Self {
        Self {
            max_payload_bytes: MAX_PAYLOAD_BYTES,
        }
    }

    /// Override the payload ceiling.
    #[must_use]
    pub fn with_max_payload_bytes(mut self, max: usize) -> Self {
        self.max_payload_bytes = max;
        self
    }

    /// Current payload ceiling.
    pub fn max_payload_bytes(&self) -> usize {
        self.max_payload_bytes
    }

    /// Parse and validate a text frame.
    pub fn validate_text(&self, text: &str) -> Result<ValidatedEnvelope, ValidationError> {
        let raw: Value = serde_json::from_str(text)
            .map_err(|e| ValidationError::new(errors::INVALID_JSON, format!("invalid JSON: {e}")))?;
        self.validate(raw)
    }

    /// Validate an already-parsed frame.
    pub fn validate(&self, raw: Value) -> Result<ValidatedEnvelope, ValidationError> {
        let Value::Object(mut obj) = raw else {
            return Err(ValidationError::new(
                errors::INVALID_ENVELOPE,
                "message must be a JSON object",
            ));
        };

        // (a) ids
        let missing: Vec<FieldError> = ["type", "session_id", "request_id"]
            .into_iter()
            .filter(|k| !obj.get(*k).and_then(Value::as_str).is_some_and(|s| !s.is_empty()))
            .map(|k| FieldError::new(k, "is required"))
            .collect();
        if !missing.is_empty() {
            let names: Vec<&str> = missing.iter().map(|f| f.field.as_str()).collect();
            return Err(ValidationError::with_fields(
                errors::MISSING_REQUIRED_FIELD,
                format!("missing required field(s): {}", names.join(", ")),
                missing,
            ));
        }
        let type_name = take_string(&mut obj, "type");
        let session_id = take_string(&mut obj, "session_id");
        let request_id = take_string(&mut obj, "request_id");

        // (b) size
        let mut payload = match obj.remove("payload") {
            None | Some(Value::Null) => Value::Object(Map::new()),
            Some(v) => v,
        };
        let payload_bytes = serde_json::to_vec(&payload).map_or(usize::MAX, |v| v.len());
        if payload_bytes > self.max_payload_bytes {
            return Err(ValidationError::new(
                errors::PAYLOAD_TOO_LARGE,
                format!(
                    "payload is {payload_bytes} bytes, limit is {}",
                    self.max_payload_bytes
                ),
            ));
        }

        let raw_timestamp = match obj.remove("timestamp") {
            Some(Value::String(s)) => s,
            Some(Value::Number(n)) => n.to_string(),
            _ => String::new(),
        };
        let signing_input = signing_input(&type_name, &request_id, &raw_timestamp, &payload);

        // (c) sanitize
        let sanitized_strings = sanitize_value(&mut payload);

        // (d) structure
        let message_type = MessageType::parse(&type_name).ok_or_else(|| {
            ValidationError::new(
                errors::UNKNOWN_MESSAGE_TYPE,
                format!("unknown message type: {type_name}"),
            )
        })?;
        if message_type.direction() != Direction::ClientToServer {
            return Err(ValidationError::new(
                errors::UNSUPPORTED_DIRECTION,
                format!("{message_type} is a server-to-client message"),
            ));
        }
        let field_errors = message_type.schema().check_payload(&payload);
        if !field_errors.is_empty() {
            return Err(ValidationError::with_fields(
                errors::SCHEMA_VALIDATION_FAILED,
                format!("{message_type} payload does not match its schema"),
                field_errors,
            ));
        }

        let envelope = Envelope {
            message_type,
            session_id,
            request_id,
            payload,
            timestamp: if raw_timestamp.is_empty() {
                conduit_core::clock::now_rfc3339()
            } else {
                raw_timestamp
            },
            correlation_id: take_optional(&mut obj, "correlation_id")?,
            security_level: take_optional(&mut obj, "security_level")?,
            permissions: take_optional(&mut obj, "permissions")?,
            metadata: take_optional(&mut obj, "metadata")?,
            signature: take_optional(&mut obj, "signature")?,
        };

        Ok(ValidatedEnvelope {
            envelope,
            payload_bytes,
            sanitized_strings,
            signing_input,
        })
    }

    /// Validate the data of a published event whose type is a lifecycle
    /// message type. Other event types are free-form.
    pub fn validate_event_payload(&self, event_type: &str, data: &Value) -> Result<(), ValidationError> {
        let Some(message_type) = MessageType::parse(event_type).filter(|t| t.is_lifecycle()) else {
            return Ok(());
        };
        let field_errors = message_type.schema().check_payload(data);
        if field_errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::with_fields(
                errors::SCHEMA_VALIDATION_FAILED,
                format!("{message_type} event data does not match its schema"),
                field_errors,
            ))
        }
    }

    /// Contract of a wire type, if it exists.
    pub fn describe(&self, type_name: &str) -> Option<SchemaDescription> {
        MessageType::parse(type_name).map(MessageType::describe)
    }
}

fn take_string(obj: &mut Map<String, Value>, key: &str) -> String {
    match obj.remove(key) {
        Some(Value::String(s)) => s,
        _ => String::new(),
    }
}

fn take_optional<T: DeserializeOwned>(obj: &mut Map<String, Value>, key: &str) -> Result<Option<T>, ValidationError> {
    match obj.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => serde_json::from_value(v).map(Some).map_err(|e| {
            ValidationError::with_fields(
                errors::INVALID_ENVELOPE,
                format!("invalid envelope field {key}"),
                vec![FieldError::new(key, e.to_string())],
            )
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::SecurityLevel;
    use serde_json::json;

    fn frame(kind: &str, payload: Value) -> Value {
        json!({
            "type": kind,
            "session_id": "s1",
            "request_id": "r1",
            "payload": payload,
            "timestamp": "2025-01-01T00:00:00.000Z"
        })
    }

    #[test]
    fn valid_subscribe_passes() {
        let v = SchemaRegistry::new()
            .validate(frame("SUBSCRIBE", json!({"eventTypes": ["agent.done"]})))
            .unwrap();
        assert_eq!(v.message_type(), MessageType::Subscribe);
        assert_eq!(v.envelope.session_id, "s1");
        assert_eq!(v.sanitized_strings, 0);
        assert!(v.signing_input.starts_with("SUBSCRIBE|r1|2025-01-01T00:00:00.000Z|"));
    }

    #[test]
    fn invalid_json() {
        let err = SchemaRegistry::new().validate_text("{nope").unwrap_err();
        assert_eq!(err.code, errors::INVALID_JSON);
    }

    #[test]
    fn non_object_is_invalid_envelope() {
        let err = SchemaRegistry::new().validate(json!([1])).unwrap_err();
        assert_eq!(err.code, errors::INVALID_ENVELOPE);
    }

    #[test]
    fn missing_ids_are_reported_together() {
        let err = SchemaRegistry::new()
            .validate(json!({"type": "PING", "payload": {}}))
            .unwrap_err();
        assert_eq!(err.code, errors::MISSING_REQUIRED_FIELD);
        let fields: Vec<_> = err.field_errors.iter().map(|f| f.field.as_str()).collect();
        assert_eq!(fields, vec!["session_id", "request_id"]);
    }

    #[test]
    fn empty_id_counts_as_missing() {
        let mut raw = frame("PING", json!({}));
        raw["request_id"] = json!("");
        let err = SchemaRegistry::new().validate(raw).unwrap_err();
        assert_eq!(err.code, errors::MISSING_REQUIRED_FIELD);
    }

    #[test]
    fn oversized_payload_fails_before_structure() {
        let big = "x".repeat(MAX_PAYLOAD_BYTES + 1);
        // Unknown type and bad shape: size still wins.
        let err = SchemaRegistry::new()
            .validate(frame("NOT_A_TYPE", json!({"blob": big})))
            .unwrap_err();
        assert_eq!(err.code, errors::PAYLOAD_TOO_LARGE);
    }

    #[test]
    fn custom_limit_applies() {
        let registry = SchemaRegistry::new().with_max_payload_bytes(16);
        let err = registry
            .validate(frame("KB_SEARCH", json!({"knowledgeBaseId": "kb", "query": "a long query"})))
            .unwrap_err();
        assert_eq!(err.code, errors::PAYLOAD_TOO_LARGE);
    }

    #[test]
    fn payload_is_sanitized_but_signing_input_is_not() {
        let v = SchemaRegistry::new()
            .validate(frame(
                "KB_SEARCH",
                json!({"knowledgeBaseId": "kb", "query": "<script>steal()</script>rust"}),
            ))
            .unwrap();
        assert_eq!(v.envelope.payload["query"], "rust");
        assert_eq!(v.sanitized_strings, 1);
        assert!(v.signing_input.contains("<script>"));
    }

    #[test]
    fn unknown_type() {
        let err = SchemaRegistry::new().validate(frame("WAT", json!({}))).unwrap_err();
        assert_eq!(err.code, errors::UNKNOWN_MESSAGE_TYPE);
    }

    #[test]
    fn server_type_from_client() {
        let err = SchemaRegistry::new().validate(frame("PONG", json!({}))).unwrap_err();
        assert_eq!(err.code, errors::UNSUPPORTED_DIRECTION);
    }

    #[test]
    fn structural_failure_lists_fields() {
        let err = SchemaRegistry::new()
            .validate(frame("AGENT_EXECUTE", json!({"agentId": 5})))
            .unwrap_err();
        assert_eq!(err.code, errors::SCHEMA_VALIDATION_FAILED);
        assert_eq!(err.field_errors.len(), 2);
    }

    #[test]
    fn absent_payload_defaults_to_empty_object() {
        let v = SchemaRegistry::new()
            .validate(json!({"type": "PING", "session_id": "s", "request_id": "r"}))
            .unwrap();
        assert_eq!(v.envelope.payload, json!({}));
        assert!(!v.envelope.timestamp.is_empty());
    }

    #[test]
    fn optional_envelope_fields_are_typed() {
        let mut raw = frame("PING", json!({}));
        raw["security_level"] = json!("RESTRICTED");
        raw["correlation_id"] = json!("c-1");
        let v = SchemaRegistry::new().validate(raw).unwrap();
        assert_eq!(v.envelope.security_level, Some(SecurityLevel::Restricted));
        assert_eq!(v.envelope.correlation_id.as_deref(), Some("c-1"));

        let mut bad = frame("PING", json!({}));
        bad["security_level"] = json!("TOP_SECRET");
        let err = SchemaRegistry::new().validate(bad).unwrap_err();
        assert_eq!(err.code, errors::INVALID_ENVELOPE);
    }

    #[test]
    fn numeric_timestamp_is_kept_textually() {
        let mut raw = frame("PING", json!({}));
        raw["timestamp"] = json!(1_700_000_000_000_i64);
        let v = SchemaRegistry::new().validate(raw).unwrap();
        assert_eq!(v.envelope.timestamp, "1700000000000");
    }

    #[test]
    fn lifecycle_event_payloads_are_checked() {
        let registry = SchemaRegistry::new();
        assert!(registry
            .validate_event_payload("AGENT_EXECUTION_COMPLETE", &json!({"streamId": "s"}))
            .is_ok());
        let err = registry
            .validate_event_payload("AGENT_EXECUTION_ERROR", &json!({"streamId": "s"}))
            .unwrap_err();
        assert_eq!(err.code, errors::SCHEMA_VALIDATION_FAILED);
        assert!(registry.validate_event_payload("custom.thing", &json!(42)).is_ok());
        // Non-lifecycle catalogue types are free-form as event types.
        assert!(registry.validate_event_payload("PING", &json!(42)).is_ok());
    }

    #[test]
    fn describe_known_and_unknown() {
        let registry = SchemaRegistry::new();
        assert!(registry.describe("SUBSCRIBE").is_some());
        assert!(registry.describe("nope").is_none());
    }
}
