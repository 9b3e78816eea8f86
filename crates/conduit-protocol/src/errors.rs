//! Client-facing error codes and the `ERROR` payload.
//!
//! Codes are grouped by [`ErrorCategory`] so a client can tell a request it
//! must fix (validation) from one it must back off on (authorization).

use serde::{Deserialize, Serialize};

// ── Validation ──────────────────────────────────────────────────────

/// Frame is not valid JSON.
pub const INVALID_JSON: &str = "INVALID_JSON";
/// Frame is JSON but not an envelope object.
pub const INVALID_ENVELOPE: &str = "INVALID_ENVELOPE";
/// `type`, `session_id` or `request_id` (or a required payload field) is missing.
pub const MISSING_REQUIRED_FIELD: &str = "MISSING_REQUIRED_FIELD";
/// Serialized payload exceeds the global or role limit.
pub const PAYLOAD_TOO_LARGE: &str = "PAYLOAD_TOO_LARGE";
/// `type` is not in the catalogue.
pub const UNKNOWN_MESSAGE_TYPE: &str = "UNKNOWN_MESSAGE_TYPE";
/// A server-to-client type was sent by a client.
pub const UNSUPPORTED_DIRECTION: &str = "UNSUPPORTED_DIRECTION";
/// Payload does not match the registered schema.
pub const SCHEMA_VALIDATION_FAILED: &str = "SCHEMA_VALIDATION_FAILED";

// ── Authorization ───────────────────────────────────────────────────

/// Role lacks the capability the message type requires.
pub const INSUFFICIENT_PERMISSIONS: &str = "INSUFFICIENT_PERMISSIONS";
/// Role security level is below the message type's requirement.
pub const INSUFFICIENT_SECURITY_LEVEL: &str = "INSUFFICIENT_SECURITY_LEVEL";
/// Request targets another organization.
pub const TENANT_ACCESS_DENIED: &str = "TENANT_ACCESS_DENIED";
/// Request touches a stream owned by another user.
pub const SESSION_OWNERSHIP_DENIED: &str = "SESSION_OWNERSHIP_DENIED";
/// Per-minute budget exhausted.
pub const RATE_LIMIT_EXCEEDED: &str = "RATE_LIMIT_EXCEEDED";
/// Envelope signature missing or wrong.
pub const INVALID_SIGNATURE: &str = "INVALID_SIGNATURE";

// ── Internal / state ────────────────────────────────────────────────

/// Unexpected server-side failure.
pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
/// Replay aborted part way.
pub const REPLAY_FAILED: &str = "REPLAY_FAILED";
/// Stream id is unknown or already finished.
pub const STREAM_NOT_FOUND: &str = "STREAM_NOT_FOUND";

/// Which class of failure a code belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    /// Fix the request and retry.
    Validation,
    /// Not allowed, or back off and retry later.
    Authorization,
    /// Server-side failure.
    Internal,
}

impl ErrorCategory {
    /// Category of a known error code. Unknown codes are internal.
    pub fn of(code: &str) -> Self {
        match code {
            INVALID_JSON
            | INVALID_ENVELOPE
            | MISSING_REQUIRED_FIELD
            | PAYLOAD_TOO_LARGE
            | UNKNOWN_MESSAGE_TYPE
            | UNSUPPORTED_DIRECTION
            | SCHEMA_VALIDATION_FAILED => Self::Validation,
            INSUFFICIENT_PERMISSIONS
            | INSUFFICIENT_SECURITY_LEVEL
            | TENANT_ACCESS_DENIED
            | SESSION_OWNERSHIP_DENIED
            | RATE_LIMIT_EXCEEDED
            | INVALID_SIGNATURE => Self::Authorization,
            _ => Self::Internal,
        }
    }
}

/// One field-level problem found during structural validation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    /// Dotted path of the field (e.g. `payload.eventTypes`).
    pub field: String,
    /// What is wrong with it.
    pub message: String,
}

impl FieldError {
    /// Build a field error.
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Rejection produced by the schema registry.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ValidationError {
    /// One of the validation codes above.
    pub code: &'static str,
    /// Human-readable summary.
    pub message: String,
    /// Per-field detail, empty unless the failure was structural.
    pub field_errors: Vec<FieldError>,
}

impl ValidationError {
    /// Build an error without field detail.
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            field_errors: Vec::new(),
        }
    }

    /// Build a structural failure from collected field errors.
    pub fn with_fields(code: &'static str, message: impl Into<String>, fields: Vec<FieldError>) -> Self {
        Self {
            code,
            message: message.into(),
            field_errors: fields,
        }
    }
}

/// Payload of a server `ERROR` message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    /// Machine-readable code.
    pub code: String,
    /// Code class.
    pub category: ErrorCategory,
    /// Human-readable message.
    pub message: String,
    /// Per-field detail.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub field_errors: Vec<FieldError>,
    /// How long to wait before retrying, for rate-limit rejections.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<i64>,
}

impl ErrorPayload {
    /// Build a payload, deriving the category from the code.
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_owned(),
            category: ErrorCategory::of(code),
            message: message.into(),
            field_errors: Vec::new(),
            retry_after_ms: None,
        }
    }

    /// Attach a retry hint.
    #[must_use]
    pub fn with_retry_after(mut self, retry_after_ms: i64) -> Self {
        self.retry_after_ms = Some(retry_after_ms);
        self
    }
}

impl From<&ValidationError> for ErrorPayload {
    fn from(err: &ValidationError) -> Self {
        Self {
            code: err.code.to_owned(),
            category: ErrorCategory::of(err.code),
            message: err.message.clone(),
            field_errors: err.field_errors.clone(),
            retry_after_ms: None,
        }
    }
}
