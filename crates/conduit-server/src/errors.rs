//! Gateway operation errors and their client-facing codes.

use conduit_protocol::errors as codes;
use conduit_protocol::{ErrorPayload, ValidationError};
use conduit_store::StoreError;

/// Why a subscribe request was refused.
#[derive(Debug, thiserror::Error)]
pub enum SubscribeError {
    /// The connection is not (or no longer) registered.
    #[error("unknown connection: {0}")]
    UnknownConnection(String),
    /// The role lacks the capability the event type needs.
    #[error("{0}")]
    InsufficientPermissions(String),
    /// The subscription would read another tenant's events.
    #[error("{0}")]
    TenantAccessDenied(String),
    /// USER/FLOW/ROOM targeting without a usable target id.
    #[error("{0}")]
    InvalidTarget(String),
}

impl SubscribeError {
    /// Wire error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownConnection(_) => codes::INTERNAL_ERROR,
            Self::InsufficientPermissions(_) => codes::INSUFFICIENT_PERMISSIONS,
            Self::TenantAccessDenied(_) => codes::TENANT_ACCESS_DENIED,
            Self::InvalidTarget(_) => codes::SCHEMA_VALIDATION_FAILED,
        }
    }
}

/// Why a publication was refused.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// A lifecycle event's data does not match its schema.
    #[error("{}", .0.message)]
    Validation(ValidationError),
    /// The publication could not be encoded.
    #[error("encode publication: {0}")]
    Encode(#[from] serde_json::Error),
}

impl PublishError {
    /// Wire error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(e) => e.code,
            Self::Encode(_) => codes::INTERNAL_ERROR,
        }
    }
}

/// Why a replay stopped.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    /// The gateway runs without an audit store.
    #[error("event log is not configured")]
    Unavailable,
    /// Reading the log failed.
    #[error("event log query failed: {0}")]
    Store(#[from] StoreError),
    /// Re-publishing an entry failed; earlier entries stay delivered.
    #[error("replay aborted after {replayed} event(s): {source}")]
    Aborted {
        /// Events delivered before the failure.
        replayed: usize,
        /// The failure.
        source: PublishError,
    },
}

/// Streaming session control failures.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StreamError {
    /// No live session with that id.
    #[error("stream not found: {0}")]
    NotFound(String),
    /// The requester does not own the session.
    #[error("stream {0} belongs to another user")]
    NotOwner(String),
    /// The session belongs to another organization.
    #[error("stream {0} belongs to another organization")]
    TenantAccessDenied(String),
    /// The session cannot move to the requested state.
    #[error("cannot {action} a {state} stream")]
    InvalidTransition {
        /// Requested action.
        action: &'static str,
        /// Current state.
        state: &'static str,
    },
}

impl StreamError {
    /// Wire error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) | Self::InvalidTransition { .. } => codes::STREAM_NOT_FOUND,
            Self::NotOwner(_) => codes::SESSION_OWNERSHIP_DENIED,
            Self::TenantAccessDenied(_) => codes::TENANT_ACCESS_DENIED,
        }
    }
}

/// Connection admission failures.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    /// The instance is at its connection limit.
    #[error("connection limit of {0} reached")]
    AtCapacity(usize),
}

impl From<&SubscribeError> for ErrorPayload {
    fn from(err: &SubscribeError) -> Self {
        Self::new(err.code(), err.to_string())
    }
}

impl From<&PublishError> for ErrorPayload {
    fn from(err: &PublishError) -> Self {
        match err {
            PublishError::Validation(v) => Self::from(v),
            PublishError::Encode(_) => Self::new(err.code(), err.to_string()),
        }
    }
}

impl From<&ReplayError> for ErrorPayload {
    fn from(err: &ReplayError) -> Self {
        Self::new(codes::REPLAY_FAILED, err.to_string())
    }
}

impl From<&StreamError> for ErrorPayload {
    fn from(err: &StreamError) -> Self {
        Self::new(err.code(), err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_protocol::ErrorCategory;

    #[test]
    fn subscribe_codes() {
        let e = SubscribeError::InsufficientPermissions("no".into());
        assert_eq!(e.code(), codes::INSUFFICIENT_PERMISSIONS);
        let payload = ErrorPayload::from(&e);
        assert_eq!(payload.category, ErrorCategory::Authorization);
        assert_eq!(
            SubscribeError::TenantAccessDenied("x".into()).code(),
            codes::TENANT_ACCESS_DENIED
        );
    }

    #[test]
    fn replay_errors_surface_as_replay_failed() {
        let payload = ErrorPayload::from(&ReplayError::Unavailable);
        assert_eq!(payload.code, codes::REPLAY_FAILED);
        assert_eq!(payload.message, "event log is not configured");
    }

    #[test]
    fn publish_validation_keeps_field_errors() {
        let v = ValidationError::with_fields(
            codes::SCHEMA_VALIDATION_FAILED,
            "bad",
            vec![conduit_protocol::FieldError::new("streamId", "is required")],
        );
        let payload = ErrorPayload::from(&PublishError::Validation(v));
        assert_eq!(payload.code, codes::SCHEMA_VALIDATION_FAILED);
        assert_eq!(payload.field_errors.len(), 1);
    }

    #[test]
    fn stream_ownership_is_authorization() {
        let payload = ErrorPayload::from(&StreamError::NotOwner("s1".into()));
        assert_eq!(payload.code, codes::SESSION_OWNERSHIP_DENIED);
        assert_eq!(payload.category, ErrorCategory::Authorization);
        let payload = ErrorPayload::from(&StreamError::TenantAccessDenied("s1".into()));
        assert_eq!(payload.code, codes::TENANT_ACCESS_DENIED);
        assert_eq!(payload.category, ErrorCategory::Authorization);
    }
}
