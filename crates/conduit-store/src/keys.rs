//! Shared-store keyspace.
//!
//! Every key the gateway writes is built here so instances agree on names.

/// Prefix of every per-event-type fan-out channel.
pub const EVENT_CHANNEL_PREFIX: &str = "events:";

/// Connection record (TTL'd).
pub fn connection(connection_id: &str) -> String {
    format!("conn:{connection_id}")
}

/// Subscriber set for `(event_type, organization)`.
pub fn subscribers(event_type: &str, organization_id: &str) -> String {
    format!("subs:{event_type}:{organization_id}")
}

/// Open trace record (short TTL).
pub fn trace(trace_id: &str) -> String {
    format!("trace:{trace_id}")
}

/// Per-organization latency sample list.
pub fn latency_samples(organization_id: &str) -> String {
    format!("latency:{organization_id}")
}

/// Rate counter for one `(organization, minute, kind, role-or-connection)`.
pub fn rate(organization_id: &str, minute_start_ms: i64, kind: &str, scope: &str) -> String {
    format!("rate:{organization_id}:{minute_start_ms}:{kind}:{scope}")
}

/// Fan-out channel for one event type.
pub fn event_channel(event_type: &str) -> String {
    format!("{EVENT_CHANNEL_PREFIX}{event_type}")
}

/// Health probe key.
pub const HEALTH_PROBE: &str = "health:probe";
