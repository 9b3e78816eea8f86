//! Protocol-wide constants.

/// Version advertised in `CONNECTION_ACK`.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Hard ceiling on a serialized payload, applied before any role limit.
pub const MAX_PAYLOAD_BYTES: usize = 1_048_576;

/// Feature flags advertised in `CONNECTION_ACK`.
pub const FEATURES: &[&str] = &[
    "subscriptions",
    "targeting",
    "replay",
    "streaming",
    "agent-execution",
    "tool-execution",
    "knowledge-base-search",
    "human-in-the-loop",
    "metrics",
    "schema-introspection",
];

/// `sourceModule` tag for publications re-emitted from the event log.
pub const SOURCE_REPLAY: &str = "replay";

/// `sourceModule` tag for publications originating at the gateway.
pub const SOURCE_GATEWAY: &str = "gateway";

/// `targetModule` for work handed to the execution engine.
pub const TARGET_EXECUTION_ENGINE: &str = "execution-engine";

/// Event type used for alert fan-out.
pub const SYSTEM_ALERT_EVENT: &str = "system.alert";

/// Event-type prefixes that require the ADMIN capability to subscribe.
pub const PRIVILEGED_EVENT_PREFIXES: &[&str] = &["system.", "billing."];
