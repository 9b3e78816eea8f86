//! Role tiers, capabilities, security classification and rate budgets.
//!
//! All tables are static. Lookups are pure functions so they can be called
//! from the hot path without locking.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::message_type::MessageType;

/// Role tier carried in the handshake token.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    /// Read-only access.
    Viewer,
    /// Read, write and execute within the organization.
    Developer,
    /// Organization administrator.
    Admin,
    /// Platform operator, may cross tenant boundaries.
    SuperAdmin,
}

impl Role {
    /// Wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Viewer => "VIEWER",
            Self::Developer => "DEVELOPER",
            Self::Admin => "ADMIN",
            Self::SuperAdmin => "SUPER_ADMIN",
        }
    }

    /// Parse a wire name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "VIEWER" => Some(Self::Viewer),
            "DEVELOPER" => Some(Self::Developer),
            "ADMIN" => Some(Self::Admin),
            "SUPER_ADMIN" => Some(Self::SuperAdmin),
            _ => None,
        }
    }

    /// Administrative tiers (`ADMIN`, `SUPER_ADMIN`).
    #[must_use]
    pub fn is_admin(self) -> bool {
        matches!(self, Self::Admin | Self::SuperAdmin)
    }

    /// The top tier.
    #[must_use]
    pub fn is_super_admin(self) -> bool {
        self == Self::SuperAdmin
    }

    /// This role's policy row.
    #[must_use]
    pub fn policy(self) -> &'static RolePolicy {
        match self {
            Self::SuperAdmin => &SUPER_ADMIN_POLICY,
            Self::Admin => &ADMIN_POLICY,
            Self::Developer => &DEVELOPER_POLICY,
            Self::Viewer => &VIEWER_POLICY,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Permission a message type may require.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Capability {
    /// Observe.
    Read,
    /// Mutate or publish.
    Write,
    /// Administrative operations and privileged topics.
    Admin,
    /// Start executions.
    Execute,
}

/// Data classification, ordered from least to most sensitive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SecurityLevel {
    /// No restriction.
    Public,
    /// Any authenticated member.
    Internal,
    /// Organization administrators.
    Confidential,
    /// Platform operators.
    Restricted,
}

/// Which per-minute budget a request draws from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RateKind {
    /// Every inbound message, counted per connection.
    Messages,
    /// Agent and tool executions, counted per role.
    Executions,
    /// Stream starts, counted per role.
    Streams,
}

impl RateKind {
    /// Key segment used in the shared-store counter key.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Messages => "messages",
            Self::Executions => "executions",
            Self::Streams => "streams",
        }
    }
}

/// Static per-role limits.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RolePolicy {
    /// Inbound messages per minute per connection.
    pub messages_per_window: u64,
    /// Executions per minute per (organization, role).
    pub executions_per_window: u64,
    /// Stream starts per minute per (organization, role).
    pub streams_per_window: u64,
    /// Granted capabilities.
    pub capabilities: &'static [Capability],
    /// Highest classification this role may touch.
    pub security_level: SecurityLevel,
    /// Largest serialized payload this role may send.
    pub max_payload_bytes: usize,
    /// Maximum connection lifetime.
    pub session_timeout: Duration,
}

impl RolePolicy {
    /// Whether `cap` is granted.
    #[must_use]
    pub fn has(&self, cap: Capability) -> bool {
        self.capabilities.contains(&cap)
    }

    /// Budget for one rate kind.
    #[must_use]
    pub fn budget(&self, kind: RateKind) -> u64 {
        match kind {
            RateKind::Messages => self.messages_per_window,
            RateKind::Executions => self.executions_per_window,
            RateKind::Streams => self.streams_per_window,
        }
    }
}

const HOUR: u64 = 3_600;
const KIB: usize = 1_024;

static SUPER_ADMIN_POLICY: RolePolicy = RolePolicy {
    messages_per_window: 1_000,
    executions_per_window: 300,
    streams_per_window: 100,
    capabilities: &[
        Capability::Read,
        Capability::Write,
        Capability::Admin,
        Capability::Execute,
    ],
    security_level: SecurityLevel::Restricted,
    max_payload_bytes: 1_024 * KIB,
    session_timeout: Duration::from_secs(24 * HOUR),
};

static ADMIN_POLICY: RolePolicy = RolePolicy {
    messages_per_window: 500,
    executions_per_window: 120,
    streams_per_window: 50,
    capabilities: &[
        Capability::Read,
        Capability::Write,
        Capability::Admin,
        Capability::Execute,
    ],
    security_level: SecurityLevel::Confidential,
    max_payload_bytes: 1_024 * KIB,
    session_timeout: Duration::from_secs(12 * HOUR),
};

static DEVELOPER_POLICY: RolePolicy = RolePolicy {
    messages_per_window: 200,
    executions_per_window: 60,
    streams_per_window: 20,
    capabilities: &[Capability::Read, Capability::Write, Capability::Execute],
    security_level: SecurityLevel::Internal,
    max_payload_bytes: 512 * KIB,
    session_timeout: Duration::from_secs(8 * HOUR),
};

static VIEWER_POLICY: RolePolicy = RolePolicy {
    messages_per_window: 50,
    executions_per_window: 0,
    streams_per_window: 5,
    capabilities: &[Capability::Read],
    security_level: SecurityLevel::Internal,
    max_payload_bytes: 64 * KIB,
    session_timeout: Duration::from_secs(4 * HOUR),
};

/// Capability a wire message type requires. Unmapped names default to READ.
pub fn required_capability(message_type: &str) -> Capability {
    MessageType::parse(message_type).map_or(Capability::Read, |t| t.schema().min_permission)
}

/// Whether `role` may send `message_type` at all.
pub fn can_send(role: Role, message_type: &str) -> bool {
    role.policy().has(required_capability(message_type))
}

/// Whether `role`'s classification satisfies `required`.
pub fn meets_security_level(role: Role, required: SecurityLevel) -> bool {
    role.policy().security_level >= required
}

/// Cross-tenant access is reserved for the top tier.
pub fn validate_tenant_access(requester_org: &str, target_org: &str, role: Role) -> bool {
    role.is_super_admin() || requester_org == target_org
}

/// Admin tiers may act on any session in scope; others only on their own.
pub fn validate_session_ownership(session_owner_id: &str, requester_id: &str, role: Role) -> bool {
    role.is_admin() || session_owner_id == requester_id
}

/// Whether subscribing to `event_type` needs the ADMIN capability.
pub fn is_privileged_event_type(event_type: &str) -> bool {
    crate::constants::PRIVILEGED_EVENT_PREFIXES
        .iter()
        .any(|p| event_type.starts_with(p))
}
