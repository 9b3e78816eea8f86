//! Per-minute rate limiting on the shared store.
//!
//! Counters are fixed one-minute windows keyed by organization, window start
//! and scope: the connection id for inbound messages, the role for
//! executions and stream starts. Counters live in the shared store so every
//! instance draws from the same budget.

use std::sync::Arc;
use std::time::Duration;

use conduit_core::clock;
use conduit_protocol::RateKind;
use conduit_store::{SharedStore, keys};
use metrics::counter;
use tracing::warn;

use crate::metrics::RATE_LIMIT_REJECTIONS_TOTAL;
use crate::websocket::connection::ClientConnection;

/// Counters outlive their window so a late increment never revives a
/// finished one.
const COUNTER_TTL: Duration = Duration::from_secs(120);

/// Outcome of a rate check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateDecision {
    /// Within budget.
    Allowed {
        /// Budget left in the current window.
        remaining: u64,
    },
    /// Budget exhausted.
    Limited {
        /// Time until the window rolls over.
        retry_after_ms: i64,
    },
}

impl RateDecision {
    /// Whether the request may proceed.
    pub fn is_allowed(self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

/// Shared-store backed rate limiter.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn SharedStore>,
}

impl RateLimiter {
    /// Limiter over `store`.
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self { store }
    }

    /// Count one request of `kind` now.
    pub async fn check(&self, connection: &ClientConnection, kind: RateKind) -> RateDecision {
        self.check_at(clock::now_ms(), connection, kind).await
    }

    /// Count one request of `kind` at `now_ms`.
    ///
    /// A store failure fails open.
    pub async fn check_at(&self, now_ms: i64, connection: &ClientConnection, kind: RateKind) -> RateDecision {
        let budget = connection.role.policy().budget(kind);
        let scope = match kind {
            RateKind::Messages => connection.id.as_str(),
            RateKind::Executions | RateKind::Streams => connection.role.as_str(),
        };
        let key = keys::rate(
            &connection.organization_id,
            clock::minute_bucket(now_ms),
            kind.as_str(),
            scope,
        );

        let count = match self.store.incr(&key, COUNTER_TTL).await {
            Ok(n) => u64::try_from(n).unwrap_or(0),
            Err(e) => {
                warn!(
                    conn_id = %connection.id,
                    kind = kind.as_str(),
                    error = %e,
                    "rate counter unavailable, allowing request"
                );
                return RateDecision::Allowed { remaining: budget };
            }
        };

        if count > budget {
            counter!(
                RATE_LIMIT_REJECTIONS_TOTAL,
                "kind" => kind.as_str(),
                "role" => connection.role.as_str()
            )
            .increment(1);
            RateDecision::Limited {
                retry_after_ms: clock::ms_until_next_minute(now_ms),
            }
        } else {
            RateDecision::Allowed {
                remaining: budget - count,
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
