//! WebSocket client connection state.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use conduit_core::{ConnectionId, clock};
use conduit_protocol::{Envelope, Role};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::auth::AuthContext;

/// One authenticated client connection.
///
/// The socket itself is owned by the session task; this struct holds the
/// send side of its outbound queue plus the identity and liveness state the
/// registry needs.
pub struct ClientConnection {
    /// Unique connection id.
    pub id: ConnectionId,
    /// Authenticated user.
    pub user_id: String,
    /// User's organization.
    pub organization_id: String,
    /// User's role.
    pub role: Role,
    /// Monotonic admission time.
    pub connected_at: Instant,
    /// Wall-clock admission time, Unix milliseconds.
    pub connected_at_ms: i64,
    tx: mpsc::Sender<Arc<String>>,
    is_alive: AtomicBool,
    last_heartbeat: Mutex<Instant>,
    last_heartbeat_ms: AtomicI64,
    record_refreshed: Mutex<Instant>,
    subscriptions: Mutex<BTreeSet<String>>,
    dropped_messages: AtomicU64,
    closed: CancellationToken,
}

impl ClientConnection {
    /// Create a connection for an authenticated caller.
    pub fn new(id: ConnectionId, auth: &AuthContext, tx: mpsc::Sender<Arc<String>>) -> Self {
        let now_ms = clock::now_ms();
        Self {
            id,
            user_id: auth.user_id.clone(),
            organization_id: auth.organization_id.clone(),
            role: auth.role,
            connected_at: Instant::now(),
            connected_at_ms: now_ms,
            tx,
            is_alive: AtomicBool::new(true),
            last_heartbeat: Mutex::new(Instant::now()),
            last_heartbeat_ms: AtomicI64::new(now_ms),
            record_refreshed: Mutex::new(Instant::now()),
            subscriptions: Mutex::new(BTreeSet::new()),
            dropped_messages: AtomicU64::new(0),
            closed: CancellationToken::new(),
        }
    }

    /// Send a text frame to the client.
    ///
    /// Returns `false` if the queue is full or closed, and increments the
    /// dropped message counter.
    pub fn send(&self, message: Arc<String>) -> bool {
        if self.tx.try_send(message).is_ok() {
            true
        } else {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Serialize an envelope and send it.
    pub fn send_envelope(&self, envelope: &Envelope) -> bool {
        match envelope.to_text() {
            Ok(text) => self.send(Arc::new(text)),
            Err(_) => false,
        }
    }

    /// Total frames dropped for this connection.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Record client activity (pong, ping or any frame).
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_heartbeat.lock() = Instant::now();
        self.last_heartbeat_ms.store(clock::now_ms(), Ordering::Relaxed);
    }

    /// Claim a shared-record refresh if the last one is at least `every` old.
    pub fn claim_record_refresh(&self, every: Duration) -> bool {
        let mut last = self.record_refreshed.lock();
        if last.elapsed() < every {
            return false;
        }
        *last = Instant::now();
        true
    }

    /// Check and reset the alive flag.
    ///
    /// Returns `true` if the client showed activity since the last check.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Time since the last recorded activity.
    pub fn idle_for(&self) -> Duration {
        self.last_heartbeat.lock().elapsed()
    }

    /// Wall-clock time of the last recorded activity, Unix milliseconds.
    pub fn last_heartbeat_ms(&self) -> i64 {
        self.last_heartbeat_ms.load(Ordering::Relaxed)
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Add an event type to the local subscription set.
    pub fn add_subscription(&self, event_type: &str) {
        let _ = self.subscriptions.lock().insert(event_type.to_owned());
    }

    /// Remove an event type from the local subscription set.
    pub fn remove_subscription(&self, event_type: &str) -> bool {
        self.subscriptions.lock().remove(event_type)
    }

    /// Clear the local subscription set.
    pub fn clear_subscriptions(&self) {
        self.subscriptions.lock().clear();
    }

    /// Subscribed event types, sorted.
    pub fn subscribed_event_types(&self) -> Vec<String> {
        self.subscriptions.lock().iter().cloned().collect()
    }

    /// Ask the session task to close the socket.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once [`close`](Self::close) is called.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("organization_id", &self.organization_id)
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}
