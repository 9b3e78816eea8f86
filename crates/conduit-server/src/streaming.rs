//! Streaming sessions for long-running operations.
//!
//! A session is opened when an agent execution, tool execution or knowledge
//! base search starts. Its state is published on a `watch` channel so
//! producers can observe pause/resume/cancel cooperatively; nothing here
//! interrupts an in-flight call. Sessions end on completion, error, cancel
//! or the idle sweep.

use std::sync::Arc;
use std::time::Duration;

use conduit_core::{StreamId, clock};
use conduit_protocol::Role;
use conduit_protocol::policy::{validate_session_ownership, validate_tenant_access};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::errors::StreamError;

/// Lifecycle state of a streaming session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamState {
    /// Producing output.
    Streaming,
    /// Producer asked to hold.
    Paused,
    /// Finished normally.
    Completed,
    /// Finished with an error.
    Error,
    /// Stopped by its owner.
    Cancelled,
}

impl StreamState {
    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Streaming => "STREAMING",
            Self::Paused => "PAUSED",
            Self::Completed => "COMPLETED",
            Self::Error => "ERROR",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// Whether the session has ended.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Cancelled)
    }
}

/// Kind of operation a session streams.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamType {
    /// `AGENT_EXECUTE`.
    AgentExecution,
    /// `TOOL_EXECUTE`.
    ToolExecution,
    /// `KB_SEARCH`.
    KbSearch,
}

impl StreamType {
    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AgentExecution => "agent_execution",
            Self::ToolExecution => "tool_execution",
            Self::KbSearch => "kb_search",
        }
    }
}

/// Who opened a session and for what.
#[derive(Clone, Debug)]
pub struct StreamOwner {
    /// Owning user.
    pub user_id: String,
    /// Owning organization.
    pub organization_id: String,
    /// Connection that started the operation.
    pub connection_id: String,
    /// Client session id from the envelope.
    pub session_id: String,
}

/// Who asks to control a session.
#[derive(Clone, Copy, Debug)]
pub struct Requester<'a> {
    /// Requesting user.
    pub user_id: &'a str,
    /// Requesting user's organization.
    pub organization_id: &'a str,
    /// Requesting user's role.
    pub role: Role,
}

/// One live streaming session.
#[derive(Debug)]
pub struct StreamingSession {
    /// Stream id.
    pub stream_id: StreamId,
    /// Operation kind.
    pub stream_type: StreamType,
    /// Owner.
    pub owner: StreamOwner,
    /// Creation time, Unix milliseconds.
    pub created_at_ms: i64,
    /// Output buffer size hint for producers.
    pub buffer_size: usize,
    /// Whether producers should compress chunks.
    pub compression_enabled: bool,
    /// Whether producers should encrypt chunks.
    pub encryption_enabled: bool,
    state: watch::Sender<StreamState>,
    last_activity: Mutex<Instant>,
}

impl StreamingSession {
    /// Current state.
    pub fn state(&self) -> StreamState {
        *self.state.borrow()
    }

    /// Time since the last state change or producer activity.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn transition(&self, next: StreamState) {
        self.state.send_replace(next);
        self.touch();
    }
}

/// Serializable view of a session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamInfo {
    /// Stream id.
    pub stream_id: String,
    /// Client session id.
    pub session_id: String,
    /// Operation kind.
    pub stream_type: StreamType,
    /// Current state.
    pub state: StreamState,
    /// Creation time, Unix milliseconds.
    pub created_at: i64,
    /// Buffer size hint.
    pub buffer_size: usize,
    /// Compression flag.
    pub compression_enabled: bool,
    /// Encryption flag.
    pub encryption_enabled: bool,
}

impl From<&StreamingSession> for StreamInfo {
    fn from(s: &StreamingSession) -> Self {
        Self {
            stream_id: s.stream_id.to_string(),
            session_id: s.owner.session_id.clone(),
            stream_type: s.stream_type,
            state: s.state(),
            created_at: s.created_at_ms,
            buffer_size: s.buffer_size,
            compression_enabled: s.compression_enabled,
            encryption_enabled: s.encryption_enabled,
        }
    }
}

const DEFAULT_BUFFER_SIZE: usize = 64;

/// Live streaming sessions of one instance.
pub struct StreamRegistry {
    sessions: DashMap<StreamId, Arc<StreamingSession>>,
    idle_timeout: Duration,
}

impl StreamRegistry {
    /// Registry whose sweep ends sessions idle for `idle_timeout`.
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            idle_timeout,
        }
    }

    /// Open a session in the STREAMING state.
    pub fn create(&self, stream_type: StreamType, owner: StreamOwner) -> Arc<StreamingSession> {
        let (state, _) = watch::channel(StreamState::Streaming);
        let session = Arc::new(StreamingSession {
            stream_id: StreamId::new(),
            stream_type,
            owner,
            created_at_ms: clock::now_ms(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            compression_enabled: false,
            encryption_enabled: false,
            state,
            last_activity: Mutex::new(Instant::now()),
        });
        let _ = self.sessions.insert(session.stream_id.clone(), session.clone());
        debug!(
            stream_id = %session.stream_id,
            stream_type = stream_type.as_str(),
            user_id = %session.owner.user_id,
            "stream opened"
        );
        session
    }

    /// Look up a session.
    pub fn get(&self, stream_id: &str) -> Option<Arc<StreamingSession>> {
        self.sessions.get(stream_id).map(|e| e.value().clone())
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session is live.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Watch a session's state.
    pub fn subscribe(&self, stream_id: &str) -> Option<watch::Receiver<StreamState>> {
        self.get(stream_id).map(|s| s.state.subscribe())
    }

    /// Pause a streaming session.
    pub fn pause(&self, stream_id: &str, requester: Requester<'_>) -> Result<StreamState, StreamError> {
        let session = self.owned(stream_id, requester)?;
        match session.state() {
            StreamState::Streaming => {
                session.transition(StreamState::Paused);
                Ok(StreamState::Paused)
            }
            state => Err(invalid("pause", state)),
        }
    }

    /// Resume a paused session.
    pub fn resume(&self, stream_id: &str, requester: Requester<'_>) -> Result<StreamState, StreamError> {
        let session = self.owned(stream_id, requester)?;
        match session.state() {
            StreamState::Paused => {
                session.transition(StreamState::Streaming);
                Ok(StreamState::Streaming)
            }
            state => Err(invalid("resume", state)),
        }
    }

    /// Cancel a session and remove it.
    pub fn cancel(&self, stream_id: &str, requester: Requester<'_>) -> Result<Arc<StreamingSession>, StreamError> {
        let session = self.owned(stream_id, requester)?;
        let state = session.state();
        if state.is_terminal() {
            return Err(invalid("cancel", state));
        }
        self.end(&session, StreamState::Cancelled);
        Ok(session)
    }

    /// Mark a session completed and remove it.
    pub fn finish(&self, stream_id: &str) -> bool {
        self.end_by_id(stream_id, StreamState::Completed)
    }

    /// Mark a session failed and remove it.
    pub fn fail(&self, stream_id: &str) -> bool {
        self.end_by_id(stream_id, StreamState::Error)
    }

    /// Record producer activity on a session.
    pub fn touch(&self, stream_id: &str) -> bool {
        self.get(stream_id).map(|s| s.touch()).is_some()
    }

    /// End every session idle longer than the timeout. Returns their ids.
    pub fn sweep_idle(&self) -> Vec<StreamId> {
        let idle: Vec<Arc<StreamingSession>> = self
            .sessions
            .iter()
            .filter(|e| e.value().idle_for() >= self.idle_timeout)
            .map(|e| e.value().clone())
            .collect();
        idle.iter()
            .map(|session| {
                self.end(session, StreamState::Error);
                info!(stream_id = %session.stream_id, "idle stream expired");
                session.stream_id.clone()
            })
            .collect()
    }

    /// Run [`sweep_idle`](Self::sweep_idle) every `interval` until cancelled.
    pub async fn run_sweep(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        let _ = ticker.tick().await;
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let _ = self.sweep_idle();
                }
            }
        }
    }

    /// Look up a session the requester may control. Admins act on any
    /// session in their own organization; only the top tier crosses tenants.
    fn owned(&self, stream_id: &str, requester: Requester<'_>) -> Result<Arc<StreamingSession>, StreamError> {
        let session = self
            .get(stream_id)
            .ok_or_else(|| StreamError::NotFound(stream_id.to_owned()))?;
        if !validate_tenant_access(requester.organization_id, &session.owner.organization_id, requester.role) {
            return Err(StreamError::TenantAccessDenied(stream_id.to_owned()));
        }
        if !validate_session_ownership(&session.owner.user_id, requester.user_id, requester.role) {
            return Err(StreamError::NotOwner(stream_id.to_owned()));
        }
        Ok(session)
    }

    fn end_by_id(&self, stream_id: &str, state: StreamState) -> bool {
        match self.get(stream_id) {
            Some(session) => {
                self.end(&session, state);
                true
            }
            None => false,
        }
    }

    fn end(&self, session: &StreamingSession, state: StreamState) {
        session.transition(state);
        let _ = self.sessions.remove(&session.stream_id);
        debug!(stream_id = %session.stream_id, state = state.as_str(), "stream closed");
    }
}

fn invalid(action: &'static str, state: StreamState) -> StreamError {
    StreamError::InvalidTransition {
        action,
        state: state.as_str(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(unused_results)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn owner(user: &str) -> StreamOwner {
        StreamOwner {
            user_id: user.into(),
            organization_id: "org-1".into(),
            connection_id: "conn_1".into(),
            session_id: "sess-1".into(),
        }
    }

    fn by(user: &str, role: Role) -> Requester<'_> {
        Requester {
            user_id: user,
            organization_id: "org-1",
            role,
        }
    }

    fn registry() -> StreamRegistry {
        StreamRegistry::new(Duration::from_secs(60))
    }

    #[tokio::test]
    async fn pause_resume_cycle_is_observable() {
        let reg = registry();
        let s = reg.create(StreamType::AgentExecution, owner("u1"));
        let id = s.stream_id.to_string();
        let mut rx = reg.subscribe(&id).unwrap();

        assert_eq!(reg.pause(&id, by("u1", Role::Developer)), Ok(StreamState::Paused));
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), StreamState::Paused);

        assert_eq!(reg.resume(&id, by("u1", Role::Developer)), Ok(StreamState::Streaming));
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), StreamState::Streaming);
    }

    #[test]
    fn invalid_transitions() {
        let reg = registry();
        let id = reg.create(StreamType::ToolExecution, owner("u1")).stream_id.to_string();
        assert_matches!(
            reg.resume(&id, by("u1", Role::Developer)),
            Err(StreamError::InvalidTransition { action: "resume", state: "STREAMING" })
        );
        reg.pause(&id, by("u1", Role::Developer)).unwrap();
        assert_matches!(
            reg.pause(&id, by("u1", Role::Developer)),
            Err(StreamError::InvalidTransition { action: "pause", .. })
        );
    }

    #[test]
    fn ownership_is_enforced() {
        let reg = registry();
        let id = reg.create(StreamType::KbSearch, owner("u1")).stream_id.to_string();
        assert_eq!(
            reg.pause(&id, by("u2", Role::Developer)),
            Err(StreamError::NotOwner(id.clone()))
        );
        assert!(reg.pause(&id, by("u2", Role::Admin)).is_ok());
    }

    #[test]
    fn admins_stay_inside_their_organization() {
        let reg = registry();
        let id = reg.create(StreamType::AgentExecution, owner("u1")).stream_id.to_string();
        let outsider = Requester {
            user_id: "a2",
            organization_id: "org-2",
            role: Role::Admin,
        };
        assert_eq!(reg.pause(&id, outsider), Err(StreamError::TenantAccessDenied(id.clone())));
        assert_matches!(reg.cancel(&id, outsider), Err(StreamError::TenantAccessDenied(_)));
        assert!(reg.get(&id).is_some());

        let root = Requester {
            user_id: "root",
            organization_id: "org-0",
            role: Role::SuperAdmin,
        };
        assert!(reg.pause(&id, root).is_ok());
    }

    #[test]
    fn cancel_removes_session() {
        let reg = registry();
        let s = reg.create(StreamType::AgentExecution, owner("u1"));
        let id = s.stream_id.to_string();
        let cancelled = reg.cancel(&id, by("u1", Role::Viewer)).unwrap();
        assert_eq!(cancelled.state(), StreamState::Cancelled);
        assert!(reg.is_empty());
        assert_matches!(reg.cancel(&id, by("u1", Role::Viewer)), Err(StreamError::NotFound(missing)) if missing == id);
    }

    #[test]
    fn finish_and_fail_end_sessions() {
        let reg = registry();
        let a = reg.create(StreamType::AgentExecution, owner("u1"));
        let b = reg.create(StreamType::AgentExecution, owner("u1"));
        assert!(reg.finish(a.stream_id.as_str()));
        assert!(reg.fail(b.stream_id.as_str()));
        assert_eq!(a.state(), StreamState::Completed);
        assert_eq!(b.state(), StreamState::Error);
        assert!(!reg.finish(a.stream_id.as_str()));
        assert!(reg.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_sweep_expires_quiet_sessions() {
        let reg = registry();
        let quiet = reg.create(StreamType::AgentExecution, owner("u1"));
        let busy = reg.create(StreamType::AgentExecution, owner("u1"));

        tokio::time::advance(Duration::from_secs(45)).await;
        assert!(reg.touch(busy.stream_id.as_str()));
        tokio::time::advance(Duration::from_secs(20)).await;

        let expired = reg.sweep_idle();
        assert_eq!(expired, vec![quiet.stream_id.clone()]);
        assert_eq!(quiet.state(), StreamState::Error);
        assert_eq!(reg.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_loop_stops_on_cancel() {
        let reg = Arc::new(registry());
        let s = reg.create(StreamType::AgentExecution, owner("u1"));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(reg.clone().run_sweep(Duration::from_secs(30), cancel.clone()));

        tokio::time::sleep(Duration::from_secs(95)).await;
        assert!(reg.get(s.stream_id.as_str()).is_none());

        cancel.cancel();
        task.await.unwrap();
    }

    #[test]
    fn info_view() {
        let reg = registry();
        let s = reg.create(StreamType::KbSearch, owner("u1"));
        let json = serde_json::to_value(StreamInfo::from(&*s)).unwrap();
        assert_eq!(json["state"], "STREAMING");
        assert_eq!(json["streamType"], "kb_search");
        assert_eq!(json["sessionId"], "sess-1");
    }
}
