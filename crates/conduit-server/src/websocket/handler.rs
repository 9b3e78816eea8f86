//! Inbound message pipeline.
//!
//! Every text frame runs, in order: schema validation and sanitization,
//! signature check (when required), the role's payload cap, capability,
//! security level, tenant isolation, rate limits, and finally dispatch on
//! the typed [`ClientMessage`]. Each round trip is traced by the monitor.
//! Failures become `ERROR` replies; the connection stays open.

use std::sync::Arc;

use conduit_core::{TraceId, clock};
use conduit_protocol::errors as codes;
use conduit_protocol::messages::{
    AckPayload, EventPublishPayload, EventReplayPayload, MetricsRequestPayload, StreamControlPayload,
    SubscribePayload, UnsubscribePayload,
};
use conduit_protocol::policy::{
    can_send, is_privileged_event_type, meets_security_level, validate_tenant_access,
};
use conduit_protocol::{
    Capability, ClientMessage, Envelope, ErrorPayload, MessageType, PublishOptions, RateKind, TargetType,
    Targeting, ValidatedEnvelope,
};
use conduit_store::EventLogQuery;
use metrics::counter;
use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::{debug, instrument, warn};

use super::connection::ClientConnection;
use crate::errors::{PublishError, ReplayError, StreamError};
use crate::metrics::{GATEWAY_MESSAGE_ERRORS_TOTAL, GATEWAY_MESSAGES_TOTAL};
use crate::rate_limit::RateDecision;
use crate::server::AppState;
use crate::streaming::{Requester, StreamOwner, StreamType};

/// Window used by `METRICS_REQUEST` when the client sets none.
const DEFAULT_METRICS_WINDOW_MS: i64 = 60_000;

/// What to send back for a request.
enum Reply {
    /// Send this envelope now.
    Now(Envelope),
    /// A background task replies when the work finishes.
    Deferred,
}

/// Handle one inbound text frame from `connection`.
#[instrument(skip_all, fields(conn_id = %connection.id, message_type))]
pub async fn handle_text(state: &AppState, connection: &Arc<ClientConnection>, text: &str) {
    let validated = match state.schemas.validate_text(text) {
        Ok(v) => v,
        Err(e) => {
            counter!(GATEWAY_MESSAGES_TOTAL, "type" => "INVALID").increment(1);
            debug!(code = e.code, "rejected invalid frame");
            let (session_id, request_id) = fallback_ids(text);
            let trace = state
                .monitor
                .trace_start("INVALID", &connection.organization_id, &connection.user_id)
                .await;
            let payload = to_value(&ErrorPayload::from(&e));
            let reply = Envelope::new(MessageType::Error, session_id, request_id, payload);
            finish(state, connection, &trace, reply).await;
            return;
        }
    };

    let message_type = validated.message_type();
    let _ = tracing::Span::current().record("message_type", message_type.as_str());
    counter!(GATEWAY_MESSAGES_TOTAL, "type" => message_type.as_str()).increment(1);
    let trace = state
        .monitor
        .trace_start(message_type.as_str(), &connection.organization_id, &connection.user_id)
        .await;

    match process(state, connection, validated, &trace).await {
        Reply::Now(reply) => finish(state, connection, &trace, reply).await,
        Reply::Deferred => {}
    }
}

/// Run the policy checks and dispatch a validated message.
async fn process(
    state: &AppState,
    connection: &Arc<ClientConnection>,
    validated: ValidatedEnvelope,
    trace: &TraceId,
) -> Reply {
    let ValidatedEnvelope {
        envelope,
        payload_bytes,
        sanitized_strings,
        signing_input,
    } = validated;
    if sanitized_strings > 0 {
        debug!(sanitized_strings, "payload strings sanitized");
    }
    if let Err(error) = authorize(state, connection, &envelope, payload_bytes, &signing_input).await {
        return Reply::Now(error_reply(&envelope, &error));
    }

    let message = match ClientMessage::parse(envelope.message_type, envelope.payload.clone()) {
        Ok(m) => m,
        Err(e) => return Reply::Now(error_reply(&envelope, &ErrorPayload::from(&e))),
    };

    match message {
        ClientMessage::Ping => {
            let _ = state.registry.update_heartbeat(connection.id.as_str()).await;
            Reply::Now(envelope.reply(MessageType::Pong, json!({ "serverTime": clock::now_ms() })))
        }
        ClientMessage::Subscribe(p) => Reply::Now(subscribe(state, connection, &envelope, p).await),
        ClientMessage::Unsubscribe(p) => Reply::Now(unsubscribe(state, connection, &envelope, p).await),
        ClientMessage::EventPublish(p) => Reply::Now(publish(state, connection, &envelope, p).await),
        ClientMessage::EventReplay(p) => {
            replay(state, connection, envelope, p, trace.clone());
            Reply::Deferred
        }
        ClientMessage::AgentExecute(_) => {
            Reply::Now(start_stream(state, connection, &envelope, StreamType::AgentExecution).await)
        }
        ClientMessage::ToolExecute(_) => {
            Reply::Now(start_stream(state, connection, &envelope, StreamType::ToolExecution).await)
        }
        ClientMessage::KbSearch(_) => {
            Reply::Now(start_stream(state, connection, &envelope, StreamType::KbSearch).await)
        }
        ClientMessage::AgentCancel(p) | ClientMessage::StreamCancel(p) => {
            Reply::Now(cancel_stream(state, connection, &envelope, &p).await)
        }
        ClientMessage::HitlResponse(p) => {
            let reply = forward(state, connection, &envelope, None).await.map(|_| {
                ack(&envelope, json!({ "hitlRequestId": p.hitl_request_id, "decision": p.decision }))
            });
            Reply::Now(reply.unwrap_or_else(|e| error_reply(&envelope, &e)))
        }
        ClientMessage::StreamPause(p) => Reply::Now(control_stream(state, connection, &envelope, &p, true)),
        ClientMessage::StreamResume(p) => Reply::Now(control_stream(state, connection, &envelope, &p, false)),
        ClientMessage::MetricsRequest(p) => Reply::Now(metrics(state, connection, &envelope, p)),
        ClientMessage::HealthCheck => {
            let report = state.monitor.health_status().await;
            Reply::Now(envelope.reply(MessageType::HealthStatus, to_value(&report)))
        }
        ClientMessage::SchemaDescribe(p) => Reply::Now(match state.schemas.describe(&p.message_type) {
            Some(description) => envelope.reply(MessageType::SchemaDescription, to_value(&description)),
            None => error_reply(
                &envelope,
                &ErrorPayload::new(
                    codes::UNKNOWN_MESSAGE_TYPE,
                    format!("unknown message type: {}", p.message_type),
                ),
            ),
        }),
    }
}

/// Signature, payload cap, capability, security level, tenant isolation and
/// rate limits, in that order.
async fn authorize(
    state: &AppState,
    connection: &ClientConnection,
    envelope: &Envelope,
    payload_bytes: usize,
    signing_input: &str,
) -> Result<(), ErrorPayload> {
    let role = connection.role;
    let policy = role.policy();
    let message_type = envelope.message_type;

    if state.config.require_signed_messages {
        let valid = match (&state.signer, envelope.signature.as_deref()) {
            (Some(signer), Some(signature)) => signer.verify_input(signing_input, signature),
            _ => false,
        };
        if !valid {
            return Err(ErrorPayload::new(codes::INVALID_SIGNATURE, "message signature is missing or invalid"));
        }
    }

    if payload_bytes > policy.max_payload_bytes {
        return Err(ErrorPayload::new(
            codes::PAYLOAD_TOO_LARGE,
            format!(
                "payload is {payload_bytes} bytes, {} may send at most {}",
                role.as_str(),
                policy.max_payload_bytes
            ),
        ));
    }

    if !can_send(role, message_type.as_str()) {
        return Err(ErrorPayload::new(
            codes::INSUFFICIENT_PERMISSIONS,
            format!("{} may not send {message_type}", role.as_str()),
        ));
    }

    let schema = message_type.schema();
    let declared_ok = envelope
        .security_level
        .is_none_or(|level| meets_security_level(role, level));
    if !meets_security_level(role, schema.required_security) || !declared_ok {
        return Err(ErrorPayload::new(
            codes::INSUFFICIENT_SECURITY_LEVEL,
            format!("{message_type} requires a higher security level than {}", role.as_str()),
        ));
    }

    if schema.tenant_isolation_required {
        for org in payload_organizations(&envelope.payload) {
            if !validate_tenant_access(&connection.organization_id, org, role) {
                return Err(ErrorPayload::new(
                    codes::TENANT_ACCESS_DENIED,
                    format!("cannot act on organization {org}"),
                ));
            }
        }
    }

    let mut kinds = vec![RateKind::Messages];
    if message_type.is_execution() {
        kinds.push(RateKind::Executions);
    }
    if message_type.starts_stream() {
        kinds.push(RateKind::Streams);
    }
    for kind in kinds {
        if let RateDecision::Limited { retry_after_ms } = state.rate_limiter.check(connection, kind).await {
            return Err(ErrorPayload::new(
                codes::RATE_LIMIT_EXCEEDED,
                format!("{} budget for {} exhausted", kind.as_str(), role.as_str()),
            )
            .with_retry_after(retry_after_ms));
        }
    }
    Ok(())
}

/// Organization ids a payload names, at the top level or in its targeting.
fn payload_organizations(payload: &Value) -> Vec<&str> {
    [
        payload.get("organizationId"),
        payload.get("targeting").and_then(|t| t.get("organizationId")),
    ]
    .into_iter()
    .flatten()
    .filter_map(Value::as_str)
    .collect()
}

async fn subscribe(
    state: &AppState,
    connection: &ClientConnection,
    envelope: &Envelope,
    p: SubscribePayload,
) -> Envelope {
    let target_type = p.target_type.unwrap_or_default();
    let conn_id = connection.id.as_str();
    let mut added: Vec<String> = Vec::with_capacity(p.event_types.len());
    for event_type in &p.event_types {
        let result = state
            .subscriptions
            .subscribe(conn_id, event_type, target_type, p.target_id.as_deref(), p.filters.clone())
            .await;
        if let Err(e) = result {
            for done in &added {
                let _ = state.subscriptions.unsubscribe(conn_id, done).await;
            }
            return error_reply(envelope, &ErrorPayload::from(&e));
        }
        added.push(event_type.clone());
    }
    ack(
        envelope,
        json!({
            "subscribed": added,
            "targetType": target_type,
            "targetId": p.target_id,
        }),
    )
}

async fn unsubscribe(
    state: &AppState,
    connection: &ClientConnection,
    envelope: &Envelope,
    p: UnsubscribePayload,
) -> Envelope {
    let conn_id = connection.id.as_str();
    match p.event_types {
        None => {
            let removed = state.subscriptions.unsubscribe_all(conn_id).await;
            ack(envelope, json!({ "removed": removed }))
        }
        Some(event_types) => {
            let mut removed = Vec::new();
            for event_type in event_types {
                if state.subscriptions.unsubscribe(conn_id, &event_type).await {
                    removed.push(event_type);
                }
            }
            ack(envelope, json!({ "unsubscribed": removed }))
        }
    }
}

async fn publish(
    state: &AppState,
    connection: &ClientConnection,
    envelope: &Envelope,
    p: EventPublishPayload,
) -> Envelope {
    let role = connection.role;
    let lifecycle = MessageType::parse(&p.event_type).is_some_and(MessageType::is_lifecycle);
    if (lifecycle || is_privileged_event_type(&p.event_type)) && !role.policy().has(Capability::Admin) {
        return error_reply(
            envelope,
            &ErrorPayload::new(
                codes::INSUFFICIENT_PERMISSIONS,
                format!("publishing {} requires the ADMIN capability", p.event_type),
            ),
        );
    }
    let targeting = match p.targeting {
        Some(t) => t.resolve(&connection.organization_id),
        None => Targeting::tenant(&connection.organization_id),
    };
    if targeting.target_type == TargetType::All && !role.is_super_admin() {
        return error_reply(
            envelope,
            &ErrorPayload::new(codes::TENANT_ACCESS_DENIED, "ALL-targeted publications require SUPER_ADMIN"),
        );
    }
    let options = PublishOptions {
        priority: p.priority.unwrap_or_default(),
        correlation_id: envelope.correlation_id.clone(),
        target_module: p.target_module,
        ..PublishOptions::default()
    };
    match state.publisher.publish(&p.event_type, p.data, targeting, options).await {
        Ok(outcome) => ack(envelope, to_value(&outcome)),
        Err(e) => error_reply(envelope, &ErrorPayload::from(&e)),
    }
}

/// Start a replay in the background; it replies when done.
fn replay(
    state: &AppState,
    connection: &Arc<ClientConnection>,
    envelope: Envelope,
    p: EventReplayPayload,
    trace: TraceId,
) {
    let query = EventLogQuery {
        organization_id: p
            .organization_id
            .unwrap_or_else(|| connection.organization_id.clone()),
        from_timestamp: p.from_timestamp,
        to_timestamp: p.to_timestamp,
        event_types: p.event_types.unwrap_or_default(),
        correlation_id: p.correlation_id,
        limit: p.max_events.unwrap_or(0),
    };
    let state = state.clone();
    let connection = connection.clone();
    let _ = tokio::spawn(async move {
        let reply = match state.publisher.replay(query).await {
            Ok(replayed) => ack(&envelope, json!({ "replayed": replayed })),
            Err(e) => {
                if let ReplayError::Aborted { replayed, .. } = &e {
                    warn!(replayed, "replay stopped early");
                }
                error_reply(&envelope, &ErrorPayload::from(&e))
            }
        };
        finish(&state, &connection, &trace, reply).await;
    });
}

async fn start_stream(
    state: &AppState,
    connection: &ClientConnection,
    envelope: &Envelope,
    stream_type: StreamType,
) -> Envelope {
    let session = state.streams.create(
        stream_type,
        StreamOwner {
            user_id: connection.user_id.clone(),
            organization_id: connection.organization_id.clone(),
            connection_id: connection.id.to_string(),
            session_id: envelope.session_id.clone(),
        },
    );
    let stream_id = session.stream_id.to_string();
    match forward(state, connection, envelope, Some(&stream_id)).await {
        Ok(()) => ack(
            envelope,
            json!({
                "streamId": stream_id,
                "streamType": stream_type,
                "state": session.state(),
            }),
        ),
        Err(e) => {
            let _ = state.streams.fail(&stream_id);
            error_reply(envelope, &e)
        }
    }
}

async fn cancel_stream(
    state: &AppState,
    connection: &ClientConnection,
    envelope: &Envelope,
    p: &StreamControlPayload,
) -> Envelope {
    match state
        .streams
        .cancel(&p.stream_id, requester(connection))
    {
        Ok(session) => {
            if let Err(e) = forward(state, connection, envelope, Some(&p.stream_id)).await {
                warn!(stream_id = %p.stream_id, code = %e.code, "cancel not forwarded");
            }
            ack(envelope, json!({ "streamId": p.stream_id, "state": session.state() }))
        }
        Err(e) => error_reply(envelope, &ErrorPayload::from(&e)),
    }
}

fn control_stream(
    state: &AppState,
    connection: &ClientConnection,
    envelope: &Envelope,
    p: &StreamControlPayload,
    pause: bool,
) -> Envelope {
    let result: Result<_, StreamError> = if pause {
        state.streams.pause(&p.stream_id, requester(connection))
    } else {
        state.streams.resume(&p.stream_id, requester(connection))
    };
    match result {
        Ok(next) => ack(envelope, json!({ "streamId": p.stream_id, "state": next })),
        Err(e) => error_reply(envelope, &ErrorPayload::from(&e)),
    }
}

fn requester(connection: &ClientConnection) -> Requester<'_> {
    Requester {
        user_id: &connection.user_id,
        organization_id: &connection.organization_id,
        role: connection.role,
    }
}

fn metrics(
    state: &AppState,
    connection: &ClientConnection,
    envelope: &Envelope,
    p: MetricsRequestPayload,
) -> Envelope {
    let org = p
        .organization_id
        .unwrap_or_else(|| connection.organization_id.clone());
    let window_ms = p.window_ms.unwrap_or(DEFAULT_METRICS_WINDOW_MS).max(1);
    let snapshot = state.monitor.performance_metrics(Some(&org), window_ms);
    envelope.reply(MessageType::MetricsResponse, to_value(&snapshot))
}

/// Hand a request to the execution engine, tagged with the requester and
/// (for streamed work) its stream id.
async fn forward(
    state: &AppState,
    connection: &ClientConnection,
    envelope: &Envelope,
    stream_id: Option<&str>,
) -> Result<(), ErrorPayload> {
    let mut body = match &envelope.payload {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    let _ = body.insert("userId".into(), json!(connection.user_id));
    let _ = body.insert("connectionId".into(), json!(connection.id));
    let _ = body.insert("sessionId".into(), json!(envelope.session_id));
    if let Some(id) = stream_id {
        let _ = body.insert("streamId".into(), json!(id));
    }
    let correlation_id = envelope
        .correlation_id
        .clone()
        .or_else(|| stream_id.map(str::to_owned));

    state
        .publisher
        .route_to_execution_engine(
            envelope.message_type.as_str(),
            Value::Object(body),
            &connection.organization_id,
            correlation_id,
        )
        .await
        .map(|_| ())
        .map_err(|e: PublishError| ErrorPayload::from(&e))
}

/// Sign, send and close the trace.
async fn finish(state: &AppState, connection: &ClientConnection, trace: &TraceId, mut reply: Envelope) {
    if let Some(signer) = &state.signer {
        signer.sign(&mut reply);
    }
    let error_code = (reply.message_type == MessageType::Error)
        .then(|| reply.payload.get("code").and_then(Value::as_str).map(str::to_owned))
        .flatten();
    let text = match reply.to_text() {
        Ok(t) => t,
        Err(e) => {
            warn!(error = %e, "failed to encode reply");
            let _ = state
                .monitor
                .trace_end(trace.as_str(), false, 0, Some(codes::INTERNAL_ERROR))
                .await;
            return;
        }
    };
    let bytes = text.len();
    if !connection.send(Arc::new(text)) {
        debug!("reply dropped, send queue full or closed");
    }
    if let Some(code) = &error_code {
        counter!(GATEWAY_MESSAGE_ERRORS_TOTAL, "code" => code.clone()).increment(1);
    }
    let _ = state
        .monitor
        .trace_end(trace.as_str(), error_code.is_none(), bytes, error_code.as_deref())
        .await;
}

fn ack(envelope: &Envelope, data: Value) -> Envelope {
    let payload = AckPayload {
        request_type: envelope.message_type,
        data,
    };
    envelope.reply(MessageType::Ack, to_value(&payload))
}

fn error_reply(envelope: &Envelope, error: &ErrorPayload) -> Envelope {
    envelope.reply(MessageType::Error, to_value(error))
}

fn to_value<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or_else(|e| {
        warn!(error = %e, "failed to encode payload");
        Value::Null
    })
}

/// Best-effort ids of a frame that failed validation, so the error can
/// still be correlated.
fn fallback_ids(text: &str) -> (String, String) {
    let raw: Value = serde_json::from_str(text).unwrap_or(Value::Null);
    let id = |key: &str| {
        raw.get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned()
    };
    (id("session_id"), id("request_id"))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(unused_results)]
mod tests {
    use super::*;
    use crate::auth::AuthContext;
    use crate::config::GatewayConfig;
    use conduit_protocol::signing::{Signer, signing_input};
    use conduit_protocol::Role;
    use conduit_store::{AuditStore, MemoryStore};
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Client {
        conn: Arc<ClientConnection>,
        rx: mpsc::Receiver<Arc<String>>,
    }

    impl Client {
        async fn next(&mut self) -> Value {
            let text = tokio::time::timeout(Duration::from_secs(5), self.rx.recv())
                .await
                .unwrap()
                .unwrap();
            serde_json::from_str(&text).unwrap()
        }
    }

    fn state_with(config: GatewayConfig) -> AppState {
        AppState::new(
            config,
            Arc::new(MemoryStore::new()),
            Some(AuditStore::in_memory().unwrap()),
        )
    }

    fn state() -> AppState {
        let mut config = GatewayConfig::default();
        config.replay_pacing = Duration::from_millis(1);
        state_with(config)
    }

    async fn client(state: &AppState, user: &str, org: &str, role: Role) -> Client {
        let (tx, rx) = mpsc::channel(64);
        let auth = AuthContext {
            user_id: user.into(),
            organization_id: org.into(),
            role,
        };
        let conn = state.registry.add(&auth, tx).await.unwrap();
        Client { conn, rx }
    }

    fn frame(message_type: &str, request_id: &str, payload: Value) -> String {
        json!({
            "type": message_type,
            "session_id": "sess-1",
            "request_id": request_id,
            "payload": payload,
        })
        .to_string()
    }

    async fn send(state: &AppState, c: &mut Client, message_type: &str, payload: Value) -> Value {
        handle_text(state, &c.conn, &frame(message_type, "r1", payload)).await;
        c.next().await
    }

    #[tokio::test]
    async fn ping_replies_pong_and_traces() {
        let state = state();
        let mut c = client(&state, "u1", "org-1", Role::Viewer).await;
        let reply = send(&state, &mut c, "PING", json!({})).await;
        assert_eq!(reply["type"], "PONG");
        assert_eq!(reply["request_id"], "r1");
        assert_eq!(reply["session_id"], "sess-1");
        assert!(reply["payload"]["serverTime"].is_i64());
        assert_eq!(state.monitor.sample_count(), 1);
    }

    #[tokio::test]
    async fn invalid_json_gets_validation_error() {
        let state = state();
        let mut c = client(&state, "u1", "org-1", Role::Viewer).await;
        handle_text(&state, &c.conn, "{not json").await;
        let reply = c.next().await;
        assert_eq!(reply["type"], "ERROR");
        assert_eq!(reply["payload"]["code"], codes::INVALID_JSON);
        assert_eq!(reply["payload"]["category"], "validation");
    }

    #[tokio::test]
    async fn missing_ids_are_echoed_when_present() {
        let state = state();
        let mut c = client(&state, "u1", "org-1", Role::Viewer).await;
        let text = json!({"type": "PING", "request_id": "r9", "payload": {}}).to_string();
        handle_text(&state, &c.conn, &text).await;
        let reply = c.next().await;
        assert_eq!(reply["payload"]["code"], codes::MISSING_REQUIRED_FIELD);
        assert_eq!(reply["request_id"], "r9");
    }

    #[tokio::test]
    async fn oversized_payload_is_rejected_first() {
        let state = state();
        let mut c = client(&state, "u1", "org-1", Role::Admin).await;
        let big = "x".repeat(1_100_000);
        let reply = send(&state, &mut c, "NOT_A_TYPE", json!({ "blob": big })).await;
        assert_eq!(reply["payload"]["code"], codes::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn role_payload_cap_applies() {
        let state = state();
        let mut c = client(&state, "u1", "org-1", Role::Viewer).await;
        let blob = "y".repeat(70 * 1024);
        let reply = send(
            &state,
            &mut c,
            "KB_SEARCH",
            json!({ "knowledgeBaseId": "kb", "query": blob }),
        )
        .await;
        assert_eq!(reply["payload"]["code"], codes::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn viewer_cannot_execute() {
        let state = state();
        let mut c = client(&state, "u1", "org-1", Role::Viewer).await;
        let reply = send(&state, &mut c, "AGENT_EXECUTE", json!({ "agentId": "a", "input": "hi" })).await;
        assert_eq!(reply["payload"]["code"], codes::INSUFFICIENT_PERMISSIONS);
        assert_eq!(reply["payload"]["category"], "authorization");
    }

    #[tokio::test]
    async fn metrics_need_confidential_level() {
        let state = state();
        let mut dev = client(&state, "u1", "org-1", Role::Developer).await;
        let reply = send(&state, &mut dev, "METRICS_REQUEST", json!({})).await;
        assert_eq!(reply["payload"]["code"], codes::INSUFFICIENT_SECURITY_LEVEL);

        let mut admin = client(&state, "a1", "org-1", Role::Admin).await;
        let reply = send(&state, &mut admin, "METRICS_REQUEST", json!({ "windowMs": 60000 })).await;
        assert_eq!(reply["type"], "METRICS_RESPONSE");
        assert_eq!(reply["payload"]["windowMs"], 60000);
        assert_eq!(reply["payload"]["organizationId"], "org-1");
    }

    #[tokio::test]
    async fn tenant_isolation_on_payload_org() {
        let state = state();
        let mut admin = client(&state, "a1", "org-1", Role::Admin).await;
        let reply = send(
            &state,
            &mut admin,
            "METRICS_REQUEST",
            json!({ "organizationId": "org-2" }),
        )
        .await;
        assert_eq!(reply["payload"]["code"], codes::TENANT_ACCESS_DENIED);

        let reply = send(
            &state,
            &mut admin,
            "EVENT_PUBLISH",
            json!({ "eventType": "x", "data": {}, "targeting": { "type": "TENANT", "organizationId": "org-2" } }),
        )
        .await;
        assert_eq!(reply["payload"]["code"], codes::TENANT_ACCESS_DENIED);
    }

    #[tokio::test]
    async fn viewer_rate_limit_kicks_in_at_fifty_one() {
        let state = state();
        let mut c = client(&state, "u1", "org-1", Role::Viewer).await;
        // Stay inside one window even if the test straddles a minute boundary.
        if clock::ms_until_next_minute(clock::now_ms()) < 5_000 {
            tokio::time::sleep(Duration::from_secs(6)).await;
        }
        for i in 0..50 {
            let reply = send(&state, &mut c, "PING", json!({})).await;
            assert_eq!(reply["type"], "PONG", "message {i}");
        }
        let reply = send(&state, &mut c, "PING", json!({})).await;
        assert_eq!(reply["payload"]["code"], codes::RATE_LIMIT_EXCEEDED);
        assert!(reply["payload"]["retryAfterMs"].as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn subscribe_then_receive_published_event() {
        let state = state();
        let mut sub = client(&state, "u1", "org-1", Role::Developer).await;
        let mut pub_ = client(&state, "u2", "org-1", Role::Developer).await;

        let reply = send(&state, &mut sub, "SUBSCRIBE", json!({ "eventTypes": ["build.done"] })).await;
        assert_eq!(reply["type"], "ACK");
        assert_eq!(reply["payload"]["requestType"], "SUBSCRIBE");
        assert_eq!(reply["payload"]["data"]["subscribed"], json!(["build.done"]));

        let reply = send(
            &state,
            &mut pub_,
            "EVENT_PUBLISH",
            json!({ "eventType": "build.done", "data": { "n": 7 } }),
        )
        .await;
        assert_eq!(reply["type"], "ACK");
        assert_eq!(reply["payload"]["data"]["delivered"], 1);

        let event = sub.next().await;
        assert_eq!(event["type"], "EVENT");
        assert_eq!(event["payload"]["data"]["n"], 7);
    }

    #[tokio::test]
    async fn subscribe_is_all_or_nothing() {
        let state = state();
        let mut c = client(&state, "u1", "org-1", Role::Developer).await;
        let reply = send(
            &state,
            &mut c,
            "SUBSCRIBE",
            json!({ "eventTypes": ["ok.one", "billing.updated"] }),
        )
        .await;
        assert_eq!(reply["payload"]["code"], codes::INSUFFICIENT_PERMISSIONS);
        assert!(state.subscriptions.subscriptions_of(c.conn.id.as_str()).is_empty());
    }

    #[tokio::test]
    async fn unsubscribe_variants() {
        let state = state();
        let mut c = client(&state, "u1", "org-1", Role::Developer).await;
        send(&state, &mut c, "SUBSCRIBE", json!({ "eventTypes": ["a", "b", "c"] })).await;
        let reply = send(&state, &mut c, "UNSUBSCRIBE", json!({ "eventTypes": ["a", "zz"] })).await;
        assert_eq!(reply["payload"]["data"]["unsubscribed"], json!(["a"]));
        let reply = send(&state, &mut c, "UNSUBSCRIBE", json!({})).await;
        assert_eq!(reply["payload"]["data"]["removed"], 2);
    }

    #[tokio::test]
    async fn non_admin_cannot_publish_privileged_events() {
        let state = state();
        let mut c = client(&state, "u1", "org-1", Role::Developer).await;
        let reply = send(&state, &mut c, "EVENT_PUBLISH", json!({ "eventType": "system.reboot", "data": {} })).await;
        assert_eq!(reply["payload"]["code"], codes::INSUFFICIENT_PERMISSIONS);
    }

    #[tokio::test]
    async fn non_admin_cannot_publish_lifecycle_events() {
        let state = state();
        let mut owner = client(&state, "u1", "org-1", Role::Developer).await;
        let reply = send(&state, &mut owner, "AGENT_EXECUTE", json!({ "agentId": "a", "input": "hi" })).await;
        let stream_id = reply["payload"]["data"]["streamId"].as_str().unwrap().to_owned();

        let mut dev = client(&state, "u2", "org-2", Role::Developer).await;
        let reply = send(
            &state,
            &mut dev,
            "EVENT_PUBLISH",
            json!({ "eventType": "AGENT_EXECUTION_COMPLETE", "data": { "streamId": stream_id } }),
        )
        .await;
        assert_eq!(reply["type"], "ERROR");
        assert_eq!(reply["payload"]["code"], codes::INSUFFICIENT_PERMISSIONS);
        assert!(state.streams.get(&stream_id).is_some());
    }

    #[tokio::test]
    async fn admin_lifecycle_events_from_other_org_leave_stream_running() {
        let state = state();
        let mut owner = client(&state, "u1", "org-1", Role::Developer).await;
        let reply = send(&state, &mut owner, "AGENT_EXECUTE", json!({ "agentId": "a", "input": "hi" })).await;
        let stream_id = reply["payload"]["data"]["streamId"].as_str().unwrap().to_owned();

        let mut admin = client(&state, "a2", "org-2", Role::Admin).await;
        let reply = send(
            &state,
            &mut admin,
            "EVENT_PUBLISH",
            json!({ "eventType": "AGENT_EXECUTION_COMPLETE", "data": { "streamId": stream_id } }),
        )
        .await;
        assert_eq!(reply["type"], "ACK");
        let session = state.streams.get(&stream_id).unwrap();
        assert_eq!(session.state(), crate::streaming::StreamState::Streaming);
    }

    #[tokio::test]
    async fn execution_opens_stream_and_reaches_engine() {
        let state = state();
        let mut engine = client(&state, "svc", "org-1", Role::Admin).await;
        state
            .subscriptions
            .subscribe(engine.conn.id.as_str(), "AGENT_EXECUTE", TargetType::Tenant, None, None)
            .await
            .unwrap();
        let mut c = client(&state, "u1", "org-1", Role::Developer).await;

        let reply = send(&state, &mut c, "AGENT_EXECUTE", json!({ "agentId": "agent-1", "input": "hi" })).await;
        assert_eq!(reply["type"], "ACK");
        let stream_id = reply["payload"]["data"]["streamId"].as_str().unwrap().to_owned();
        assert_eq!(reply["payload"]["data"]["state"], "STREAMING");
        assert!(state.streams.get(&stream_id).is_some());

        let routed = engine.next().await;
        assert_eq!(routed["payload"]["eventType"], "AGENT_EXECUTE");
        assert_eq!(routed["payload"]["priority"], "high");
        assert_eq!(routed["payload"]["data"]["streamId"], stream_id);
        assert_eq!(routed["payload"]["data"]["agentId"], "agent-1");
        assert_eq!(routed["payload"]["correlationId"], stream_id);

        let reply = send(&state, &mut c, "STREAM_PAUSE", json!({ "streamId": stream_id })).await;
        assert_eq!(reply["payload"]["data"]["state"], "PAUSED");
        let reply = send(&state, &mut c, "STREAM_RESUME", json!({ "streamId": stream_id })).await;
        assert_eq!(reply["payload"]["data"]["state"], "STREAMING");
        let reply = send(&state, &mut c, "AGENT_CANCEL", json!({ "streamId": stream_id })).await;
        assert_eq!(reply["payload"]["data"]["state"], "CANCELLED");
        assert!(state.streams.is_empty());
    }

    #[tokio::test]
    async fn stream_control_requires_ownership() {
        let state = state();
        let mut owner = client(&state, "u1", "org-1", Role::Developer).await;
        let mut other = client(&state, "u2", "org-1", Role::Developer).await;
        let reply = send(
            &state,
            &mut owner,
            "TOOL_EXECUTE",
            json!({ "toolName": "grep", "arguments": {} }),
        )
        .await;
        let stream_id = reply["payload"]["data"]["streamId"].clone();
        let reply = send(&state, &mut other, "STREAM_PAUSE", json!({ "streamId": stream_id })).await;
        assert_eq!(reply["payload"]["code"], codes::SESSION_OWNERSHIP_DENIED);
        let reply = send(&state, &mut other, "STREAM_CANCEL", json!({ "streamId": "stream_missing" })).await;
        assert_eq!(reply["payload"]["code"], codes::STREAM_NOT_FOUND);
    }

    #[tokio::test]
    async fn admin_cannot_control_another_orgs_stream() {
        let state = state();
        let mut owner = client(&state, "u1", "org-1", Role::Developer).await;
        let mut admin = client(&state, "a2", "org-2", Role::Admin).await;
        let reply = send(&state, &mut owner, "AGENT_EXECUTE", json!({ "agentId": "a", "input": "hi" })).await;
        let stream_id = reply["payload"]["data"]["streamId"].as_str().unwrap().to_owned();

        let reply = send(&state, &mut admin, "STREAM_CANCEL", json!({ "streamId": stream_id })).await;
        assert_eq!(reply["type"], "ERROR");
        assert_eq!(reply["payload"]["code"], codes::TENANT_ACCESS_DENIED);
        let reply = send(&state, &mut admin, "STREAM_PAUSE", json!({ "streamId": stream_id })).await;
        assert_eq!(reply["payload"]["code"], codes::TENANT_ACCESS_DENIED);
        assert_eq!(
            state.streams.get(&stream_id).unwrap().state(),
            crate::streaming::StreamState::Streaming
        );
    }

    #[tokio::test]
    async fn replay_acks_after_delivery() {
        let state = state();
        let mut c = client(&state, "u1", "org-1", Role::Developer).await;
        let start = clock::now_ms() - 1_000;
        send(&state, &mut c, "SUBSCRIBE", json!({ "eventTypes": ["audit.thing"] })).await;
        for n in 0..2 {
            state
                .publisher
                .publish("audit.thing", json!({ "n": n }), Targeting::tenant("org-1"), PublishOptions::default())
                .await
                .unwrap();
            c.next().await;
        }

        handle_text(
            &state,
            &c.conn,
            &frame("EVENT_REPLAY", "r-replay", json!({ "fromTimestamp": start, "eventTypes": ["audit.thing"] })),
        )
        .await;
        let first = c.next().await;
        let second = c.next().await;
        let ack = c.next().await;
        assert_eq!(first["payload"]["data"]["n"], 0);
        assert_eq!(second["payload"]["data"]["n"], 1);
        assert_eq!(first["payload"]["sourceModule"], "replay");
        assert_eq!(ack["type"], "ACK");
        assert_eq!(ack["request_id"], "r-replay");
        assert_eq!(ack["payload"]["data"]["replayed"], 2);
    }

    #[tokio::test]
    async fn replay_without_log_reports_failure() {
        let mut config = GatewayConfig::default();
        config.replay_pacing = Duration::ZERO;
        let state = AppState::new(config, Arc::new(MemoryStore::new()), None);
        let mut c = client(&state, "u1", "org-1", Role::Developer).await;
        let reply = send(&state, &mut c, "EVENT_REPLAY", json!({ "fromTimestamp": 0 })).await;
        assert_eq!(reply["payload"]["code"], codes::REPLAY_FAILED);
    }

    #[tokio::test]
    async fn health_and_schema_introspection() {
        let state = state();
        let mut c = client(&state, "u1", "org-1", Role::Viewer).await;
        let reply = send(&state, &mut c, "HEALTH_CHECK", json!({})).await;
        assert_eq!(reply["type"], "HEALTH_STATUS");
        assert_eq!(reply["payload"]["status"], "healthy");

        let reply = send(&state, &mut c, "SCHEMA_DESCRIBE", json!({ "messageType": "SUBSCRIBE" })).await;
        assert_eq!(reply["type"], "SCHEMA_DESCRIPTION");
        assert_eq!(reply["payload"]["messageType"], "SUBSCRIBE");

        let reply = send(&state, &mut c, "SCHEMA_DESCRIBE", json!({ "messageType": "NOPE" })).await;
        assert_eq!(reply["payload"]["code"], codes::UNKNOWN_MESSAGE_TYPE);
    }

    #[tokio::test]
    async fn signed_messages_when_required() {
        let mut config = GatewayConfig::default();
        config.signing_secret = Some("k".into());
        config.require_signed_messages = true;
        let state = state_with(config);
        let mut c = client(&state, "u1", "org-1", Role::Viewer).await;

        let reply = send(&state, &mut c, "PING", json!({})).await;
        assert_eq!(reply["payload"]["code"], codes::INVALID_SIGNATURE);

        let signer = Signer::new("k");
        let ts = "2026-01-01T00:00:00.000Z";
        let payload = json!({});
        let sig = signer.sign_input(&signing_input("PING", "r2", ts, &payload));
        let text = json!({
            "type": "PING", "session_id": "s", "request_id": "r2",
            "timestamp": ts, "payload": payload, "signature": sig,
        })
        .to_string();
        handle_text(&state, &c.conn, &text).await;
        let reply = c.next().await;
        assert_eq!(reply["type"], "PONG");
        let env: Envelope = serde_json::from_value(reply).unwrap();
        assert!(signer.verify(&env));
    }

    #[test]
    fn payload_orgs_include_targeting() {
        let payload = json!({ "organizationId": "a", "targeting": { "organizationId": "b" } });
        assert_eq!(payload_organizations(&payload), vec!["a", "b"]);
        assert!(payload_organizations(&json!({ "organizationId": 5 })).is_empty());
    }
}
