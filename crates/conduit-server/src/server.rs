//! `GatewayServer`: Axum HTTP + WebSocket surface and task wiring.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::{Path, RawQuery, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use conduit_protocol::signing::Signer;
use conduit_protocol::SchemaRegistry;
use conduit_store::{AuditStore, SharedStore};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::auth::TokenVerifier;
use crate::config::GatewayConfig;
use crate::monitoring::{HealthState, Monitor};
use crate::publisher::EventPublisher;
use crate::rate_limit::RateLimiter;
use crate::registry::{ConnectionRegistry, DisconnectReason};
use crate::shutdown::ShutdownCoordinator;
use crate::streaming::StreamRegistry;
use crate::subscriptions::SubscriptionEngine;
use crate::websocket::{heartbeat, session};

/// Shared state accessible from Axum handlers and the message pipeline.
#[derive(Clone)]
pub struct AppState {
    /// Resolved configuration.
    pub config: Arc<GatewayConfig>,
    /// Broker and shared KV store.
    pub store: Arc<dyn SharedStore>,
    /// Live connections on this instance.
    pub registry: Arc<ConnectionRegistry>,
    /// Subscription indices.
    pub subscriptions: Arc<SubscriptionEngine>,
    /// Streaming sessions.
    pub streams: Arc<StreamRegistry>,
    /// Event fan-out.
    pub publisher: Arc<EventPublisher>,
    /// Latency tracing and health.
    pub monitor: Arc<Monitor>,
    /// Per-minute budgets.
    pub rate_limiter: RateLimiter,
    /// Message contracts.
    pub schemas: SchemaRegistry,
    /// Handshake credential check.
    pub verifier: TokenVerifier,
    /// Envelope signer, when a signing secret is configured.
    pub signer: Option<Signer>,
    /// Prometheus recorder, rendered at `/metrics`.
    pub metrics_handle: Option<PrometheusHandle>,
    /// Background task lifecycle.
    pub shutdown: Arc<ShutdownCoordinator>,
}

impl AppState {
    /// Wire every component over `store`. Without an audit store the
    /// gateway runs with no event log, so replay is unavailable.
    pub fn new(config: GatewayConfig, store: Arc<dyn SharedStore>, audit: Option<AuditStore>) -> Self {
        let signer = config.signing_secret.as_deref().map(Signer::new);
        let registry = Arc::new(ConnectionRegistry::new(
            store.clone(),
            config.instance_id.clone(),
            config.connection_record_ttl,
            config.max_connections,
        ));
        let subscriptions = Arc::new(SubscriptionEngine::new(
            registry.clone(),
            store.clone(),
            audit.clone(),
        ));
        registry.add_observer(subscriptions.clone());
        let streams = Arc::new(StreamRegistry::new(config.stream_idle_timeout));

        let mut publisher = EventPublisher::new(subscriptions.clone(), store.clone(), streams.clone(), &config);
        if let Some(audit) = audit {
            publisher = publisher.with_audit(audit);
        }
        if let Some(signer) = &signer {
            publisher = publisher.with_signer(signer.clone());
        }
        let monitor = Arc::new(Monitor::new(store.clone(), registry.clone(), &config));

        Self {
            rate_limiter: RateLimiter::new(store.clone()),
            schemas: SchemaRegistry::new(),
            verifier: TokenVerifier::new(&config.jwt_secret, config.jwt_issuer.as_deref()),
            signer,
            metrics_handle: None,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            publisher: Arc::new(publisher),
            config: Arc::new(config),
            store,
            registry,
            subscriptions,
            streams,
            monitor,
        }
    }

    /// Render the Prometheus recorder at `/metrics`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }
}

/// The gateway server.
pub struct GatewayServer {
    state: AppState,
}

impl GatewayServer {
    /// Create a server over prepared state.
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Shared state.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Get the shutdown coordinator.
    pub fn shutdown_coordinator(&self) -> &Arc<ShutdownCoordinator> {
        &self.state.shutdown
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/ws", get(ws_handler))
            .route("/schemas/{message_type}", get(schema_handler))
            .with_state(self.state.clone())
            .layer(CorsLayer::permissive())
    }

    /// Start the periodic tasks: heartbeat sweep, stream idle sweep, sample
    /// purge, alert fan-out and the broker listener.
    pub fn spawn_background_tasks(&self) {
        let state = &self.state;
        let coord = &state.shutdown;

        let registry = state.registry.clone();
        let (interval, timeout) = (state.config.sweep_interval, state.config.heartbeat_timeout);
        let token = coord.token();
        coord.spawn("heartbeat_sweep", async move {
            let removed = heartbeat::run_sweep(registry, interval, timeout, token).await;
            info!(removed, "heartbeat sweep stopped");
        });

        coord.spawn(
            "stream_sweep",
            state
                .streams
                .clone()
                .run_sweep(state.config.stream_sweep_interval, coord.token()),
        );
        coord.spawn("sample_purge", state.monitor.clone().run_purge(coord.token()));
        coord.spawn(
            "alert_fanout",
            state
                .monitor
                .clone()
                .run_alerts(state.publisher.clone(), coord.token()),
        );
        coord.spawn("broker_listener", state.publisher.clone().run_listener(coord.token()));
    }

    /// Bind and serve until the shutdown token fires. Returns the bound
    /// address and the serve task.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let addr = format!("{}:{}", self.state.config.host, self.state.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, instance_id = %self.state.config.instance_id, "gateway listening");

        let router = self.router();
        let token = self.state.shutdown.token();
        let handle = tokio::spawn(async move {
            let served = axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = served {
                warn!(error = %e, "server stopped with error");
            }
        });
        Ok((local_addr, handle))
    }

    /// Close every connection, then cancel and await the background tasks.
    pub async fn shutdown(&self, timeout: Option<Duration>) {
        let closed = self.state.registry.close_all(DisconnectReason::Shutdown).await;
        info!(closed, "connections closed for shutdown");
        self.state.shutdown.graceful_shutdown(timeout).await;
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Response {
    let report = state.monitor.health_status().await;
    let status = if report.status == HealthState::Unhealthy {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (status, Json(report)).into_response()
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics_handle {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            crate::metrics::render(handle),
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics recorder not installed").into_response(),
    }
}

/// GET /schemas/{message_type}
async fn schema_handler(State(state): State<AppState>, Path(message_type): Path<String>) -> Response {
    match state.schemas.describe(&message_type) {
        Some(description) => Json(description).into_response(),
        None => (StatusCode::NOT_FOUND, format!("unknown message type: {message_type}")).into_response(),
    }
}

/// GET /ws: authenticate, then upgrade.
///
/// Credentials are checked before the upgrade is accepted, so a rejected
/// caller never reaches the registry.
async fn ws_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let auth = match state.verifier.authenticate(&headers, query.as_deref()) {
        Ok(auth) => auth,
        Err(e) => {
            warn!(error = %e, "handshake rejected");
            return (StatusCode::UNAUTHORIZED, e.to_string()).into_response();
        }
    };
    let ws = match upgrade {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };
    if state.registry.len() >= state.config.max_connections {
        return (StatusCode::SERVICE_UNAVAILABLE, "connection limit reached").into_response();
    }
    ws.max_message_size(state.config.max_message_bytes)
        .on_upgrade(move |socket| session::run_session(socket, state, auth))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
