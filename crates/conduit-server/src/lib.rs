//! # conduit-server
//!
//! The real-time event gateway: Axum HTTP + `WebSocket` server, connection
//! registry, subscriptions and event fan-out.
//!
//! - **Connections**: JWT-authenticated handshake, per-connection send queue,
//!   heartbeat and session-timeout sweeps ([`registry`], [`websocket`])
//! - **Subscriptions**: event-type and target indices with tenant isolation
//!   ([`subscriptions`])
//! - **Publication**: local delivery, cross-instance fan-out through the
//!   shared broker, audit log and paced replay ([`publisher`])
//! - **Policy**: per-role capabilities, security levels and per-minute
//!   budgets ([`rate_limit`])
//! - **Streaming sessions** for agent, tool and knowledge-base work
//!   ([`streaming`])
//! - **Monitoring**: round-trip tracing, percentiles, alerts and health
//!   ([`monitoring`])
//! - Graceful shutdown via `CancellationToken` ([`shutdown`])

#![deny(unsafe_code)]

pub mod auth;
pub mod config;
pub mod errors;
pub mod metrics;
pub mod monitoring;
pub mod publisher;
pub mod rate_limit;
pub mod registry;
pub mod server;
pub mod shutdown;
pub mod streaming;
pub mod subscriptions;
pub mod websocket;

pub use auth::{AuthContext, Claims, TokenVerifier};
pub use config::GatewayConfig;
pub use monitoring::{HealthReport, HealthState, Monitor};
pub use publisher::{EventPublisher, PublishOutcome};
pub use registry::{ConnectionRegistry, DisconnectReason};
pub use server::{AppState, GatewayServer};
pub use shutdown::ShutdownCoordinator;
pub use streaming::{StreamRegistry, StreamState};
pub use subscriptions::{Subscription, SubscriptionEngine};
