//! Event publication and cross-instance fan-out.
//!
//! `publish` validates lifecycle payloads, appends the publication to the
//! audit log (best-effort), puts it on the broker channel for its event type
//! and delivers it to this instance's matching subscribers. Every instance
//! runs a broker listener that delivers publications from other instances
//! locally; an instance skips its own echo by `origin_instance`.

use std::sync::Arc;
use std::time::Duration;

use conduit_core::ConnectionId;
use conduit_protocol::constants::{SOURCE_REPLAY, TARGET_EXECUTION_ENGINE};
use conduit_protocol::messages::EventDelivery;
use conduit_protocol::{
    Envelope, EventPublication, MessageType, Priority, PublishOptions, SchemaRegistry, Targeting,
};
use conduit_protocol::signing::Signer;
use conduit_store::{AuditStore, BrokerMessage, EventLogQuery, SharedStore, keys};
use metrics::counter;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::errors::{PublishError, ReplayError};
use crate::metrics::{EVENTS_DELIVERED_TOTAL, EVENTS_DROPPED_TOTAL, EVENTS_PUBLISHED_TOTAL};
use crate::streaming::StreamRegistry;
use crate::subscriptions::SubscriptionEngine;

/// Result of one publish call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishOutcome {
    /// Id of the publication.
    pub event_id: String,
    /// Local connections the event was queued to.
    pub delivered: usize,
    /// Whether the audit log accepted the row.
    pub logged: bool,
    /// Whether the broker accepted the publication.
    pub broadcast: bool,
}

/// Event publisher for one instance.
pub struct EventPublisher {
    subscriptions: Arc<SubscriptionEngine>,
    store: Arc<dyn SharedStore>,
    streams: Arc<StreamRegistry>,
    audit: Option<AuditStore>,
    signer: Option<Signer>,
    schemas: SchemaRegistry,
    instance_id: String,
    replay_pacing: Duration,
    default_max_events: usize,
}

impl EventPublisher {
    /// Publisher configured from `config`, without an audit log or signer.
    pub fn new(
        subscriptions: Arc<SubscriptionEngine>,
        store: Arc<dyn SharedStore>,
        streams: Arc<StreamRegistry>,
        config: &GatewayConfig,
    ) -> Self {
        Self {
            subscriptions,
            store,
            streams,
            audit: None,
            signer: None,
            schemas: SchemaRegistry::new(),
            instance_id: config.instance_id.clone(),
            replay_pacing: config.replay_pacing,
            default_max_events: config.replay_default_max_events,
        }
    }

    /// Persist publications to `audit` and enable replay.
    #[must_use]
    pub fn with_audit(mut self, audit: AuditStore) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Sign outbound event envelopes.
    #[must_use]
    pub fn with_signer(mut self, signer: Signer) -> Self {
        self.signer = Some(signer);
        self
    }

    /// This instance's broker identity.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Replay limit applied when a request sets none.
    pub fn default_max_events(&self) -> usize {
        self.default_max_events
    }

    /// Build and publish an event.
    pub async fn publish(
        &self,
        event_type: &str,
        payload: Value,
        targeting: Targeting,
        options: PublishOptions,
    ) -> Result<PublishOutcome, PublishError> {
        self.publish_publication(EventPublication::new(event_type, payload, targeting, options))
            .await
    }

    /// Publish a prepared publication.
    ///
    /// Log and broker failures are logged and reported in the outcome; they
    /// never stop local delivery.
    pub async fn publish_publication(
        &self,
        mut publication: EventPublication,
    ) -> Result<PublishOutcome, PublishError> {
        self.schemas
            .validate_event_payload(&publication.event_type, &publication.payload)
            .map_err(PublishError::Validation)?;
        publication.origin_instance = Some(self.instance_id.clone());
        let encoded = serde_json::to_string(&publication)?;

        let logged = if publication.is_replay() {
            false
        } else {
            self.append_to_log(&publication).await
        };

        let channel = keys::event_channel(&publication.event_type);
        let broadcast = match self.store.publish(&channel, &encoded).await {
            Ok(_) => true,
            Err(e) => {
                warn!(
                    event_id = %publication.event_id,
                    event_type = %publication.event_type,
                    error = %e,
                    "broker publish failed, delivering locally only"
                );
                false
            }
        };

        let delivered = self.deliver_local(&publication);
        self.observe_lifecycle(&publication);
        if logged {
            self.mark_processed(&publication).await;
        }
        counter!(EVENTS_PUBLISHED_TOTAL, "source" => publication.source_module.clone()).increment(1);
        debug!(
            event_id = %publication.event_id,
            event_type = %publication.event_type,
            target = publication.targeting.target_type.as_str(),
            delivered,
            "event published"
        );

        Ok(PublishOutcome {
            event_id: publication.event_id.to_string(),
            delivered,
            logged,
            broadcast,
        })
    }

    /// Queue an `EVENT` frame to every local connection the publication
    /// targets. Returns how many accepted it.
    pub fn deliver_local(&self, publication: &EventPublication) -> usize {
        let targets = self.subscriptions.resolve_targets(publication);
        if targets.is_empty() {
            return 0;
        }
        let payload = match serde_json::to_value(EventDelivery::from(publication)) {
            Ok(v) => v,
            Err(e) => {
                warn!(event_id = %publication.event_id, error = %e, "failed to encode delivery");
                return 0;
            }
        };
        let mut envelope = Envelope::new(
            MessageType::Event,
            &*self.instance_id,
            publication.event_id.as_str(),
            payload,
        )
        .with_correlation_id(publication.correlation_id.clone());
        if let Some(signer) = &self.signer {
            signer.sign(&mut envelope);
        }
        let frame = match envelope.to_text() {
            Ok(text) => Arc::new(text),
            Err(e) => {
                warn!(event_id = %publication.event_id, error = %e, "failed to encode event frame");
                return 0;
            }
        };

        let mut delivered = 0usize;
        let mut dropped: Vec<ConnectionId> = Vec::new();
        for connection in &targets {
            if connection.send(frame.clone()) {
                delivered += 1;
            } else {
                dropped.push(connection.id.clone());
            }
        }
        counter!(EVENTS_DELIVERED_TOTAL).increment(delivered as u64);
        if !dropped.is_empty() {
            counter!(EVENTS_DROPPED_TOTAL).increment(dropped.len() as u64);
            warn!(
                event_id = %publication.event_id,
                dropped = dropped.len(),
                "event dropped for connections with full queues"
            );
        }
        delivered
    }

    /// Deliver a publication received from the broker. Returns how many
    /// local connections accepted it; this instance's own echo is skipped.
    pub fn handle_broker_message(&self, message: &BrokerMessage) -> usize {
        let publication: EventPublication = match serde_json::from_str(&message.payload) {
            Ok(p) => p,
            Err(e) => {
                warn!(channel = %message.channel, error = %e, "undecodable broker message");
                return 0;
            }
        };
        if publication.origin_instance.as_deref() == Some(self.instance_id.as_str()) {
            return 0;
        }
        let delivered = self.deliver_local(&publication);
        self.observe_lifecycle(&publication);
        delivered
    }

    /// Deliver broker traffic from other instances until cancelled.
    pub async fn run_listener(self: Arc<Self>, cancel: CancellationToken) {
        let mut subscription = self.store.psubscribe(keys::EVENT_CHANNEL_PREFIX);
        info!(instance_id = %self.instance_id, "broker listener started");
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                message = subscription.recv() => {
                    let Some(message) = message else {
                        warn!("broker subscription closed");
                        break;
                    };
                    let _ = self.handle_broker_message(&message);
                }
            }
        }
        debug!("broker listener stopped");
    }

    /// Re-publish logged events matching `query`, oldest first, one per
    /// pacing interval. A `limit` of zero applies the default.
    ///
    /// On failure, events already re-published stay delivered.
    pub async fn replay(&self, mut query: EventLogQuery) -> Result<usize, ReplayError> {
        let audit = self.audit.as_ref().ok_or(ReplayError::Unavailable)?;
        if query.limit == 0 {
            query.limit = self.default_max_events;
        }
        let org = query.organization_id.clone();
        let entries = audit.call(move |s| s.replay_events(&query)).await?;
        info!(org_id = %org, count = entries.len(), "replaying events");

        let mut replayed = 0usize;
        for mut publication in entries {
            if replayed > 0 && !self.replay_pacing.is_zero() {
                tokio::time::sleep(self.replay_pacing).await;
            }
            publication.source_module = SOURCE_REPLAY.to_owned();
            if let Err(source) = self.publish_publication(publication).await {
                warn!(org_id = %org, replayed, error = %source, "replay aborted");
                return Err(ReplayError::Aborted { replayed, source });
            }
            replayed += 1;
        }
        Ok(replayed)
    }

    /// Signal another module: HIGH priority, TENANT targeting.
    pub async fn route_cross_module_event(
        &self,
        event_type: &str,
        payload: Value,
        organization_id: &str,
        correlation_id: Option<String>,
        target_module: &str,
    ) -> Result<PublishOutcome, PublishError> {
        let options = PublishOptions {
            priority: Priority::High,
            correlation_id,
            target_module: Some(target_module.to_owned()),
            ..PublishOptions::default()
        };
        self.publish(event_type, payload, Targeting::tenant(organization_id), options)
            .await
    }

    /// Hand an execution request to the execution engine.
    pub async fn route_to_execution_engine(
        &self,
        event_type: &str,
        payload: Value,
        organization_id: &str,
        correlation_id: Option<String>,
    ) -> Result<PublishOutcome, PublishError> {
        self.route_cross_module_event(
            event_type,
            payload,
            organization_id,
            correlation_id,
            TARGET_EXECUTION_ENGINE,
        )
        .await
    }

    async fn append_to_log(&self, publication: &EventPublication) -> bool {
        let Some(audit) = &self.audit else {
            return false;
        };
        let row = publication.clone();
        match audit.call(move |s| s.append_event(&row)).await {
            Ok(inserted) => inserted,
            Err(e) => {
                warn!(event_id = %publication.event_id, error = %e, "event log append failed");
                false
            }
        }
    }

    /// Flag the logged row as handled once local delivery has run.
    async fn mark_processed(&self, publication: &EventPublication) {
        let Some(audit) = &self.audit else {
            return;
        };
        let event_id = publication.event_id.clone();
        if let Err(e) = audit.call(move |s| s.mark_processed(event_id.as_str())).await {
            warn!(event_id = %publication.event_id, error = %e, "failed to mark event processed");
        }
    }

    /// Keep streaming sessions in step with lifecycle events. Only events
    /// addressed to the stream owner's organization change its state.
    fn observe_lifecycle(&self, publication: &EventPublication) {
        let Some(message_type) = MessageType::parse(&publication.event_type) else {
            return;
        };
        let Some(stream_id) = publication.payload.get("streamId").and_then(Value::as_str) else {
            return;
        };
        let Some(session) = self.streams.get(stream_id) else {
            return;
        };
        if session.owner.organization_id != publication.targeting.organization_id {
            warn!(
                stream_id,
                event_type = %publication.event_type,
                organization_id = %publication.targeting.organization_id,
                "ignoring lifecycle event from another organization"
            );
            return;
        }
        let _ = match message_type {
            MessageType::AgentExecutionComplete
            | MessageType::ToolExecutionComplete
            | MessageType::KbSearchResult
            | MessageType::StreamEnd => self.streams.finish(stream_id),
            MessageType::AgentExecutionError => self.streams.fail(stream_id),
            t if t.is_lifecycle() => self.streams.touch(stream_id),
            _ => false,
        };
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
