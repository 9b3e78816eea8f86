//! Round-trip tracing, latency aggregation, alerting and health.
//!
//! Every handled message opens a trace (a short-TTL record in the shared
//! store) and closes it once the response is queued. Closing a trace yields
//! a [`LatencySample`] kept in an in-memory ring and mirrored to a capped
//! per-organization list in the shared store. Aggregates, alerts and the
//! health verdict are computed from the ring.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use conduit_core::{TraceId, clock};
use conduit_protocol::constants::SYSTEM_ALERT_EVENT;
use conduit_protocol::{Priority, PublishOptions, Targeting};
use conduit_store::{SharedStore, keys};
use dashmap::DashMap;
use metrics::{counter, histogram};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::metrics::{ALERTS_FIRED_TOTAL, GATEWAY_MESSAGE_LATENCY_SECONDS};
use crate::publisher::EventPublisher;
use crate::registry::ConnectionRegistry;

/// Window `check_alerts` evaluates.
pub const ALERT_WINDOW_MS: i64 = 60_000;
/// Window the health verdict evaluates.
pub const HEALTH_WINDOW_MS: i64 = 300_000;

const ALERT_P95_MS: f64 = 10_000.0;
const ALERT_ERROR_RATE: f64 = 0.10;
const NEAR_ZERO_THROUGHPUT: f64 = 0.01;
const DEGRADED_P95_MS: f64 = 5_000.0;
const DEGRADED_ERROR_RATE: f64 = 0.05;
const UNHEALTHY_ERROR_RATE: f64 = 0.20;

/// Open trace, as stored in the shared store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceRecord {
    /// Trace id.
    pub trace_id: TraceId,
    /// Traced message type.
    pub message_type: String,
    /// Sender's organization.
    pub organization_id: String,
    /// Sender.
    pub user_id: String,
    /// Start, Unix milliseconds.
    pub started_at: i64,
}

/// One completed round trip.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencySample {
    /// Message type.
    pub message_type: String,
    /// Sender's organization.
    pub organization_id: String,
    /// Sender.
    pub user_id: String,
    /// Completion, Unix milliseconds.
    pub timestamp: i64,
    /// Round-trip latency.
    pub latency_ms: i64,
    /// Serialized response size.
    pub payload_bytes: usize,
    /// Whether the round trip succeeded.
    pub success: bool,
    /// Error code of a failed round trip.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

/// Aggregates over a window. Every numeric field is zero when the window
/// holds no samples.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceMetrics {
    /// Window length.
    pub window_ms: i64,
    /// Mean latency.
    pub avg_latency_ms: f64,
    /// 95th percentile latency.
    pub p95_latency_ms: f64,
    /// 99th percentile latency.
    pub p99_latency_ms: f64,
    /// Samples per second.
    pub throughput: f64,
    /// Failed share of samples.
    pub error_rate: f64,
    /// Live connections in scope.
    pub active_connections: usize,
    /// Samples in the window.
    pub sample_count: usize,
    /// Organization scope, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,
}

/// Alert rule.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertRule {
    /// P95 above 10 s.
    HighLatency,
    /// Error rate above 10 %.
    HighErrorRate,
    /// Connections are open but nothing flows.
    NoThroughput,
}

impl AlertRule {
    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HighLatency => "high_latency",
            Self::HighErrorRate => "high_error_rate",
            Self::NoThroughput => "no_throughput",
        }
    }
}

/// Alert severity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Needs a look.
    Warning,
    /// Needs action.
    Critical,
}

/// One fired alert.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    /// Rule that fired.
    pub rule: AlertRule,
    /// Severity.
    pub severity: Severity,
    /// Human-readable summary.
    pub message: String,
    /// Affected organization.
    pub organization_id: String,
    /// Observed value.
    pub value: f64,
    /// Threshold crossed.
    pub threshold: f64,
}

/// Health verdict.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// All checks pass.
    Healthy,
    /// Serving, but slow or erroring.
    Degraded,
    /// Shared store unreachable or failing badly.
    Unhealthy,
}

/// Inputs behind a verdict.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthChecks {
    /// Whether the shared store answered a ping.
    pub shared_store: bool,
    /// P95 over the health window.
    pub p95_latency_ms: f64,
    /// Error rate over the health window.
    pub error_rate: f64,
    /// Live connections on this instance.
    pub active_connections: usize,
}

/// `HEALTH_STATUS` payload and `/health` body.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    /// Verdict.
    pub status: HealthState,
    /// Inputs.
    pub checks: HealthChecks,
    /// Reporting instance.
    pub instance_id: String,
}

/// Latency monitor for one instance.
pub struct Monitor {
    store: Arc<dyn SharedStore>,
    registry: Arc<ConnectionRegistry>,
    instance_id: String,
    trace_ttl: Duration,
    slow_threshold: Duration,
    retention: Duration,
    purge_interval: Duration,
    alert_interval: Duration,
    ring_capacity: usize,
    org_sample_cap: usize,
    pending: DashMap<TraceId, TraceRecord>,
    ring: Mutex<VecDeque<LatencySample>>,
}

impl Monitor {
    /// Monitor configured from `config`.
    pub fn new(store: Arc<dyn SharedStore>, registry: Arc<ConnectionRegistry>, config: &GatewayConfig) -> Self {
        Self {
            store,
            registry,
            instance_id: config.instance_id.clone(),
            trace_ttl: config.trace_ttl,
            slow_threshold: config.slow_threshold,
            retention: config.sample_retention,
            purge_interval: config.purge_interval,
            alert_interval: config.alert_interval,
            ring_capacity: config.ring_capacity,
            org_sample_cap: config.org_sample_cap,
            pending: DashMap::new(),
            ring: Mutex::new(VecDeque::new()),
        }
    }

    /// Open a trace.
    pub async fn trace_start(&self, message_type: &str, organization_id: &str, user_id: &str) -> TraceId {
        let record = TraceRecord {
            trace_id: TraceId::new(),
            message_type: message_type.to_owned(),
            organization_id: organization_id.to_owned(),
            user_id: user_id.to_owned(),
            started_at: clock::now_ms(),
        };
        let trace_id = record.trace_id.clone();
        match serde_json::to_string(&record) {
            Ok(json) => {
                if let Err(e) = self
                    .store
                    .set(&keys::trace(trace_id.as_str()), &json, Some(self.trace_ttl))
                    .await
                {
                    debug!(trace_id = %trace_id, error = %e, "trace record not stored");
                }
            }
            Err(e) => warn!(error = %e, "failed to encode trace record"),
        }
        let _ = self.pending.insert(trace_id.clone(), record);
        trace_id
    }

    /// Close a trace and record its sample. Returns `None` for an unknown
    /// or expired trace.
    pub async fn trace_end(
        &self,
        trace_id: &str,
        success: bool,
        payload_bytes: usize,
        error_code: Option<&str>,
    ) -> Option<LatencySample> {
        let local = self.pending.remove(trace_id).map(|(_, r)| r);
        let key = keys::trace(trace_id);
        let shared = match self.store.get(&key).await {
            Ok(Some(json)) => serde_json::from_str::<TraceRecord>(&json).ok(),
            Ok(None) => None,
            Err(e) => {
                debug!(trace_id, error = %e, "trace record unavailable");
                None
            }
        };
        if shared.is_some() {
            let _ = self.store.del(&key).await;
        }
        let record = shared.or(local)?;

        let now = clock::now_ms();
        let sample = LatencySample {
            message_type: record.message_type,
            organization_id: record.organization_id,
            user_id: record.user_id,
            timestamp: now,
            latency_ms: (now - record.started_at).max(0),
            payload_bytes,
            success,
            error_code: error_code.map(str::to_owned),
        };
        self.record(sample.clone()).await;
        Some(sample)
    }

    /// Record a completed sample.
    pub async fn record(&self, sample: LatencySample) {
        #[allow(clippy::cast_precision_loss)]
        let secs = sample.latency_ms as f64 / 1_000.0;
        histogram!(GATEWAY_MESSAGE_LATENCY_SECONDS, "type" => sample.message_type.clone()).record(secs);

        let slow = u128::try_from(sample.latency_ms).unwrap_or(0) > self.slow_threshold.as_millis();
        if slow || !sample.success {
            warn!(
                message_type = %sample.message_type,
                org_id = %sample.organization_id,
                latency_ms = sample.latency_ms,
                success = sample.success,
                error_code = sample.error_code.as_deref().unwrap_or(""),
                "slow or failed round trip"
            );
        }

        match serde_json::to_string(&sample) {
            Ok(json) => {
                let key = keys::latency_samples(&sample.organization_id);
                if let Err(e) = self.store.lpush_capped(&key, &json, self.org_sample_cap).await {
                    debug!(org_id = %sample.organization_id, error = %e, "latency sample not mirrored");
                }
            }
            Err(e) => warn!(error = %e, "failed to encode latency sample"),
        }

        let mut ring = self.ring.lock();
        ring.push_back(sample);
        while ring.len() > self.ring_capacity {
            let _ = ring.pop_front();
        }
    }

    /// Samples currently held.
    pub fn sample_count(&self) -> usize {
        self.ring.lock().len()
    }

    /// Aggregates over the last `window_ms`.
    pub fn performance_metrics(&self, organization_id: Option<&str>, window_ms: i64) -> PerformanceMetrics {
        self.performance_metrics_at(clock::now_ms(), organization_id, window_ms)
    }

    /// Aggregates over the `window_ms` ending at `now_ms`.
    #[allow(clippy::cast_precision_loss)]
    pub fn performance_metrics_at(
        &self,
        now_ms: i64,
        organization_id: Option<&str>,
        window_ms: i64,
    ) -> PerformanceMetrics {
        let since = now_ms - window_ms;
        let (mut latencies, errors) = {
            let ring = self.ring.lock();
            let mut latencies = Vec::new();
            let mut errors = 0usize;
            for s in ring.iter().filter(|s| {
                s.timestamp >= since
                    && s.timestamp <= now_ms
                    && organization_id.is_none_or(|org| s.organization_id == org)
            }) {
                latencies.push(s.latency_ms);
                if !s.success {
                    errors += 1;
                }
            }
            (latencies, errors)
        };
        latencies.sort_unstable();

        let active_connections = match organization_id {
            Some(org) => self.registry.connections_for_org(org).len(),
            None => self.registry.len(),
        };
        let n = latencies.len();
        let (avg, throughput, error_rate) = if n == 0 {
            (0.0, 0.0, 0.0)
        } else {
            let sum: i64 = latencies.iter().sum();
            let throughput = if window_ms > 0 {
                n as f64 / (window_ms as f64 / 1_000.0)
            } else {
                0.0
            };
            (sum as f64 / n as f64, throughput, errors as f64 / n as f64)
        };

        PerformanceMetrics {
            window_ms,
            avg_latency_ms: avg,
            p95_latency_ms: percentile(&latencies, 0.95),
            p99_latency_ms: percentile(&latencies, 0.99),
            throughput,
            error_rate,
            active_connections,
            sample_count: n,
            organization_id: organization_id.map(str::to_owned),
        }
    }

    /// Alerts for one organization over the last minute.
    pub fn check_alerts(&self, organization_id: &str) -> Vec<Alert> {
        self.check_alerts_at(clock::now_ms(), organization_id)
    }

    /// Alerts for one organization over the minute ending at `now_ms`.
    pub fn check_alerts_at(&self, now_ms: i64, organization_id: &str) -> Vec<Alert> {
        let m = self.performance_metrics_at(now_ms, Some(organization_id), ALERT_WINDOW_MS);
        let alert = |rule, severity, message: String, value, threshold| Alert {
            rule,
            severity,
            message,
            organization_id: organization_id.to_owned(),
            value,
            threshold,
        };

        let mut alerts = Vec::new();
        if m.p95_latency_ms > ALERT_P95_MS {
            alerts.push(alert(
                AlertRule::HighLatency,
                Severity::Warning,
                format!("P95 latency {:.0} ms over the last minute", m.p95_latency_ms),
                m.p95_latency_ms,
                ALERT_P95_MS,
            ));
        }
        if m.error_rate > ALERT_ERROR_RATE {
            alerts.push(alert(
                AlertRule::HighErrorRate,
                Severity::Critical,
                format!("error rate {:.1}% over the last minute", m.error_rate * 100.0),
                m.error_rate,
                ALERT_ERROR_RATE,
            ));
        }
        if m.throughput < NEAR_ZERO_THROUGHPUT && m.active_connections > 0 {
            alerts.push(alert(
                AlertRule::NoThroughput,
                Severity::Warning,
                format!(
                    "{} connection(s) open but no traffic in the last minute",
                    m.active_connections
                ),
                m.throughput,
                NEAR_ZERO_THROUGHPUT,
            ));
        }
        alerts
    }

    /// Health verdict for this instance.
    pub async fn health_status(&self) -> HealthReport {
        let shared_store = self.store.ping().await.is_ok();
        let m = self.performance_metrics(None, HEALTH_WINDOW_MS);
        let status = if !shared_store || m.error_rate > UNHEALTHY_ERROR_RATE {
            HealthState::Unhealthy
        } else if m.p95_latency_ms > DEGRADED_P95_MS || m.error_rate > DEGRADED_ERROR_RATE {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        };
        HealthReport {
            status,
            checks: HealthChecks {
                shared_store,
                p95_latency_ms: m.p95_latency_ms,
                error_rate: m.error_rate,
                active_connections: m.active_connections,
            },
            instance_id: self.instance_id.clone(),
        }
    }

    /// Drop samples older than the retention window. Returns how many.
    pub fn purge(&self) -> usize {
        self.purge_at(clock::now_ms())
    }

    /// [`purge`](Self::purge) relative to `now_ms`.
    pub fn purge_at(&self, now_ms: i64) -> usize {
        let cutoff = now_ms - i64::try_from(self.retention.as_millis()).unwrap_or(i64::MAX);
        let mut ring = self.ring.lock();
        let before = ring.len();
        ring.retain(|s| s.timestamp >= cutoff);
        before - ring.len()
    }

    /// Purge on the configured interval until cancelled.
    pub async fn run_purge(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.purge_interval);
        let _ = ticker.tick().await;
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let purged = self.purge();
                    if purged > 0 {
                        info!(purged, "latency samples purged");
                    }
                }
            }
        }
    }

    /// Evaluate alerts for every organization with live connections and
    /// publish each as a `system.alert` event. Returns how many fired.
    pub async fn publish_alerts(&self, publisher: &EventPublisher) -> usize {
        let mut fired = 0;
        for org in self.registry.organizations() {
            for alert in self.check_alerts(&org) {
                counter!(ALERTS_FIRED_TOTAL, "rule" => alert.rule.as_str()).increment(1);
                warn!(org_id = %org, rule = alert.rule.as_str(), "{}", alert.message);
                let payload = match serde_json::to_value(&alert) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "failed to encode alert");
                        continue;
                    }
                };
                let options = PublishOptions {
                    priority: Priority::High,
                    ..PublishOptions::default()
                };
                match publisher
                    .publish(SYSTEM_ALERT_EVENT, payload, Targeting::tenant(&org), options)
                    .await
                {
                    Ok(_) => fired += 1,
                    Err(e) => warn!(org_id = %org, error = %e, "failed to publish alert"),
                }
            }
        }
        fired
    }

    /// Publish alerts on the configured interval until cancelled.
    pub async fn run_alerts(self: Arc<Self>, publisher: Arc<EventPublisher>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.alert_interval);
        let _ = ticker.tick().await;
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let _ = self.publish_alerts(&publisher).await;
                }
            }
        }
    }
}

/// Nearest-rank percentile of sorted values; zero when empty.
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn percentile(sorted: &[i64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (p * sorted.len() as f64).ceil() as usize;
    let idx = rank.saturating_sub(1).min(sorted.len() - 1);
    sorted[idx] as f64
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
