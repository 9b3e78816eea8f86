//! Runtime configuration for the gateway server.
//!
//! [`GatewayConfig`] is the resolved, duration-typed view of
//! [`ConduitSettings`]. Components take the fields they need from it.

use std::time::Duration;

use conduit_settings::ConduitSettings;

/// Resolved gateway configuration.
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    /// Host to bind.
    pub host: String,
    /// Port to bind (`0` for auto-assign).
    pub port: u16,
    /// Identifier of this instance on the broker.
    pub instance_id: String,
    /// Maximum concurrent connections on this instance.
    pub max_connections: usize,
    /// Max WebSocket frame size in bytes.
    pub max_message_bytes: usize,
    /// Per-connection outbound queue depth.
    pub send_queue_capacity: usize,
    /// How often the stale-connection sweep runs.
    pub sweep_interval: Duration,
    /// Silence after which a connection is force-removed.
    pub heartbeat_timeout: Duration,
    /// Interval between server Ping frames.
    pub ping_interval: Duration,
    /// TTL of connection records in the shared store.
    pub connection_record_ttl: Duration,
    /// HS256 secret for bearer tokens.
    pub jwt_secret: String,
    /// Expected `iss` claim.
    pub jwt_issuer: Option<String>,
    /// HMAC secret for envelope signatures.
    pub signing_secret: Option<String>,
    /// Reject unsigned inbound messages.
    pub require_signed_messages: bool,
    /// TTL of open trace records.
    pub trace_ttl: Duration,
    /// Round trips slower than this are logged.
    pub slow_threshold: Duration,
    /// Latency samples older than this are purged.
    pub sample_retention: Duration,
    /// How often the purge runs.
    pub purge_interval: Duration,
    /// In-memory latency ring capacity.
    pub ring_capacity: usize,
    /// Cap of the per-organization sample list in the shared store.
    pub org_sample_cap: usize,
    /// How often alerts are evaluated.
    pub alert_interval: Duration,
    /// Delay between replayed events.
    pub replay_pacing: Duration,
    /// Replay limit when the request does not set one.
    pub replay_default_max_events: usize,
    /// Streaming sessions idle longer than this are removed.
    pub stream_idle_timeout: Duration,
    /// How often the stream sweep runs.
    pub stream_sweep_interval: Duration,
}

impl GatewayConfig {
    /// Resolve settings. A missing instance id gets a generated one.
    pub fn from_settings(settings: &ConduitSettings) -> Self {
        let hb = &settings.heartbeat;
        let mon = &settings.monitoring;
        Self {
            host: settings.server.host.clone(),
            port: settings.server.port,
            instance_id: settings
                .instance_id
                .clone()
                .unwrap_or_else(|| format!("gw-{}", conduit_core::EventId::new().as_str().trim_start_matches("evt_"))),
            max_connections: settings.server.max_connections,
            max_message_bytes: settings.server.max_message_bytes,
            send_queue_capacity: settings.server.send_queue_capacity.max(1),
            sweep_interval: Duration::from_secs(hb.sweep_interval_secs.max(1)),
            heartbeat_timeout: Duration::from_secs(hb.timeout_secs),
            ping_interval: Duration::from_secs(hb.ping_interval_secs.max(1)),
            connection_record_ttl: Duration::from_secs(hb.connection_record_ttl_secs),
            jwt_secret: settings.auth.jwt_secret.clone(),
            jwt_issuer: settings.auth.jwt_issuer.clone(),
            signing_secret: settings.auth.signing_secret.clone(),
            require_signed_messages: settings.auth.require_signed_messages,
            trace_ttl: Duration::from_secs(mon.trace_ttl_secs),
            slow_threshold: Duration::from_millis(mon.slow_threshold_ms),
            sample_retention: Duration::from_secs(mon.sample_retention_hours * 3600),
            purge_interval: Duration::from_secs(mon.purge_interval_secs.max(1)),
            ring_capacity: mon.ring_capacity.max(1),
            org_sample_cap: mon.org_sample_cap,
            alert_interval: Duration::from_secs(mon.alert_interval_secs.max(1)),
            replay_pacing: Duration::from_millis(settings.replay.pacing_ms),
            replay_default_max_events: settings.replay.default_max_events,
            stream_idle_timeout: Duration::from_secs(settings.streaming.idle_timeout_secs),
            stream_sweep_interval: Duration::from_secs(settings.streaming.sweep_interval_secs.max(1)),
        }
    }
}

impl Default for GatewayConfig {
    /// Compiled defaults bound to `127.0.0.1:0`.
    fn default() -> Self {
        let mut config = Self::from_settings(&ConduitSettings::default());
        config.host = "127.0.0.1".into();
        config.port = 0;
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_binds_loopback_auto_port() {
        let cfg = GatewayConfig::default();
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.port, 0);
    }

    #[test]
    fn default_heartbeat_timings() {
        let cfg = GatewayConfig::default();
        assert_eq!(cfg.sweep_interval, Duration::from_secs(30));
        assert_eq!(cfg.heartbeat_timeout, Duration::from_secs(60));
        assert_eq!(cfg.connection_record_ttl, Duration::from_secs(120));
    }

    #[test]
    fn default_monitoring_windows() {
        let cfg = GatewayConfig::default();
        assert_eq!(cfg.trace_ttl, Duration::from_secs(300));
        assert_eq!(cfg.slow_threshold, Duration::from_secs(5));
        assert_eq!(cfg.sample_retention, Duration::from_secs(24 * 3600));
        assert_eq!(cfg.replay_pacing, Duration::from_millis(10));
    }

    #[test]
    fn instance_id_from_settings() {
        let settings = ConduitSettings {
            instance_id: Some("gw-east-1".into()),
            ..ConduitSettings::default()
        };
        assert_eq!(GatewayConfig::from_settings(&settings).instance_id, "gw-east-1");
    }

    #[test]
    fn generated_instance_ids_differ() {
        let a = GatewayConfig::default();
        let b = GatewayConfig::default();
        assert!(a.instance_id.starts_with("gw-"));
        assert_ne!(a.instance_id, b.instance_id);
    }
}
