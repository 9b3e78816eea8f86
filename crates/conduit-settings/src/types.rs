//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]` so a settings
//! file only needs the keys it wants to change. Each type implements
//! [`Default`] with production values.

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings for a gateway instance.
///
/// ```json
/// {
///   "server": { "port": 9000 },
///   "auth": { "jwtSecret": "..." }
/// }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConduitSettings {
    /// Identifies this process among the gateway fleet. Generated at startup
    /// when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    /// Default log filter directive.
    pub log_level: String,
    /// Emit JSON log lines.
    pub log_json: bool,
    /// Network listener settings.
    pub server: ServerSettings,
    /// Liveness sweep settings.
    pub heartbeat: HeartbeatSettings,
    /// Audit store settings.
    pub store: StoreSettings,
    /// Handshake and message signing settings.
    pub auth: AuthSettings,
    /// Latency tracing, retention and alerting.
    pub monitoring: MonitoringSettings,
    /// Event-log replay pacing.
    pub replay: ReplaySettings,
    /// Streaming session lifecycle.
    pub streaming: StreamingSettings,
}

impl Default for ConduitSettings {
    fn default() -> Self {
        Self {
            instance_id: None,
            log_level: "info".into(),
            log_json: false,
            server: ServerSettings::default(),
            heartbeat: HeartbeatSettings::default(),
            store: StoreSettings::default(),
            auth: AuthSettings::default(),
            monitoring: MonitoringSettings::default(),
            replay: ReplaySettings::default(),
            streaming: StreamingSettings::default(),
        }
    }
}

impl ConduitSettings {
    /// Cross-field sanity checks that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat.timeout_secs < self.heartbeat.sweep_interval_secs {
            return Err(SettingsError::InvalidValue(format!(
                "heartbeat.timeoutSecs ({}) must be >= heartbeat.sweepIntervalSecs ({})",
                self.heartbeat.timeout_secs, self.heartbeat.sweep_interval_secs
            )));
        }
        if self.heartbeat.connection_record_ttl_secs < self.heartbeat.timeout_secs {
            return Err(SettingsError::InvalidValue(
                "heartbeat.connectionRecordTtlSecs must outlive heartbeat.timeoutSecs".into(),
            ));
        }
        if self.server.send_queue_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "server.sendQueueCapacity must be > 0".into(),
            ));
        }
        if self.monitoring.ring_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "monitoring.ringCapacity must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Network listener settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port (`0` picks a free port).
    pub port: u16,
    /// Maximum concurrent connections on this instance.
    pub max_connections: usize,
    /// Largest accepted WebSocket frame in bytes.
    pub max_message_bytes: usize,
    /// Per-connection outbound queue depth before messages are dropped.
    pub send_queue_capacity: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8790,
            max_connections: 10_000,
            max_message_bytes: 2 * 1024 * 1024,
            send_queue_capacity: 1024,
        }
    }
}

/// Liveness sweep settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeartbeatSettings {
    /// How often the stale-connection sweep runs.
    pub sweep_interval_secs: u64,
    /// A connection silent for longer than this is force-removed.
    pub timeout_secs: u64,
    /// Interval between server-initiated Ping frames.
    pub ping_interval_secs: u64,
    /// TTL of the connection record in the shared store.
    pub connection_record_ttl_secs: u64,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 30,
            timeout_secs: 60,
            ping_interval_secs: 30,
            connection_record_ttl_secs: 120,
        }
    }
}

/// Audit store settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreSettings {
    /// Path of the `SQLite` audit database. `None` keeps it in memory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_path: Option<String>,
    /// Connection pool size.
    pub pool_size: u32,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            db_path: None,
            pool_size: 8,
        }
    }
}

/// Handshake and message signing settings.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthSettings {
    /// HS256 secret used to verify bearer tokens.
    pub jwt_secret: String,
    /// Expected `iss` claim, if enforced.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwt_issuer: Option<String>,
    /// HMAC secret for envelope signatures. Signing is off when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signing_secret: Option<String>,
    /// Reject inbound messages without a valid signature.
    pub require_signed_messages: bool,
}

/// Latency tracing, retention and alerting.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MonitoringSettings {
    /// TTL of an open trace record in the shared store.
    pub trace_ttl_secs: u64,
    /// Round trips slower than this are logged at warn.
    pub slow_threshold_ms: u64,
    /// Samples older than this are purged.
    pub sample_retention_hours: u64,
    /// How often the purge sweep runs.
    pub purge_interval_secs: u64,
    /// In-memory sample ring size.
    pub ring_capacity: usize,
    /// Per-organization sample list cap in the shared store.
    pub org_sample_cap: usize,
    /// How often alert rules are evaluated.
    pub alert_interval_secs: u64,
}

impl Default for MonitoringSettings {
    fn default() -> Self {
        Self {
            trace_ttl_secs: 300,
            slow_threshold_ms: 5_000,
            sample_retention_hours: 24,
            purge_interval_secs: 3_600,
            ring_capacity: 10_000,
            org_sample_cap: 1_000,
            alert_interval_secs: 60,
        }
    }
}

/// Event-log replay pacing.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReplaySettings {
    /// Delay between consecutive replayed events.
    pub pacing_ms: u64,
    /// Limit applied when the request does not give one.
    pub default_max_events: usize,
}

impl Default for ReplaySettings {
    fn default() -> Self {
        Self {
            pacing_ms: 10,
            default_max_events: 1_000,
        }
    }
}

/// Streaming session lifecycle.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamingSettings {
    /// Sessions idle for longer than this are swept.
    pub idle_timeout_secs: u64,
    /// How often the idle sweep runs.
    pub sweep_interval_secs: u64,
}

impl Default for StreamingSettings {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 1_800,
            sweep_interval_secs: 60,
        }
    }
}
