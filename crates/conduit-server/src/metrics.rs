//! Prometheus metrics recorder and `/metrics` endpoint rendering.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the handle used to render `/metrics`. Fails if a global recorder
/// is already installed.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

// Metric name constants to avoid typos across modules.

/// WebSocket connections admitted (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// Live WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// WebSocket disconnections (counter, labels: reason).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Connections removed by the heartbeat sweep (counter).
pub const WS_STALE_DISCONNECTIONS_TOTAL: &str = "ws_stale_disconnections_total";
/// Inbound protocol messages (counter, labels: type).
pub const GATEWAY_MESSAGES_TOTAL: &str = "gateway_messages_total";
/// Rejected inbound messages (counter, labels: code).
pub const GATEWAY_MESSAGE_ERRORS_TOTAL: &str = "gateway_message_errors_total";
/// Round-trip latency in seconds (histogram, labels: type).
pub const GATEWAY_MESSAGE_LATENCY_SECONDS: &str = "gateway_message_latency_seconds";
/// Publications accepted by `publish` (counter, labels: source).
pub const EVENTS_PUBLISHED_TOTAL: &str = "events_published_total";
/// Event frames handed to a connection's send queue (counter).
pub const EVENTS_DELIVERED_TOTAL: &str = "events_delivered_total";
/// Event frames dropped because a send queue was full or closed (counter).
pub const EVENTS_DROPPED_TOTAL: &str = "events_dropped_total";
/// Rate-limit rejections (counter, labels: kind).
pub const RATE_LIMIT_REJECTIONS_TOTAL: &str = "rate_limit_rejections_total";
/// Alerts raised by the alert loop (counter, labels: rule).
pub const ALERTS_FIRED_TOTAL: &str = "alerts_fired_total";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_without_global_install() {
        // Build a recorder + handle (no global install to avoid test conflicts).
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let output = render(&handle);
        assert!(output.is_empty() || output.contains('#') || output.contains('\n'));
    }

    #[test]
    fn metric_constants_are_snake_case() {
        let names = [
            WS_CONNECTIONS_TOTAL,
            WS_CONNECTIONS_ACTIVE,
            WS_DISCONNECTIONS_TOTAL,
            WS_STALE_DISCONNECTIONS_TOTAL,
            GATEWAY_MESSAGES_TOTAL,
            GATEWAY_MESSAGE_ERRORS_TOTAL,
            GATEWAY_MESSAGE_LATENCY_SECONDS,
            EVENTS_PUBLISHED_TOTAL,
            EVENTS_DELIVERED_TOTAL,
            EVENTS_DROPPED_TOTAL,
            RATE_LIMIT_REJECTIONS_TOTAL,
            ALERTS_FIRED_TOTAL,
        ];
        for name in names {
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "metric name '{name}' must be snake_case"
            );
        }
    }
}
