//! Metrics collection and export for Pulse Chat.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use pulse_chat_core::HubStats;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "pulse_chat_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "pulse_chat_connections_active";
    pub const FRAMES_TOTAL: &str = "pulse_chat_frames_total";
    pub const FRAMES_BYTES: &str = "pulse_chat_frames_bytes";
    pub const COMMANDS_TOTAL: &str = "pulse_chat_commands_total";
    pub const COMMAND_LATENCY_SECONDS: &str = "pulse_chat_command_latency_seconds";
    pub const CHANNELS_ACTIVE: &str = "pulse_chat_channels_active";
    pub const HUB_DROPPED_CONNECTIONS: &str = "pulse_chat_hub_dropped_connections";
    pub const HUB_DROPPED_FRAMES: &str = "pulse_chat_hub_dropped_frames";
    pub const ERRORS_TOTAL: &str = "pulse_chat_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(names::FRAMES_TOTAL, "Total number of WebSocket frames");
    metrics::describe_counter!(names::FRAMES_BYTES, "Total bytes of WebSocket frames");
    metrics::describe_counter!(names::COMMANDS_TOTAL, "Total number of client commands");
    metrics::describe_histogram!(
        names::COMMAND_LATENCY_SECONDS,
        "Client command processing latency in seconds"
    );
    metrics::describe_gauge!(
        names::CHANNELS_ACTIVE,
        "Channels with at least one live connection"
    );
    metrics::describe_gauge!(
        names::HUB_DROPPED_CONNECTIONS,
        "Connections dropped by the hub for falling behind"
    );
    metrics::describe_gauge!(
        names::HUB_DROPPED_FRAMES,
        "Broadcasts dropped because a channel queue was full"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the exporter cannot be installed.
pub fn start_metrics_server(port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a WebSocket frame.
pub fn record_frame(bytes: usize, direction: &'static str) {
    counter!(names::FRAMES_TOTAL, "direction" => direction).increment(1);
    counter!(names::FRAMES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record a handled client command.
pub fn record_command(command: &'static str, seconds: f64) {
    counter!(names::COMMANDS_TOTAL, "command" => command).increment(1);
    histogram!(names::COMMAND_LATENCY_SECONDS, "command" => command).record(seconds);
}

/// Publish hub counters.
pub fn record_hub_stats(stats: &HubStats) {
    gauge!(names::CHANNELS_ACTIVE).set(stats.channel_count as f64);
    gauge!(names::HUB_DROPPED_CONNECTIONS).set(stats.dropped_connections as f64);
    gauge!(names::HUB_DROPPED_FRAMES).set(stats.dropped_frames as f64);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}
