//! Metrics collection and export for Canopy.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use anyhow::{Context, Result};
use canopy_protocol::PacketKind;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "canopy_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "canopy_connections_active";
    pub const PACKETS_TOTAL: &str = "canopy_packets_total";
    pub const DELIVERIES_TOTAL: &str = "canopy_deliveries_total";
    pub const INVALID_FRAMES_TOTAL: &str = "canopy_invalid_frames_total";
    pub const CHANNELS_ACTIVE: &str = "canopy_channels_active";
    pub const SUBSCRIPTIONS_TOTAL: &str = "canopy_subscriptions_total";
    pub const ROUTE_SECONDS: &str = "canopy_route_seconds";
    pub const ERRORS_TOTAL: &str = "canopy_errors_total";
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
    metrics::describe_counter!(names::PACKETS_TOTAL, "Packets read and written, by kind");
    metrics::describe_counter!(
        names::DELIVERIES_TOTAL,
        "Packets handed to subscribers by the router"
    );
    metrics::describe_counter!(
        names::INVALID_FRAMES_TOTAL,
        "Chunks that could not be decoded"
    );
    metrics::describe_gauge!(names::CHANNELS_ACTIVE, "Current number of channel nodes");
    metrics::describe_counter!(
        names::SUBSCRIPTIONS_TOTAL,
        "Total number of channel subscriptions"
    );
    metrics::describe_histogram!(names::ROUTE_SECONDS, "Time spent routing one packet");
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the exporter cannot be installed.
pub fn start_metrics_server(port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

fn kind_label(kind: PacketKind) -> &'static str {
    match kind {
        PacketKind::Message => "message",
        PacketKind::Subscribe => "subscribe",
        PacketKind::Unsubscribe => "unsubscribe",
        PacketKind::Meta => "meta",
        PacketKind::Error => "error",
    }
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

/// Record a packet read from (`inbound`) or queued to (`outbound`) a peer.
pub fn record_packet(kind: PacketKind, direction: &'static str) {
    counter!(names::PACKETS_TOTAL, "kind" => kind_label(kind), "direction" => direction)
        .increment(1);
}

/// Record how many nodes a routed message reached.
pub fn record_deliveries(count: usize) {
    counter!(names::DELIVERIES_TOTAL).increment(count as u64);
}

/// Record an undecodable chunk.
pub fn record_invalid_frame() {
    counter!(names::INVALID_FRAMES_TOTAL).increment(1);
}

/// Record routing time.
pub fn record_route_time(seconds: f64) {
    histogram!(names::ROUTE_SECONDS).record(seconds);
}

/// Record a subscription.
pub fn record_subscription() {
    counter!(names::SUBSCRIPTIONS_TOTAL).increment(1);
}

/// Update active channel count.
pub fn set_active_channels(count: usize) {
    gauge!(names::CHANNELS_ACTIVE).set(count as f64);
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_guard() {
        // No recorder is installed, so this only exercises the calls.
        let _guard = ConnectionMetricsGuard::new();
        record_packet(PacketKind::Message, "inbound");
        record_deliveries(3);
    }

    #[test]
    fn test_kind_labels_distinct() {
        let labels = [
            PacketKind::Message,
            PacketKind::Subscribe,
            PacketKind::Unsubscribe,
            PacketKind::Meta,
            PacketKind::Error,
        ]
        .map(kind_label);
        let unique: std::collections::HashSet<_> = labels.iter().collect();
        assert_eq!(unique.len(), labels.len());
    }
}
