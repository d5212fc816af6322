//! Prometheus Metrics
//!
//! Observability counters for the relay's connection lifecycle and message
//! flow, exposed through the metrics HTTP endpoint.

use prometheus::{IntCounter, IntGauge, Opts, Registry};
use std::sync::Arc;

/// Relay server metrics.
#[derive(Clone)]
pub struct RelayMetrics {
    /// Registry for all metrics.
    pub registry: Arc<Registry>,

    // Connection lifecycle
    /// Total WebSocket connections accepted.
    pub connections_total: IntCounter,
    /// Current active WebSocket connections.
    pub connections_active: IntGauge,
    /// Connection errors (handshake failures, capacity rejections).
    pub connection_errors: IntCounter,
    /// Connections closed for failed authentication or authorization.
    pub auth_rejections: IntCounter,

    // Message flow
    /// Inbound client frames received.
    pub frames_received: IntCounter,
    /// Inbound frames dropped (empty, unparseable, or failed persistence).
    pub frames_dropped: IntCounter,
    /// Messages published to the broker after persistence.
    pub messages_published: IntCounter,
    /// Broker deliveries forwarded to sockets.
    pub messages_delivered: IntCounter,
    /// History replays sent to newly joined sessions.
    pub history_replays: IntCounter,
}

impl RelayMetrics {
    /// Creates a new metrics instance with all counters registered.
    pub fn new() -> Self {
        let registry = Registry::new();

        let connections_total = IntCounter::with_opts(Opts::new(
            "relay_connections_total",
            "Total WebSocket connections accepted",
        ))
        .unwrap();

        let connections_active = IntGauge::with_opts(Opts::new(
            "relay_connections_active",
            "Current active WebSocket connections",
        ))
        .unwrap();

        let connection_errors = IntCounter::with_opts(Opts::new(
            "relay_connection_errors_total",
            "Total connection errors",
        ))
        .unwrap();

        let auth_rejections = IntCounter::with_opts(Opts::new(
            "relay_auth_rejections_total",
            "Connections closed for failed authentication or authorization",
        ))
        .unwrap();

        let frames_received = IntCounter::with_opts(Opts::new(
            "relay_frames_received_total",
            "Inbound client frames received",
        ))
        .unwrap();

        let frames_dropped = IntCounter::with_opts(Opts::new(
            "relay_frames_dropped_total",
            "Inbound frames dropped",
        ))
        .unwrap();

        let messages_published = IntCounter::with_opts(Opts::new(
            "relay_messages_published_total",
            "Messages published to the broker",
        ))
        .unwrap();

        let messages_delivered = IntCounter::with_opts(Opts::new(
            "relay_messages_delivered_total",
            "Broker deliveries forwarded to sockets",
        ))
        .unwrap();

        let history_replays = IntCounter::with_opts(Opts::new(
            "relay_history_replays_total",
            "History replays sent to newly joined sessions",
        ))
        .unwrap();

        registry
            .register(Box::new(connections_total.clone()))
            .unwrap();
        registry
            .register(Box::new(connections_active.clone()))
            .unwrap();
        registry
            .register(Box::new(connection_errors.clone()))
            .unwrap();
        registry
            .register(Box::new(auth_rejections.clone()))
            .unwrap();
        registry
            .register(Box::new(frames_received.clone()))
            .unwrap();
        registry
            .register(Box::new(frames_dropped.clone()))
            .unwrap();
        registry
            .register(Box::new(messages_published.clone()))
            .unwrap();
        registry
            .register(Box::new(messages_delivered.clone()))
            .unwrap();
        registry
            .register(Box::new(history_replays.clone()))
            .unwrap();

        RelayMetrics {
            registry: Arc::new(registry),
            connections_total,
            connections_active,
            connection_errors,
            auth_rejections,
            frames_received,
            frames_dropped,
            messages_published,
            messages_delivered,
            history_replays,
        }
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap()
    }
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_contains_registered_metrics() {
        let metrics = RelayMetrics::new();
        metrics.connections_total.inc();
        metrics.messages_published.inc_by(3);

        let text = metrics.encode();
        assert!(text.contains("relay_connections_total 1"));
        assert!(text.contains("relay_messages_published_total 3"));
    }
}
