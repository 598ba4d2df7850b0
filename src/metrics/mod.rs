//! Prometheus metrics for the bridge
//!
//! Exposes session and relay counters at the /metrics endpoint.

use std::time::Duration;

use prometheus::core::Collector;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry};

mod server;

pub use server::MetricsServer;

/// Label for messages flowing from the broker to a socket peer
pub const BROKER_TO_SOCKET: &str = "broker_to_socket";
/// Label for messages flowing from a socket peer to the broker
pub const SOCKET_TO_BROKER: &str = "socket_to_broker";

/// All bridge metrics in one place
#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,

    // Session metrics
    pub sessions_total: IntCounter,
    pub sessions_current: IntGauge,
    pub sessions_maximum: IntGauge,
    pub session_errors_total: IntCounterVec,

    // Handshake rejections (bad topic, capacity)
    pub connections_rejected_total: IntCounterVec,

    // Relay metrics, labelled by direction
    pub messages_relayed_total: IntCounterVec,
    pub bytes_relayed_total: IntCounterVec,
    pub frames_malformed_total: IntCounter,
    pub messages_dropped_total: IntCounterVec,

    // Time from session start to the first relayable state
    pub session_setup_duration: Histogram,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let sessions_total = IntCounter::with_opts(Opts::new(
            "mqttws_sessions_total",
            "Total bridge sessions since startup",
        ))
        .unwrap();

        let sessions_current = IntGauge::with_opts(Opts::new(
            "mqttws_sessions_current",
            "Current number of live bridge sessions",
        ))
        .unwrap();

        let sessions_maximum = IntGauge::with_opts(Opts::new(
            "mqttws_sessions_maximum",
            "Maximum concurrent sessions since startup",
        ))
        .unwrap();

        let session_errors_total = IntCounterVec::new(
            Opts::new(
                "mqttws_session_errors_total",
                "Sessions closed by an error, by error kind",
            ),
            &["kind"],
        )
        .unwrap();

        let connections_rejected_total = IntCounterVec::new(
            Opts::new(
                "mqttws_connections_rejected_total",
                "Upgrade requests refused before a session was created",
            ),
            &["reason"],
        )
        .unwrap();

        let messages_relayed_total = IntCounterVec::new(
            Opts::new("mqttws_messages_relayed_total", "Messages relayed"),
            &["direction"],
        )
        .unwrap();

        let bytes_relayed_total = IntCounterVec::new(
            Opts::new("mqttws_bytes_relayed_total", "Payload bytes relayed"),
            &["direction"],
        )
        .unwrap();

        let frames_malformed_total = IntCounter::with_opts(Opts::new(
            "mqttws_frames_malformed_total",
            "Socket frames dropped because they could not be relayed",
        ))
        .unwrap();

        let messages_dropped_total = IntCounterVec::new(
            Opts::new(
                "mqttws_messages_dropped_total",
                "Messages dropped because the receiving side could not keep up",
            ),
            &["direction"],
        )
        .unwrap();

        let session_setup_duration = Histogram::with_opts(
            HistogramOpts::new(
                "mqttws_session_setup_duration_seconds",
                "Time from accept until the broker subscription is acknowledged",
            )
            .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        )
        .unwrap();

        let collectors: Vec<Box<dyn Collector>> = vec![
            Box::new(sessions_total.clone()),
            Box::new(sessions_current.clone()),
            Box::new(sessions_maximum.clone()),
            Box::new(session_errors_total.clone()),
            Box::new(connections_rejected_total.clone()),
            Box::new(messages_relayed_total.clone()),
            Box::new(bytes_relayed_total.clone()),
            Box::new(frames_malformed_total.clone()),
            Box::new(messages_dropped_total.clone()),
            Box::new(session_setup_duration.clone()),
        ];
        for collector in collectors {
            registry.register(collector).unwrap();
        }

        Metrics {
            registry,
            sessions_total,
            sessions_current,
            sessions_maximum,
            session_errors_total,
            connections_rejected_total,
            messages_relayed_total,
            bytes_relayed_total,
            frames_malformed_total,
            messages_dropped_total,
            session_setup_duration,
        }
    }

    pub fn session_opened(&self) {
        self.sessions_total.inc();
        self.sessions_current.inc();
        let current = self.sessions_current.get();
        if current > self.sessions_maximum.get() {
            self.sessions_maximum.set(current);
        }
    }

    pub fn session_closed(&self) {
        self.sessions_current.dec();
    }

    pub fn session_error(&self, kind: &str) {
        self.session_errors_total.with_label_values(&[kind]).inc();
    }

    pub fn session_ready(&self, elapsed: Duration) {
        self.session_setup_duration.observe(elapsed.as_secs_f64());
    }

    pub fn connection_rejected(&self, reason: &str) {
        self.connections_rejected_total
            .with_label_values(&[reason])
            .inc();
    }

    pub fn message_relayed(&self, direction: &str, bytes: usize) {
        self.messages_relayed_total
            .with_label_values(&[direction])
            .inc();
        self.bytes_relayed_total
            .with_label_values(&[direction])
            .inc_by(bytes as u64);
    }

    pub fn frame_malformed(&self) {
        self.frames_malformed_total.inc();
    }

    pub fn message_dropped(&self, direction: &str) {
        self.messages_dropped_total
            .with_label_values(&[direction])
            .inc();
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use prometheus::Encoder;

    use super::*;

    #[test]
    fn test_session_gauges() {
        let metrics = Metrics::new();
        metrics.session_opened();
        metrics.session_opened();
        metrics.session_closed();

        assert_eq!(metrics.sessions_total.get(), 2);
        assert_eq!(metrics.sessions_current.get(), 1);
        assert_eq!(metrics.sessions_maximum.get(), 2);
    }

    #[test]
    fn test_relay_counters_by_direction() {
        let metrics = Metrics::new();
        metrics.message_relayed(SOCKET_TO_BROKER, 10);
        metrics.message_relayed(SOCKET_TO_BROKER, 5);
        metrics.message_relayed(BROKER_TO_SOCKET, 3);

        let up = metrics
            .messages_relayed_total
            .with_label_values(&[SOCKET_TO_BROKER]);
        let bytes_up = metrics
            .bytes_relayed_total
            .with_label_values(&[SOCKET_TO_BROKER]);
        assert_eq!(up.get(), 2);
        assert_eq!(bytes_up.get(), 15);
        assert_eq!(
            metrics
                .messages_relayed_total
                .with_label_values(&[BROKER_TO_SOCKET])
                .get(),
            1
        );
    }

    #[test]
    fn test_registry_exports_names() {
        let metrics = Metrics::new();
        metrics.connection_rejected("malformed_request");
        metrics.message_dropped(BROKER_TO_SOCKET);

        let mut buffer = Vec::new();
        prometheus::TextEncoder::new()
            .encode(&metrics.registry.gather(), &mut buffer)
            .unwrap();
        let text = String::from_utf8(buffer).unwrap();

        assert!(text.contains("mqttws_connections_rejected_total{reason=\"malformed_request\"} 1"));
        assert!(text.contains("mqttws_sessions_total 0"));
        assert!(text.contains("mqttws_messages_dropped_total{direction=\"broker_to_socket\"} 1"));
    }
}
