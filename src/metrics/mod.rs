//! Prometheus metrics for Matchfeed
//!
//! Exposes metrics at /metrics endpoint for monitoring and observability.

use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

mod server;

pub use server::MetricsServer;

/// All Matchfeed metrics in one place
#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,

    // Connection metrics
    pub connections_total: IntCounter,
    pub connections_current: IntGauge,
    pub connections_maximum: IntGauge,
    pub connections_rejected_total: IntCounterVec,
    pub liveness_evictions_total: IntCounter,

    // Subscription metrics
    pub subscriptions_current: IntGauge,
    pub topics_current: IntGauge,

    // Message metrics
    pub messages_sent_total: IntCounterVec,
    pub deliveries_dropped_total: IntCounterVec,
    pub malformed_messages_total: IntCounter,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let connections_total = IntCounter::with_opts(Opts::new(
            "matchfeed_connections_total",
            "Total number of admitted connections since startup",
        ))?;

        let connections_current = IntGauge::with_opts(Opts::new(
            "matchfeed_connections_current",
            "Current number of registered connections",
        ))?;

        let connections_maximum = IntGauge::with_opts(Opts::new(
            "matchfeed_connections_maximum",
            "Maximum concurrent connections since startup",
        ))?;

        let connections_rejected_total = IntCounterVec::new(
            Opts::new(
                "matchfeed_connections_rejected_total",
                "Connections rejected by admission control",
            ),
            &["stage", "reason"],
        )?;

        let liveness_evictions_total = IntCounter::with_opts(Opts::new(
            "matchfeed_liveness_evictions_total",
            "Connections terminated after missing two liveness probes",
        ))?;

        let subscriptions_current = IntGauge::with_opts(Opts::new(
            "matchfeed_subscriptions_current",
            "Current number of (connection, match) subscriptions",
        ))?;

        let topics_current = IntGauge::with_opts(Opts::new(
            "matchfeed_topics_current",
            "Current number of matches with at least one subscriber",
        ))?;

        let messages_sent_total = IntCounterVec::new(
            Opts::new(
                "matchfeed_messages_sent_total",
                "Messages queued for delivery by type",
            ),
            &["type"],
        )?;

        let deliveries_dropped_total = IntCounterVec::new(
            Opts::new(
                "matchfeed_deliveries_dropped_total",
                "Deliveries abandoned and the connection torn down",
            ),
            &["reason"],
        )?;

        let malformed_messages_total = IntCounter::with_opts(Opts::new(
            "matchfeed_malformed_messages_total",
            "Inbound messages answered with an error reply",
        ))?;

        registry.register(Box::new(connections_total.clone()))?;
        registry.register(Box::new(connections_current.clone()))?;
        registry.register(Box::new(connections_maximum.clone()))?;
        registry.register(Box::new(connections_rejected_total.clone()))?;
        registry.register(Box::new(liveness_evictions_total.clone()))?;
        registry.register(Box::new(subscriptions_current.clone()))?;
        registry.register(Box::new(topics_current.clone()))?;
        registry.register(Box::new(messages_sent_total.clone()))?;
        registry.register(Box::new(deliveries_dropped_total.clone()))?;
        registry.register(Box::new(malformed_messages_total.clone()))?;

        Ok(Metrics {
            registry,
            connections_total,
            connections_current,
            connections_maximum,
            connections_rejected_total,
            liveness_evictions_total,
            subscriptions_current,
            topics_current,
            messages_sent_total,
            deliveries_dropped_total,
            malformed_messages_total,
        })
    }

    pub fn connection_opened(&self) {
        self.connections_total.inc();
        self.connections_current.inc();
        let current = self.connections_current.get();
        if current > self.connections_maximum.get() {
            self.connections_maximum.set(current);
        }
    }

    pub fn connection_closed(&self) {
        self.connections_current.dec();
    }

    pub fn connection_rejected(&self, stage: &str, reason: &str) {
        self.connections_rejected_total
            .with_label_values(&[stage, reason])
            .inc();
    }

    pub fn liveness_evicted(&self) {
        self.liveness_evictions_total.inc();
    }

    pub fn subscriptions_added(&self, count: usize) {
        self.subscriptions_current.add(count as i64);
    }

    pub fn subscriptions_removed(&self, count: usize) {
        self.subscriptions_current.sub(count as i64);
    }

    pub fn set_topics(&self, count: usize) {
        self.topics_current.set(count as i64);
    }

    pub fn message_sent(&self, msg_type: &str) {
        self.messages_sent_total.with_label_values(&[msg_type]).inc();
    }

    pub fn delivery_dropped(&self, reason: &str) {
        self.deliveries_dropped_total
            .with_label_values(&[reason])
            .inc();
    }

    pub fn malformed_message(&self) {
        self.malformed_messages_total.inc();
    }
}
