//! Prometheus metrics for the delivery core
//!
//! Exposes metrics at /metrics endpoint for monitoring and observability.
//! Useful for Grafana dashboards, alerts, and capacity planning.

use prometheus::{IntCounter, IntGauge, IntGaugeVec, Opts, Registry};

use crate::store::MessageStore;

mod server;

pub use server::MetricsServer;

/// All delivery-core metrics in one place
#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,

    // Admission metrics
    pub messages_dropped_total: IntCounter,
    pub messages_expired_total: IntCounter,

    // Message store metrics
    pub store_messages_current: IntGauge,
    pub store_bytes_current: IntGauge,

    // Lane metrics, labelled by direction ("in" / "out")
    pub inflight_messages: IntGaugeVec,
    pub queued_messages: IntGaugeVec,

    // Handshake metrics
    pub qos1_completed_total: IntCounter,
    pub qos2_completed_total: IntCounter,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let messages_dropped_total = IntCounter::with_opts(Opts::new(
            "embermq_messages_dropped_total",
            "Total messages refused by admission control since startup",
        ))
        .unwrap();

        let messages_expired_total = IntCounter::with_opts(Opts::new(
            "embermq_messages_expired_total",
            "Total delivery records released by message expiry",
        ))
        .unwrap();

        let store_messages_current = IntGauge::with_opts(Opts::new(
            "embermq_store_messages_current",
            "Current number of messages in the shared store",
        ))
        .unwrap();

        let store_bytes_current = IntGauge::with_opts(Opts::new(
            "embermq_store_bytes_current",
            "Current payload bytes held by the shared store",
        ))
        .unwrap();

        let inflight_messages = IntGaugeVec::new(
            Opts::new(
                "embermq_inflight_messages",
                "Current inflight delivery records by direction",
            ),
            &["direction"],
        )
        .unwrap();

        let queued_messages = IntGaugeVec::new(
            Opts::new(
                "embermq_queued_messages",
                "Current queued delivery records by direction",
            ),
            &["direction"],
        )
        .unwrap();

        let qos1_completed_total = IntCounter::with_opts(Opts::new(
            "embermq_qos1_completed_total",
            "Total QoS 1 deliveries completed by PUBACK",
        ))
        .unwrap();

        let qos2_completed_total = IntCounter::with_opts(Opts::new(
            "embermq_qos2_completed_total",
            "Total QoS 2 deliveries completed by PUBCOMP",
        ))
        .unwrap();

        // Register all metrics
        registry
            .register(Box::new(messages_dropped_total.clone()))
            .unwrap();
        registry
            .register(Box::new(messages_expired_total.clone()))
            .unwrap();
        registry
            .register(Box::new(store_messages_current.clone()))
            .unwrap();
        registry
            .register(Box::new(store_bytes_current.clone()))
            .unwrap();
        registry
            .register(Box::new(inflight_messages.clone()))
            .unwrap();
        registry
            .register(Box::new(queued_messages.clone()))
            .unwrap();
        registry
            .register(Box::new(qos1_completed_total.clone()))
            .unwrap();
        registry
            .register(Box::new(qos2_completed_total.clone()))
            .unwrap();

        Metrics {
            registry,
            messages_dropped_total,
            messages_expired_total,
            store_messages_current,
            store_bytes_current,
            inflight_messages,
            queued_messages,
            qos1_completed_total,
            qos2_completed_total,
        }
    }

    // Helper methods for common operations

    /// Refresh the store gauges (housekeeping tick)
    pub fn observe_store(&self, store: &MessageStore) {
        self.store_messages_current.set(store.len() as i64);
        self.store_bytes_current.set(store.bytes() as i64);
    }

    /// Set the aggregated lane gauges for one direction
    pub fn set_lane_totals(&self, direction: &str, inflight: usize, queued: usize) {
        self.inflight_messages
            .with_label_values(&[direction])
            .set(inflight as i64);
        self.queued_messages
            .with_label_values(&[direction])
            .set(queued as i64);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;

    use crate::protocol::{MessageOrigin, QoS};
    use crate::store::BaseMessage;

    use super::*;

    #[test]
    fn test_store_gauges_track_contents() {
        let metrics = Metrics::new();
        let store = MessageStore::new();
        store
            .add(Arc::new(BaseMessage::new(
                1,
                "sensor/temperature",
                Bytes::from_static(b"21.5"),
                QoS::AtMostOnce,
                false,
                MessageOrigin::Client,
            )))
            .unwrap();

        metrics.observe_store(&store);
        assert_eq!(metrics.store_messages_current.get(), 1);
        assert_eq!(metrics.store_bytes_current.get(), 4);
    }

    #[test]
    fn test_lane_gauges_and_registry_export() {
        let metrics = Metrics::new();
        metrics.set_lane_totals("out", 3, 7);
        metrics.messages_dropped_total.inc();

        assert_eq!(
            metrics
                .inflight_messages
                .with_label_values(&["out"])
                .get(),
            3
        );
        assert_eq!(
            metrics.queued_messages.with_label_values(&["out"]).get(),
            7
        );

        // Every metric family lands in the registry for the exporter
        let families = metrics.registry.gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "embermq_messages_dropped_total"));
    }
}
