//! Delivery hot-path benchmarks

use std::sync::Arc;

use bytes::Bytes;
use criterion::{criterion_group, criterion_main, Criterion};
use rand::{rngs::StdRng, Rng, SeedableRng};

use embermq::config::DeliveryConfig;
use embermq::{
    BaseMessage, DeliveryQueues, MessageOrigin, MessageState, MessageStore, PacketSink,
    ProtocolVersion, PublishOut, QoS, SendError,
};

/// Sink that accepts everything instantly
struct NullSink;

impl PacketSink for NullSink {
    fn is_connected(&self) -> bool {
        true
    }

    fn send_publish(&mut self, _publish: PublishOut<'_>) -> Result<(), SendError> {
        Ok(())
    }

    fn send_pubrec(&mut self, _mid: u16, _reason: u8) -> Result<(), SendError> {
        Ok(())
    }

    fn send_pubrel(&mut self, _mid: u16) -> Result<(), SendError> {
        Ok(())
    }
}

fn bench_insert_write_ack(c: &mut Criterion) {
    let store = MessageStore::new();
    let config = Arc::new(DeliveryConfig {
        max_inflight_messages: 32,
        max_queued_messages: 1000,
        ..DeliveryConfig::default()
    });
    let mut queues = DeliveryQueues::new(
        Arc::from("bench-client"),
        ProtocolVersion::V5,
        QoS::ExactlyOnce,
        config,
    );
    let mut sink = NullSink;
    let mut rng = StdRng::seed_from_u64(42);
    let payload = Bytes::from(vec![0u8; 128]);
    let mut next_id = 1u64;

    c.bench_function("qos1_insert_write_ack", |b| {
        b.iter(|| {
            let base = Arc::new(BaseMessage::new(
                next_id,
                "bench/topic",
                payload.clone(),
                QoS::AtLeastOnce,
                false,
                MessageOrigin::Client,
            ));
            next_id += 1;
            store.add(base.clone()).unwrap();
            let mid = rng.gen_range(1..=u16::MAX);
            queues
                .insert_outgoing(
                    &mut sink,
                    &store,
                    0,
                    mid,
                    QoS::AtLeastOnce,
                    false,
                    &base,
                    None,
                    true,
                    false,
                )
                .unwrap();
            drop(base);
            queues
                .delete_outgoing(&sink, &store, mid, MessageState::WaitForPuback, QoS::AtLeastOnce)
                .unwrap();
        });
    });
}

fn bench_qos0_passthrough(c: &mut Criterion) {
    let store = MessageStore::new();
    let config = Arc::new(DeliveryConfig::default());
    let mut queues = DeliveryQueues::new(
        Arc::from("bench-client"),
        ProtocolVersion::V5,
        QoS::ExactlyOnce,
        config,
    );
    let mut sink = NullSink;
    let payload = Bytes::from(vec![0u8; 128]);
    let mut next_id = 1u64;

    c.bench_function("qos0_insert_write", |b| {
        b.iter(|| {
            let base = Arc::new(BaseMessage::new(
                next_id,
                "bench/topic",
                payload.clone(),
                QoS::AtMostOnce,
                false,
                MessageOrigin::Client,
            ));
            next_id += 1;
            store.add(base.clone()).unwrap();
            queues
                .insert_outgoing(
                    &mut sink,
                    &store,
                    0,
                    0,
                    QoS::AtMostOnce,
                    false,
                    &base,
                    None,
                    true,
                    false,
                )
                .unwrap();
        });
    });
}

criterion_group!(benches, bench_insert_write_ack, bench_qos0_passthrough);
criterion_main!(benches);
