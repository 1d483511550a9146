//! End-to-end delivery tests
//!
//! Exercises the delivery core the way the rest of a broker does: publishes
//! fan out through a matcher into per-subscriber queues, sessions work
//! their QoS handshakes through a packet sink, and persistent sessions are
//! rebuilt from the storage backend after a "restart".

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use embermq::config::DeliveryConfig;
use embermq::persistence::{FjallBackend, PersistenceManager, StorageBackend};
use embermq::{
    BaseMessage, Broker, Config, DeliveryError, DeliveryQueues, Direction, MessageIdGenerator,
    MessageOrigin, MessageState, Matcher, MessageStore, PacketSink, Properties, ProtocolVersion,
    PublishOut, PublishRequest, QoS, SendError,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .try_init();
}

/// Packet sink double recording everything the core asks it to transmit
#[derive(Debug, Default)]
struct RecordingSink {
    connected: bool,
    published: Vec<(u16, String, QoS, bool)>,
    pubrecs: Vec<u16>,
    pubrels: Vec<u16>,
}

impl RecordingSink {
    fn connected() -> Self {
        Self {
            connected: true,
            ..Self::default()
        }
    }
}

impl PacketSink for RecordingSink {
    fn is_connected(&self) -> bool {
        self.connected
    }

    fn send_publish(&mut self, publish: PublishOut<'_>) -> Result<(), SendError> {
        self.published.push((
            publish.mid,
            publish.topic.to_string(),
            publish.qos,
            publish.dup,
        ));
        Ok(())
    }

    fn send_pubrec(&mut self, mid: u16, _reason: u8) -> Result<(), SendError> {
        self.pubrecs.push(mid);
        Ok(())
    }

    fn send_pubrel(&mut self, mid: u16) -> Result<(), SendError> {
        self.pubrels.push(mid);
        Ok(())
    }
}

/// One subscriber session: its delivery queues plus its connection double
struct Subscriber {
    queues: DeliveryQueues,
    sink: RecordingSink,
    granted_qos: QoS,
    next_mid: u16,
}

impl Subscriber {
    fn new(id: &str, granted_qos: QoS, config: Arc<DeliveryConfig>) -> Self {
        Self {
            queues: DeliveryQueues::new(
                Arc::from(id),
                ProtocolVersion::V5,
                QoS::ExactlyOnce,
                config,
            ),
            sink: RecordingSink::connected(),
            granted_qos,
            next_mid: 1,
        }
    }
}

/// Matcher double: every subscriber matches every topic
struct Router<'a> {
    store: &'a MessageStore,
    subscribers: Vec<Subscriber>,
}

impl Matcher for Router<'_> {
    fn queue_message(
        &mut self,
        _source_id: Option<&str>,
        _topic: &str,
        qos: QoS,
        retain: bool,
        base: &Arc<BaseMessage>,
    ) -> Result<(), DeliveryError> {
        if self.subscribers.is_empty() {
            return Err(DeliveryError::NoSubscribers);
        }
        for sub in &mut self.subscribers {
            let effective = qos.min(sub.granted_qos);
            let mid = if effective == QoS::AtMostOnce {
                0
            } else {
                let mid = sub.next_mid;
                sub.next_mid += 1;
                mid
            };
            sub.queues.insert_outgoing(
                &mut sub.sink,
                self.store,
                0,
                mid,
                effective,
                retain,
                base,
                None,
                true,
                false,
            )?;
        }
        Ok(())
    }
}

fn delivery_config(max_inflight: u16, max_queued: usize) -> Arc<DeliveryConfig> {
    Arc::new(DeliveryConfig {
        max_inflight_messages: max_inflight,
        max_queued_messages: max_queued,
        ..DeliveryConfig::default()
    })
}

fn publish_request(topic: &str, qos: QoS, payload: &'static [u8]) -> PublishRequest {
    PublishRequest {
        source_id: Some(Arc::from("publisher")),
        topic: Arc::from(topic),
        qos,
        retain: false,
        payload: Bytes::from_static(payload),
        expiry_interval: 0,
        properties: Properties::default(),
    }
}

#[test]
fn qos1_fan_out_and_ack_to_completion() {
    init_tracing();

    let store = MessageStore::new();
    let ids = MessageIdGenerator::new(0);
    let mut router = Router {
        store: &store,
        subscribers: vec![
            Subscriber::new("sub-a", QoS::AtLeastOnce, delivery_config(10, 100)),
            Subscriber::new("sub-b", QoS::AtLeastOnce, delivery_config(10, 100)),
        ],
    };

    store
        .easy_queue(
            &ids,
            &mut router,
            publish_request("sensor/temperature", QoS::AtLeastOnce, b"21.5"),
            1_000,
        )
        .unwrap();

    assert_eq!(store.len(), 1);

    // Both subscribers got the PUBLISH on the wire immediately
    for sub in &router.subscribers {
        assert_eq!(sub.sink.published.len(), 1);
        let (mid, ref topic, qos, dup) = sub.sink.published[0];
        assert_eq!(mid, 1);
        assert_eq!(topic, "sensor/temperature");
        assert_eq!(qos, QoS::AtLeastOnce);
        assert!(!dup);

        let msg = sub.queues.state(Direction::Out).inflight_iter().next().unwrap();
        assert_eq!(msg.state, MessageState::WaitForPuback);
    }

    // PUBACKs complete both deliveries and the stored copy is released
    for sub in &mut router.subscribers {
        sub.queues
            .delete_outgoing(
                &sub.sink,
                &store,
                1,
                MessageState::WaitForPuback,
                QoS::AtLeastOnce,
            )
            .unwrap();
        assert_eq!(sub.queues.state(Direction::Out).inflight_len(), 0);
    }
    assert!(store.is_empty());
}

#[test]
fn subscriber_qos_caps_delivery() {
    init_tracing();

    let store = MessageStore::new();
    let ids = MessageIdGenerator::new(0);
    let mut router = Router {
        store: &store,
        subscribers: vec![Subscriber::new(
            "sub-a",
            QoS::AtMostOnce,
            delivery_config(10, 100),
        )],
    };

    store
        .easy_queue(
            &ids,
            &mut router,
            publish_request("sensor/temperature", QoS::ExactlyOnce, b"21.5"),
            1_000,
        )
        .unwrap();

    let sub = &router.subscribers[0];
    assert_eq!(sub.sink.published.len(), 1);
    assert_eq!(sub.sink.published[0].2, QoS::AtMostOnce);
    // Fire and forget: nothing outstanding, nothing stored
    assert_eq!(sub.queues.state(Direction::Out).inflight_len(), 0);
    assert!(store.is_empty());
}

#[test]
fn qos2_publish_is_delivered_exactly_once() {
    init_tracing();

    let store = MessageStore::new();
    let ids = MessageIdGenerator::new(0);

    // Publisher session holds the incoming QoS 2 publish until PUBREL
    let mut publisher = Subscriber::new("publisher", QoS::ExactlyOnce, delivery_config(10, 100));

    let base = Arc::new(
        BaseMessage::new(
            ids.next(),
            "actuator/valve",
            Bytes::from_static(b"open"),
            QoS::ExactlyOnce,
            false,
            MessageOrigin::Client,
        )
        .with_source(Some(Arc::from("publisher")), None, None, 21),
    );
    store.add(base.clone()).unwrap();

    publisher
        .queues
        .insert_incoming(&mut publisher.sink, &store, 0, &base, false)
        .unwrap();
    drop(base);
    assert_eq!(
        publisher
            .queues
            .state(Direction::In)
            .inflight_iter()
            .next()
            .unwrap()
            .state,
        MessageState::WaitForPubrel
    );

    // PUBREL arrives; the publish fans out to the subscriber exactly once
    let mut router = Router {
        store: &store,
        subscribers: vec![Subscriber::new(
            "sub-a",
            QoS::ExactlyOnce,
            delivery_config(10, 100),
        )],
    };
    publisher
        .queues
        .release_incoming(&mut publisher.sink, &mut router, &store, 21)
        .unwrap();
    assert_eq!(publisher.queues.state(Direction::In).inflight_len(), 0);

    // Redelivery of the same PUBREL finds nothing
    assert_eq!(
        publisher
            .queues
            .release_incoming(&mut publisher.sink, &mut router, &store, 21),
        Err(DeliveryError::NotFound)
    );

    // Subscriber walks the full outgoing QoS 2 handshake
    let sub = &mut router.subscribers[0];
    assert_eq!(sub.sink.published.len(), 1);
    sub.queues
        .update_outgoing(1, MessageState::WaitForPubrel, QoS::ExactlyOnce)
        .unwrap();
    sub.queues
        .update_outgoing(1, MessageState::WaitForPubcomp, QoS::ExactlyOnce)
        .unwrap();
    sub.queues
        .delete_outgoing(
            &sub.sink,
            &store,
            1,
            MessageState::WaitForPubcomp,
            QoS::ExactlyOnce,
        )
        .unwrap();

    assert_eq!(sub.sink.published.len(), 1);
    assert!(store.is_empty());
}

#[tokio::test]
async fn persisted_session_survives_restart() {
    init_tracing();

    let dir = tempfile::tempdir().unwrap();
    let config = Config::default();
    let delivery = delivery_config(2, 100);
    let max_restored_id;

    // First life: a persisted session with one sent, one unsent, and one
    // queued QoS 1 delivery
    {
        let backend = Arc::new(FjallBackend::open(dir.path()).unwrap());
        let manager = Arc::new(PersistenceManager::new(
            backend.clone(),
            Duration::from_millis(10),
            100,
        ));
        let broker = Broker::open_with_persister(&config, manager.clone());

        let mut session = Subscriber::new("client-a", QoS::AtLeastOnce, delivery.clone());
        session.queues = DeliveryQueues::new(
            Arc::from("client-a"),
            ProtocolVersion::V5,
            QoS::ExactlyOnce,
            delivery.clone(),
        )
        .with_persister(manager.clone());
        session.queues.set_persisted(true);

        for mid in 1..=3u16 {
            let base = Arc::new(BaseMessage::new(
                broker.ids().next(),
                "sensor/temperature",
                Bytes::from_static(b"21.5"),
                QoS::AtLeastOnce,
                false,
                MessageOrigin::Client,
            ));
            broker.store().add(base.clone()).unwrap();
            session
                .queues
                .insert_outgoing(
                    &mut session.sink,
                    broker.store(),
                    0,
                    mid,
                    QoS::AtLeastOnce,
                    false,
                    &base,
                    None,
                    false,
                    true,
                )
                .unwrap();
        }
        // Let the adds commit before the sent-state update lands
        tokio::time::sleep(Duration::from_millis(50)).await;

        // First message goes out before the "crash"
        session
            .queues
            .update_outgoing(1, MessageState::WaitForPuback, QoS::AtLeastOnce)
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        manager.shutdown().await.unwrap();

        let loaded = backend.load_all().await.unwrap();
        assert_eq!(loaded.base_messages.len(), 3);
        assert_eq!(loaded.client_messages.len(), 3);
        max_restored_id = loaded.max_db_id();
    }

    // Second life: rebuild from disk and resume the session
    {
        let backend = Arc::new(FjallBackend::open(dir.path()).unwrap());
        let loaded = backend.load_all().await.unwrap();

        let broker = Broker::open(&config);
        let mut sessions = broker.restore(loaded);
        let records = sessions.remove("client-a").expect("restored session");
        assert_eq!(records.len(), 3);

        let mut session = Subscriber::new("client-a", QoS::AtLeastOnce, delivery.clone());
        for restored in &records {
            session
                .queues
                .insert_restored(&restored.record, restored.base.clone(), broker.store())
                .unwrap();
        }
        session.queues.reconnect_reset(&session.sink, broker.store());
        broker.store().compact();

        // New ids keep ascending past everything restored
        assert!(broker.ids().next() > max_restored_id);

        // The window holds the first two, publish-ready in publish order;
        // the third still waits its turn
        let states: Vec<(u16, MessageState)> = session
            .queues
            .state(Direction::Out)
            .inflight_iter()
            .map(|m| (m.mid, m.state))
            .collect();
        assert_eq!(
            states,
            vec![
                (1, MessageState::PublishQos1),
                (2, MessageState::PublishQos1),
            ]
        );
        assert_eq!(session.queues.state(Direction::Out).queued_len(), 1);
        assert_eq!(broker.store().len(), 3);

        // Retransmission drains the window; the PUBACK for the first frees
        // a slot and the queued delivery moves up
        session
            .queues
            .write_inflight_out_all(&mut session.sink, broker.store())
            .unwrap();
        assert_eq!(session.sink.published.len(), 2);

        session
            .queues
            .delete_outgoing(
                &session.sink,
                broker.store(),
                1,
                MessageState::WaitForPuback,
                QoS::AtLeastOnce,
            )
            .unwrap();
        let mids: Vec<u16> = session
            .queues
            .state(Direction::Out)
            .inflight_iter()
            .map(|m| m.mid)
            .collect();
        assert_eq!(mids, vec![2, 3]);
        assert_eq!(session.queues.state(Direction::Out).queued_len(), 0);
    }
}

#[test]
fn publish_without_subscribers_reports_and_releases() {
    init_tracing();

    let store = MessageStore::new();
    let ids = MessageIdGenerator::new(0);
    let mut router = Router {
        store: &store,
        subscribers: Vec::new(),
    };

    let result = store.easy_queue(
        &ids,
        &mut router,
        publish_request("nobody/listening", QoS::AtLeastOnce, b"hello"),
        1_000,
    );
    assert_eq!(result, Err(DeliveryError::NoSubscribers));
    assert!(store.is_empty());
}
