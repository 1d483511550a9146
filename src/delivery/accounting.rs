//! Delivery lane accounting
//!
//! Counters track each lane in two dimensions (messages and payload bytes),
//! with a parallel pair restricted to QoS 1/2 because only those occupy the
//! inflight window. The mutators never touch the lanes themselves; lane
//! surgery happens in the caller immediately before or after the counter
//! update, so a counter walk of a lane always matches its contents.

use crate::protocol::QoS;

use super::message::ClientMessage;

/// Counter block for one direction of one client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryCounters {
    pub inflight_count: usize,
    pub inflight_bytes: usize,
    /// QoS 1/2 messages currently inflight
    pub inflight_count12: usize,
    /// QoS 1/2 payload bytes currently inflight
    pub inflight_bytes12: usize,
    pub queued_count: usize,
    pub queued_bytes: usize,
    pub queued_count12: usize,
    pub queued_bytes12: usize,
}

impl DeliveryCounters {
    pub fn add_inflight(&mut self, msg: &ClientMessage) {
        let len = msg.payload_len();
        self.inflight_count += 1;
        self.inflight_bytes += len;
        if msg.qos != QoS::AtMostOnce {
            self.inflight_count12 += 1;
            self.inflight_bytes12 += len;
        }
    }

    pub fn remove_inflight(&mut self, msg: &ClientMessage) {
        let len = msg.payload_len();
        self.inflight_count -= 1;
        self.inflight_bytes -= len;
        if msg.qos != QoS::AtMostOnce {
            self.inflight_count12 -= 1;
            self.inflight_bytes12 -= len;
        }
    }

    pub fn add_queued(&mut self, msg: &ClientMessage) {
        let len = msg.payload_len();
        self.queued_count += 1;
        self.queued_bytes += len;
        if msg.qos != QoS::AtMostOnce {
            self.queued_count12 += 1;
            self.queued_bytes12 += len;
        }
    }

    pub fn remove_queued(&mut self, msg: &ClientMessage) {
        let len = msg.payload_len();
        self.queued_count -= 1;
        self.queued_bytes -= len;
        if msg.qos != QoS::AtMostOnce {
            self.queued_count12 -= 1;
            self.queued_bytes12 -= len;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;

    use crate::protocol::MessageOrigin;
    use crate::store::BaseMessage;

    use super::super::message::{Direction, MessageState};
    use super::*;

    fn msg(qos: QoS, len: usize) -> ClientMessage {
        let base = Arc::new(BaseMessage::new(
            1,
            "a/topic",
            Bytes::from(vec![0u8; len]),
            qos,
            false,
            MessageOrigin::Client,
        ));
        ClientMessage {
            base,
            cmsg_id: 1,
            mid: 1,
            direction: Direction::Out,
            state: MessageState::publish_for(qos),
            qos,
            dup: false,
            retain: false,
            subscription_identifier: None,
        }
    }

    #[test]
    fn test_qos0_skips_12_counters() {
        let mut counters = DeliveryCounters::default();
        counters.add_inflight(&msg(QoS::AtMostOnce, 100));
        assert_eq!(counters.inflight_count, 1);
        assert_eq!(counters.inflight_bytes, 100);
        assert_eq!(counters.inflight_count12, 0);
        assert_eq!(counters.inflight_bytes12, 0);
    }

    #[test]
    fn test_qos12_updates_both_pairs() {
        let mut counters = DeliveryCounters::default();
        counters.add_queued(&msg(QoS::AtLeastOnce, 10));
        counters.add_queued(&msg(QoS::ExactlyOnce, 20));
        assert_eq!(counters.queued_count, 2);
        assert_eq!(counters.queued_bytes, 30);
        assert_eq!(counters.queued_count12, 2);
        assert_eq!(counters.queued_bytes12, 30);
    }

    #[test]
    fn test_add_remove_round_trip() {
        let mut counters = DeliveryCounters::default();
        let a = msg(QoS::AtLeastOnce, 64);
        let b = msg(QoS::AtMostOnce, 32);
        counters.add_inflight(&a);
        counters.add_inflight(&b);
        counters.remove_inflight(&a);
        counters.remove_inflight(&b);
        assert_eq!(counters, DeliveryCounters::default());
    }
}
