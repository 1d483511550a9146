//! Session resumption
//!
//! When a persistent session is resumed (same client id, clean start
//! false), the delivery records survive but the counters are stale and the
//! states no longer match what the peer will do next. The reset walks every
//! lane in order, re-derives the accounting from scratch, rewrites each
//! record's state so retransmission happens correctly, and drains the
//! queued lanes back into the freshly emptied windows.

use crate::protocol::QoS;
use crate::store::MessageStore;

use super::message::{Direction, MessageState};
use super::sink::PacketSink;
use super::{persist_record_delete, persist_record_update, DeliveryQueues};

impl DeliveryQueues {
    /// Renormalize both directions after a session resumption.
    pub fn reconnect_reset(&mut self, sink: &dyn PacketSink, store: &MessageStore) {
        self.reconnect_reset_outgoing(sink);
        self.reconnect_reset_incoming(sink, store);
    }

    /// Outgoing direction: every surviving inflight record is due for
    /// retransmission. QoS 1/2 publishes go back to their publish state
    /// (the dup flag is already set if they went out once); a QoS 2
    /// delivery whose PUBREL was already sent resends the PUBREL instead,
    /// since the peer has discarded its PUBREC side of the exchange.
    fn reconnect_reset_outgoing(&mut self, sink: &dyn PacketSink) {
        let target = self.persist_target();

        self.msgs_out.reset_for_reconnect();
        for msg in self.msgs_out.inflight.iter_mut() {
            self.msgs_out.stats.add_inflight(msg);
            if msg.qos != QoS::AtMostOnce && self.msgs_out.inflight_quota > 0 {
                self.msgs_out.inflight_quota -= 1;
            }
            msg.state = match msg.qos {
                QoS::AtMostOnce => MessageState::PublishQos0,
                QoS::AtLeastOnce => MessageState::PublishQos1,
                QoS::ExactlyOnce => {
                    if msg.state == MessageState::WaitForPubcomp {
                        MessageState::ResendPubrel
                    } else {
                        MessageState::PublishQos2
                    }
                }
            };
            persist_record_update(&target, msg);
        }
        for msg in self.msgs_out.queued.iter() {
            self.msgs_out.stats.add_queued(msg);
        }

        self.promote_queued(Direction::Out, sink);
    }

    /// Incoming direction: QoS 0/1 records are dropped, the client simply
    /// retransmits them. QoS 2 records keep their state because the peer
    /// holds the matching half of the handshake.
    fn reconnect_reset_incoming(&mut self, sink: &dyn PacketSink, store: &MessageStore) {
        let target = self.persist_target();

        self.msgs_in.reset_for_reconnect();
        let mut idx = 0;
        while idx < self.msgs_in.inflight.len() {
            if self.msgs_in.inflight[idx].qos == QoS::ExactlyOnce {
                let msg = &self.msgs_in.inflight[idx];
                self.msgs_in.stats.add_inflight(msg);
                if self.msgs_in.inflight_quota > 0 {
                    self.msgs_in.inflight_quota -= 1;
                }
                idx += 1;
            } else {
                let msg = self
                    .msgs_in
                    .inflight
                    .remove(idx)
                    .expect("inflight index in range");
                persist_record_delete(&target, msg.cmsg_id);
                store.ref_dec(msg.base);
            }
        }
        for msg in self.msgs_in.queued.iter() {
            self.msgs_in.stats.add_queued(msg);
        }

        self.promote_queued(Direction::In, sink);
    }
}
