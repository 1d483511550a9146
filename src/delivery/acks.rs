//! Acknowledgement handling
//!
//! Entry points the session layer calls when PUBACK, PUBREC, PUBREL, or
//! PUBCOMP packets arrive. Outgoing acknowledgements are matched against
//! the inflight lane by wire packet id and validated against the delivery's
//! QoS (and, for QoS 2, the expected handshake position); a mismatch is a
//! protocol violation the session answers by disconnecting the peer.

use crate::protocol::{DeliveryError, QoS};
use crate::store::{Matcher, MessageStore};

use super::message::{Direction, MessageState};
use super::sink::PacketSink;
use super::{persist_record_delete, persist_record_update, DeliveryQueues};

impl DeliveryQueues {
    /// Advance an outgoing inflight record to `state` (PUBREC handling,
    /// and the PUBREL-sent bookkeeping of the QoS 2 handshake).
    pub fn update_outgoing(
        &mut self,
        mid: u16,
        state: MessageState,
        qos: QoS,
    ) -> Result<(), DeliveryError> {
        let target = self.persist_target();
        for msg in self.msgs_out.inflight.iter_mut() {
            if msg.mid == mid {
                if msg.qos != qos {
                    return Err(DeliveryError::Protocol);
                }
                msg.state = state;
                persist_record_update(&target, msg);
                return Ok(());
            }
        }
        Err(DeliveryError::NotFound)
    }

    /// Complete an outgoing delivery (PUBACK for QoS 1, PUBCOMP for QoS 2).
    ///
    /// For QoS 2 the record must sit exactly at `expect_state`, otherwise
    /// the peer acknowledged out of order. Completion frees a window slot,
    /// so the queued lane is drained into the window afterwards.
    pub fn delete_outgoing(
        &mut self,
        sink: &dyn PacketSink,
        store: &MessageStore,
        mid: u16,
        expect_state: MessageState,
        qos: QoS,
    ) -> Result<(), DeliveryError> {
        if let Some(idx) = self.msgs_out.inflight.iter().position(|m| m.mid == mid) {
            {
                let msg = &self.msgs_out.inflight[idx];
                if msg.qos != qos {
                    return Err(DeliveryError::Protocol);
                }
                if qos == QoS::ExactlyOnce && msg.state != expect_state {
                    return Err(DeliveryError::Protocol);
                }
            }
            self.finish_inflight_removal(Direction::Out, idx, store);
        } else if let Some(idx) = self.msgs_out.queued.iter().position(|m| m.mid == mid) {
            {
                let msg = &self.msgs_out.queued[idx];
                if msg.qos != qos {
                    return Err(DeliveryError::Protocol);
                }
                if qos == QoS::ExactlyOnce && msg.state != expect_state {
                    return Err(DeliveryError::Protocol);
                }
            }
            let target = self.persist_target();
            let msg = self.msgs_out.remove_queued_at(idx);
            persist_record_delete(&target, msg.cmsg_id);
            store.ref_dec(msg.base);
        } else {
            return Err(DeliveryError::NotFound);
        }

        self.write_queued_out(sink);
        Ok(())
    }

    /// Drop an incoming QoS 2 record without forwarding (the session
    /// refused the publish, e.g. after a failed authorization recheck).
    pub fn remove_incoming(&mut self, store: &MessageStore, mid: u16) -> Result<(), DeliveryError> {
        let Some(idx) = self.msgs_in.inflight.iter().position(|m| m.mid == mid) else {
            return Err(DeliveryError::NotFound);
        };
        if self.msgs_in.inflight[idx].qos != QoS::ExactlyOnce {
            return Err(DeliveryError::Protocol);
        }
        self.finish_inflight_removal(Direction::In, idx, store);
        Ok(())
    }

    /// PUBREL arrived: forward the held QoS 2 publish to the matcher and
    /// release the record. "Nobody subscribed" still completes the
    /// handshake. Frees a receive window slot, so queued incoming publishes
    /// are answered afterwards.
    pub fn release_incoming(
        &mut self,
        sink: &mut dyn PacketSink,
        matcher: &mut dyn Matcher,
        store: &MessageStore,
        mid: u16,
    ) -> Result<(), DeliveryError> {
        let Some(idx) = self.msgs_in.inflight.iter().position(|m| m.mid == mid) else {
            return Err(DeliveryError::NotFound);
        };

        let base = self.msgs_in.inflight[idx].base.clone();
        match matcher.queue_message(
            base.source_id.as_deref(),
            &base.topic,
            base.qos,
            base.retain,
            &base,
        ) {
            Ok(()) | Err(DeliveryError::NoSubscribers) => {}
            Err(e) => return Err(e),
        }

        self.finish_inflight_removal(Direction::In, idx, store);
        self.write_queued_in(sink)
    }
}
