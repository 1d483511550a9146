//! Write paths
//!
//! Draining the lanes toward the packet sink. Outgoing inflight messages in
//! a publish state are transmitted and advanced to their wait state; queued
//! messages are promoted into the window as admission allows. The incoming
//! variant answers queued QoS 2 publishes with PUBREC once the receive
//! window has room.

use crate::protocol::{DeliveryError, QoS, SendError};
use crate::store::MessageStore;

use super::message::{ClientMessage, Direction, MessageState};
use super::sink::{PacketSink, PublishOut};
use super::{persist_record_update, DeliveryQueues};

/// What to do with an inflight record after a write attempt
enum WriteAction {
    Keep,
    Remove,
}

fn send_publish_record(
    sink: &mut dyn PacketSink,
    msg: &ClientMessage,
) -> Result<(), SendError> {
    sink.send_publish(PublishOut {
        mid: msg.mid,
        topic: &msg.base.topic,
        payload: &msg.base.payload,
        qos: msg.qos,
        retain: msg.retain,
        dup: msg.dup,
        subscription_identifier: msg.subscription_identifier,
        properties: &msg.base.properties,
        expiry_time: msg.base.expiry_time,
    })
}

impl DeliveryQueues {
    /// Transmit every outgoing inflight message that is due
    pub fn write_inflight_out_all(
        &mut self,
        sink: &mut dyn PacketSink,
        store: &MessageStore,
    ) -> Result<(), DeliveryError> {
        self.write_inflight_out_from(0, sink, store)
    }

    /// Transmit only the newly admitted tail of the outgoing inflight lane.
    ///
    /// Scans backwards from the tail while records are still in a publish
    /// state, then writes forward from that pivot. Earlier records that
    /// already went out and are waiting on acknowledgements are left alone.
    pub fn write_inflight_out_latest(
        &mut self,
        sink: &mut dyn PacketSink,
        store: &MessageStore,
    ) -> Result<(), DeliveryError> {
        if self.msgs_out.inflight.is_empty() {
            return Ok(());
        }
        let pivot = self
            .msgs_out
            .inflight
            .iter()
            .rposition(|msg| !msg.state.is_publish())
            .map_or(0, |idx| idx + 1);
        self.write_inflight_out_from(pivot, sink, store)
    }

    fn write_inflight_out_from(
        &mut self,
        start: usize,
        sink: &mut dyn PacketSink,
        store: &MessageStore,
    ) -> Result<(), DeliveryError> {
        let mut idx = start;
        while idx < self.msgs_out.inflight.len() {
            match self.write_one_out(idx, sink)? {
                WriteAction::Keep => idx += 1,
                WriteAction::Remove => self.finish_inflight_removal(Direction::Out, idx, store),
            }
        }
        Ok(())
    }

    /// Dispatch one outgoing inflight record on its state.
    ///
    /// An oversize refusal is a completion: the packet can never reach this
    /// client, so the record is removed without advancing the handshake.
    /// Any other send failure leaves the record untouched for a later
    /// retry.
    fn write_one_out(
        &mut self,
        idx: usize,
        sink: &mut dyn PacketSink,
    ) -> Result<WriteAction, DeliveryError> {
        let msg = &self.msgs_out.inflight[idx];
        match msg.state {
            MessageState::PublishQos0 => match send_publish_record(sink, msg) {
                Ok(()) | Err(SendError::Oversize) => Ok(WriteAction::Remove),
                Err(e) => Err(e.into()),
            },
            MessageState::PublishQos1 => match send_publish_record(sink, msg) {
                Ok(()) => {
                    self.advance_sent(idx, MessageState::WaitForPuback);
                    Ok(WriteAction::Keep)
                }
                Err(SendError::Oversize) => Ok(WriteAction::Remove),
                Err(e) => Err(e.into()),
            },
            MessageState::PublishQos2 => match send_publish_record(sink, msg) {
                Ok(()) => {
                    self.advance_sent(idx, MessageState::WaitForPubrec);
                    Ok(WriteAction::Keep)
                }
                Err(SendError::Oversize) => Ok(WriteAction::Remove),
                Err(e) => Err(e.into()),
            },
            MessageState::ResendPubrel => {
                let mid = msg.mid;
                match sink.send_pubrel(mid) {
                    Ok(()) => {
                        let target = self.persist_target();
                        let msg = &mut self.msgs_out.inflight[idx];
                        msg.state = MessageState::WaitForPubcomp;
                        persist_record_update(&target, msg);
                        Ok(WriteAction::Keep)
                    }
                    Err(e) => Err(e.into()),
                }
            }
            // Wait states, queued, invalid: nothing to write
            _ => Ok(WriteAction::Keep),
        }
    }

    /// A PUBLISH went out: any further transmission is a duplicate
    fn advance_sent(&mut self, idx: usize, state: MessageState) {
        let target = self.persist_target();
        let msg = &mut self.msgs_out.inflight[idx];
        msg.dup = true;
        msg.state = state;
        persist_record_update(&target, msg);
    }

    /// Promote queued outgoing messages into the inflight window while
    /// admission allows, in order, stamping their initial publish state.
    /// Transmission happens on the next inflight write.
    pub fn write_queued_out(&mut self, sink: &dyn PacketSink) {
        self.promote_queued(Direction::Out, sink);
    }

    /// Head-to-tail promotion from queued to inflight for one direction,
    /// stopping at the first entry admission refuses.
    pub(crate) fn promote_queued(&mut self, direction: Direction, sink: &dyn PacketSink) {
        let target = self.persist_target();
        loop {
            let Some(head) = self.state(direction).queued.front() else {
                break;
            };
            let qos = head.qos;
            if !self.ready_for_flight(direction, qos, sink) {
                break;
            }
            let lane = self.direction_mut(direction);
            if let Some(head) = lane.queued.front_mut() {
                head.state = MessageState::publish_for(qos);
            }
            lane.dequeue_first();
            if let Some(msg) = lane.inflight.back() {
                persist_record_update(&target, msg);
            }
        }
    }

    /// Answer queued incoming QoS 2 publishes with PUBREC while the
    /// receive window has room, moving each into the inflight lane to
    /// await its PUBREL.
    pub fn write_queued_in(&mut self, sink: &mut dyn PacketSink) -> Result<(), DeliveryError> {
        let target = self.persist_target();
        loop {
            let Some(head) = self.msgs_in.queued.front() else {
                break;
            };
            if self.msgs_in.inflight_maximum != 0 && self.msgs_in.inflight_quota == 0 {
                break;
            }
            if head.qos != QoS::ExactlyOnce {
                break;
            }
            let mid = head.mid;
            if let Some(head) = self.msgs_in.queued.front_mut() {
                head.state = MessageState::SendPubrec;
            }
            self.msgs_in.dequeue_first();
            match sink.send_pubrec(mid, 0) {
                Ok(()) => {
                    if let Some(msg) = self.msgs_in.inflight.back_mut() {
                        msg.state = MessageState::WaitForPubrel;
                    }
                    if let Some(msg) = self.msgs_in.inflight.back() {
                        persist_record_update(&target, msg);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}
