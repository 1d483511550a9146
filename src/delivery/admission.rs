//! Admission control
//!
//! Two predicates gate every insert: `ready_for_flight` decides whether a
//! message may occupy the inflight window right now, `ready_for_queue`
//! decides whether a refused message may wait in the backlog instead of
//! being dropped. Both work purely from configured limits and the current
//! counters; a limit of 0 always means unbounded.

use crate::protocol::QoS;

use super::message::Direction;
use super::sink::PacketSink;
use super::DeliveryQueues;

impl DeliveryQueues {
    /// May a message of `qos` become inflight in `direction` right now?
    ///
    /// QoS 0 messages have no handshake and either go straight to the wire
    /// or are discarded, so their gate sizes against the socket backlog and
    /// the overall byte budget. QoS 1/2 messages consume a flight quota
    /// slot and count against the QoS 1/2 byte budget; note the byte gate
    /// deliberately reads the QoS 1/2 counter here but the all-QoS counter
    /// in the QoS 0 branch.
    pub fn ready_for_flight(&self, direction: Direction, qos: QoS, sink: &dyn PacketSink) -> bool {
        let state = self.state(direction);
        let config = &self.config;

        if state.inflight_maximum == 0 && config.max_inflight_bytes == 0 {
            return true;
        }

        if qos == QoS::AtMostOnce {
            if config.max_queued_messages == 0 && config.max_inflight_bytes == 0 {
                return true;
            }
            let valid_bytes = (state.stats.inflight_bytes as i64
                - config.max_inflight_bytes as i64)
                < config.max_queued_bytes as i64;
            let valid_count = match direction {
                Direction::Out => sink.backlog() < config.max_queued_messages,
                Direction::In => {
                    (state.stats.inflight_count as i64 - i64::from(state.inflight_maximum))
                        < config.max_queued_messages as i64
                }
            };

            if config.max_queued_messages == 0 {
                return valid_bytes;
            }
            if config.max_inflight_bytes == 0 {
                return valid_count;
            }
            valid_bytes && valid_count
        } else {
            let valid_bytes = state.stats.inflight_bytes12 < config.max_inflight_bytes;
            let valid_count = state.inflight_quota > 0;

            if state.inflight_maximum == 0 {
                return valid_bytes;
            }
            if config.max_inflight_bytes == 0 {
                return valid_count;
            }
            valid_bytes && valid_count
        }
    }

    /// May a message refused flight wait in the `direction` backlog?
    ///
    /// For connected clients the configured queue limits bound the total
    /// QoS 1/2 backlog beyond the inflight window, so the window sizes are
    /// subtracted back out; a disconnected client has no inflight budget,
    /// so its queue is measured as-is.
    pub fn ready_for_queue(&self, direction: Direction, qos: QoS, sink: &dyn PacketSink) -> bool {
        let state = self.state(direction);
        let config = &self.config;

        if config.max_queued_messages == 0 && config.max_queued_bytes == 0 {
            return true;
        }

        if qos == QoS::AtMostOnce && !config.queue_qos0_messages && !self.is_lazy_bridge() {
            return false;
        }

        let (source_count, source_bytes, adjust_count, adjust_bytes) = if sink.is_connected() {
            (
                state.stats.inflight_count12 + state.stats.queued_count12,
                state.stats.inflight_bytes12 + state.stats.queued_bytes12,
                i64::from(state.inflight_maximum),
                config.max_inflight_bytes as i64,
            )
        } else {
            (
                state.stats.queued_count12,
                state.stats.queued_bytes12,
                0,
                0,
            )
        };

        let valid_bytes = (source_bytes as i64 - adjust_bytes) < config.max_queued_bytes as i64;
        let valid_count = (source_count as i64 - adjust_count) < config.max_queued_messages as i64;

        if config.max_queued_messages == 0 {
            return valid_bytes;
        }
        if config.max_queued_bytes == 0 {
            return valid_count;
        }
        valid_bytes && valid_count
    }
}
