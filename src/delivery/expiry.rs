//! Message expiry sweep
//!
//! Messages carry an absolute expiry instant (0 = never). The sweep walks
//! all four lanes and releases anything past its deadline: an expired
//! QoS 1/2 delivery occupying a window slot returns its quota so the window
//! does not leak, while queued removals never touch quota. Driven on
//! session reload and by the housekeeping tick.

use std::collections::VecDeque;

use crate::protocol::QoS;
use crate::store::MessageStore;

use super::accounting::DeliveryCounters;
use super::message::ClientMessage;
use super::{persist_record_delete, DeliveryQueues, PersistTarget};

enum Lane {
    Inflight,
    Queued,
}

fn sweep_lane(
    lane: &mut VecDeque<ClientMessage>,
    stats: &mut DeliveryCounters,
    kind: Lane,
    quota: &mut u16,
    maximum: u16,
    now: u64,
    store: &MessageStore,
    target: &PersistTarget,
) -> usize {
    let mut removed = 0;
    let mut idx = 0;
    while idx < lane.len() {
        if lane[idx].base.is_expired(now) {
            let msg = lane.remove(idx).expect("lane index in range");
            match kind {
                Lane::Inflight => {
                    stats.remove_inflight(&msg);
                    if msg.qos != QoS::AtMostOnce && *quota < maximum {
                        *quota += 1;
                    }
                }
                Lane::Queued => stats.remove_queued(&msg),
            }
            persist_record_delete(target, msg.cmsg_id);
            store.ref_dec(msg.base);
            removed += 1;
        } else {
            idx += 1;
        }
    }
    removed
}

impl DeliveryQueues {
    /// Remove every delivery record whose message expired before `now`.
    /// Returns the number of records released.
    pub fn expire_messages(&mut self, now: u64, store: &MessageStore) -> usize {
        let target = self.persist_target();
        let mut removed = 0;

        removed += sweep_lane(
            &mut self.msgs_out.inflight,
            &mut self.msgs_out.stats,
            Lane::Inflight,
            &mut self.msgs_out.inflight_quota,
            self.msgs_out.inflight_maximum,
            now,
            store,
            &target,
        );
        removed += sweep_lane(
            &mut self.msgs_out.queued,
            &mut self.msgs_out.stats,
            Lane::Queued,
            &mut self.msgs_out.inflight_quota,
            self.msgs_out.inflight_maximum,
            now,
            store,
            &target,
        );
        removed += sweep_lane(
            &mut self.msgs_in.inflight,
            &mut self.msgs_in.stats,
            Lane::Inflight,
            &mut self.msgs_in.inflight_quota,
            self.msgs_in.inflight_maximum,
            now,
            store,
            &target,
        );
        removed += sweep_lane(
            &mut self.msgs_in.queued,
            &mut self.msgs_in.stats,
            Lane::Queued,
            &mut self.msgs_in.inflight_quota,
            self.msgs_in.inflight_maximum,
            now,
            store,
            &target,
        );

        if removed > 0 {
            if let Some(metrics) = &self.metrics {
                metrics.messages_expired_total.inc_by(removed as u64);
            }
        }
        removed
    }
}
