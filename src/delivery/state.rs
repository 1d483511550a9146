//! Per-direction delivery state
//!
//! Each client carries two of these, one per direction. The two lanes are
//! insertion-ordered so delivery attempts always happen in publish order;
//! promotion from `queued` to `inflight` is strictly head-to-tail for the
//! same reason.

use std::collections::VecDeque;

use super::accounting::DeliveryCounters;
use super::message::ClientMessage;

/// One direction's lanes, counters, and QoS 1/2 flight quota.
#[derive(Debug, Default)]
pub struct DeliveryState {
    pub(crate) inflight: VecDeque<ClientMessage>,
    pub(crate) queued: VecDeque<ClientMessage>,
    pub(crate) stats: DeliveryCounters,
    /// Configured ceiling on concurrent QoS 1/2 messages in flight,
    /// 0 = unbounded
    pub(crate) inflight_maximum: u16,
    /// Remaining QoS 1/2 flight slots
    pub(crate) inflight_quota: u16,
}

impl DeliveryState {
    pub(crate) fn new(inflight_maximum: u16) -> Self {
        Self {
            inflight: VecDeque::new(),
            queued: VecDeque::new(),
            stats: DeliveryCounters::default(),
            inflight_maximum,
            inflight_quota: inflight_maximum,
        }
    }

    /// Append to the inflight lane, updating counters
    pub(crate) fn push_inflight(&mut self, msg: ClientMessage) {
        self.stats.add_inflight(&msg);
        self.inflight.push_back(msg);
    }

    /// Append to the queued lane, updating counters
    pub(crate) fn push_queued(&mut self, msg: ClientMessage) {
        self.stats.add_queued(&msg);
        self.queued.push_back(msg);
    }

    /// Remove and return the inflight entry at `idx`, updating counters
    pub(crate) fn remove_inflight_at(&mut self, idx: usize) -> ClientMessage {
        let msg = self.inflight.remove(idx).expect("inflight index in range");
        self.stats.remove_inflight(&msg);
        msg
    }

    /// Remove and return the queued entry at `idx`, updating counters
    pub(crate) fn remove_queued_at(&mut self, idx: usize) -> ClientMessage {
        let msg = self.queued.remove(idx).expect("queued index in range");
        self.stats.remove_queued(&msg);
        msg
    }

    /// Move the head of the queued lane to the tail of inflight.
    ///
    /// Always head-to-tail: promotion must preserve publish order. Consumes
    /// a flight quota slot when one is available.
    pub(crate) fn dequeue_first(&mut self) {
        if let Some(msg) = self.queued.pop_front() {
            self.stats.remove_queued(&msg);
            if self.inflight_quota > 0 {
                self.inflight_quota -= 1;
            }
            self.stats.add_inflight(&msg);
            self.inflight.push_back(msg);
        }
    }

    /// Consume one flight quota slot
    pub(crate) fn decrement_quota(&mut self) {
        if self.inflight_quota > 0 {
            self.inflight_quota -= 1;
        }
    }

    /// Return one flight quota slot, clamped to the configured maximum
    pub(crate) fn increment_quota(&mut self) {
        if self.inflight_quota < self.inflight_maximum {
            self.inflight_quota += 1;
        }
    }

    /// Zero the counters and refill the quota ahead of a reconnect rebuild
    pub(crate) fn reset_for_reconnect(&mut self) {
        self.stats = DeliveryCounters::default();
        self.inflight_quota = self.inflight_maximum;
    }

    // Read-side accessors, mainly for callers enforcing limits and tests
    // asserting the counter invariants.

    pub fn counters(&self) -> &DeliveryCounters {
        &self.stats
    }

    pub fn inflight_maximum(&self) -> u16 {
        self.inflight_maximum
    }

    pub fn inflight_quota(&self) -> u16 {
        self.inflight_quota
    }

    pub fn inflight_len(&self) -> usize {
        self.inflight.len()
    }

    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    /// Iterate the inflight lane in delivery order
    pub fn inflight_iter(&self) -> impl Iterator<Item = &ClientMessage> {
        self.inflight.iter()
    }

    /// Iterate the queued lane in admission order
    pub fn queued_iter(&self) -> impl Iterator<Item = &ClientMessage> {
        self.queued.iter()
    }

    /// Recompute the counters from the lanes (diagnostics only)
    pub fn recount(&self) -> DeliveryCounters {
        let mut counters = DeliveryCounters::default();
        for msg in &self.inflight {
            counters.add_inflight(msg);
        }
        for msg in &self.queued {
            counters.add_queued(msg);
        }
        counters
    }
}
