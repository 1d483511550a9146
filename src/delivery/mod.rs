//! Per-client message delivery
//!
//! The delivery core of the broker: for each client it tracks outstanding
//! publishes, sequences the QoS 1/2 handshakes, enforces inflight and queue
//! bounds, admits or drops messages under pressure, and carries messages
//! across reconnects and expiry.
//!
//! Every client owns one [`DeliveryQueues`], which holds two
//! [`DeliveryState`] lane pairs (incoming and outgoing). A delivery record
//! lives in exactly one of the four lanes at any time. All operations run
//! synchronously to completion on the owning session's task; the network is
//! only ever reached through the [`PacketSink`] seam.

mod accounting;
mod acks;
mod admission;
mod expiry;
mod message;
mod reconnect;
mod sink;
mod state;
mod writer;


pub use accounting::DeliveryCounters;
pub use message::{ClientMessage, Direction, MessageState};
pub use sink::{PacketSink, PublishOut};
pub use state::DeliveryState;

use std::sync::Arc;

use tracing::warn;

use crate::config::DeliveryConfig;
use crate::metrics::Metrics;
use crate::persistence::{PersistenceOp, Persister, StoredBaseMessage, StoredClientMessage};
use crate::protocol::{DeliveryError, ProtocolVersion, QoS};
use crate::store::{BaseMessage, MessageStore};

/// Outcome of an insert operation.
///
/// `Dropped` is not an error: the caller carries on, the message simply was
/// not admitted for this client. Admission refusals are observable through
/// [`DeliveryQueues::is_dropping`] and the dropped-messages counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Accepted,
    Dropped,
}

/// Delivery behavior of a bridge connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeBehavior {
    /// Lazy bridges keep queueing QoS 0 while the remote end is down
    pub lazy: bool,
    /// The local session is started clean, so nothing is queued offline
    pub clean_start_local: bool,
}

pub(crate) type PersistTarget = Option<(Arc<dyn Persister>, Arc<str>)>;

pub(crate) fn persist_record_add(
    target: &PersistTarget,
    base: &Arc<BaseMessage>,
    msg: &ClientMessage,
) {
    if let Some((persister, client_id)) = target {
        persister.persist(PersistenceOp::BaseMessageAdd {
            message: StoredBaseMessage::from(base.as_ref()),
        });
        persister.persist(PersistenceOp::ClientMessageAdd {
            client_id: client_id.to_string(),
            message: StoredClientMessage::from_client_message(msg),
        });
    }
}

pub(crate) fn persist_record_update(target: &PersistTarget, msg: &ClientMessage) {
    if let Some((persister, client_id)) = target {
        persister.persist(PersistenceOp::ClientMessageUpdate {
            client_id: client_id.to_string(),
            cmsg_id: msg.cmsg_id,
            state: msg.state as u8,
            dup: msg.dup,
        });
    }
}

pub(crate) fn persist_record_delete(target: &PersistTarget, cmsg_id: u64) {
    if let Some((persister, client_id)) = target {
        persister.persist(PersistenceOp::ClientMessageDelete {
            client_id: client_id.to_string(),
            cmsg_id,
        });
    }
}

/// Per-client delivery queues for both directions, plus the client
/// attributes admission and suppression depend on.
pub struct DeliveryQueues {
    client_id: Arc<str>,
    protocol_version: ProtocolVersion,
    /// Ceiling on the QoS this client is granted
    max_qos: QoS,
    config: Arc<DeliveryConfig>,
    pub(crate) msgs_in: DeliveryState,
    pub(crate) msgs_out: DeliveryState,
    last_cmsg_id: u64,
    /// Latched on the first admission refusal; suppresses log flooding
    is_dropping: bool,
    /// Whether this client's session (and so its delivery records) is
    /// written to the persistence backend
    persisted: bool,
    bridge: Option<BridgeBehavior>,
    persister: Option<Arc<dyn Persister>>,
    metrics: Option<Arc<Metrics>>,
}

impl DeliveryQueues {
    pub fn new(
        client_id: Arc<str>,
        protocol_version: ProtocolVersion,
        max_qos: QoS,
        config: Arc<DeliveryConfig>,
    ) -> Self {
        let inflight_maximum = config.max_inflight_messages;
        Self {
            client_id,
            protocol_version,
            max_qos,
            config,
            msgs_in: DeliveryState::new(inflight_maximum),
            msgs_out: DeliveryState::new(inflight_maximum),
            last_cmsg_id: 0,
            is_dropping: false,
            persisted: false,
            bridge: None,
            persister: None,
            metrics: None,
        }
    }

    pub fn with_persister(mut self, persister: Arc<dyn Persister>) -> Self {
        self.persister = Some(persister);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_bridge(mut self, bridge: BridgeBehavior) -> Self {
        self.bridge = Some(bridge);
        self
    }

    /// Mark whether this client's delivery records are persisted
    pub fn set_persisted(&mut self, persisted: bool) {
        self.persisted = persisted;
    }

    /// Override the flight window for one direction (a v5 peer announces
    /// its receive maximum at CONNECT time)
    pub fn set_inflight_maximum(&mut self, direction: Direction, maximum: u16) {
        let state = self.direction_mut(direction);
        state.inflight_maximum = maximum;
        state.inflight_quota = maximum;
    }

    pub fn client_id(&self) -> &Arc<str> {
        &self.client_id
    }

    pub fn is_dropping(&self) -> bool {
        self.is_dropping
    }

    pub fn state(&self, direction: Direction) -> &DeliveryState {
        match direction {
            Direction::In => &self.msgs_in,
            Direction::Out => &self.msgs_out,
        }
    }

    pub(crate) fn direction_mut(&mut self, direction: Direction) -> &mut DeliveryState {
        match direction {
            Direction::In => &mut self.msgs_in,
            Direction::Out => &mut self.msgs_out,
        }
    }

    fn next_cmsg_id(&mut self) -> u64 {
        self.last_cmsg_id += 1;
        self.last_cmsg_id
    }

    pub(crate) fn persist_target(&self) -> PersistTarget {
        if !self.persisted {
            return None;
        }
        self.persister
            .as_ref()
            .map(|p| (p.clone(), self.client_id.clone()))
    }

    fn is_lazy_bridge(&self) -> bool {
        self.bridge.is_some_and(|b| b.lazy)
    }

    /// Record an admission refusal: latch `is_dropping`, log the first
    /// refusal, and bump the global counter.
    fn drop_message(&mut self, direction: Direction) -> InsertOutcome {
        if !self.is_dropping {
            self.is_dropping = true;
            match direction {
                Direction::Out => warn!(
                    client_id = %self.client_id,
                    "outgoing messages are being dropped"
                ),
                Direction::In => warn!(
                    client_id = %self.client_id,
                    "incoming messages are being dropped"
                ),
            }
        }
        if let Some(metrics) = &self.metrics {
            metrics.messages_dropped_total.inc();
        }
        InsertOutcome::Dropped
    }

    /// Queue an outgoing delivery of `base` for this client.
    ///
    /// Called once per matching subscriber when a publish fans out. Decides
    /// between the inflight lane, the queued lane, and a drop; a `cmsg_id`
    /// of 0 asks for the next per-client id. When `update` is set and the
    /// client is connected, the writer is drained so freshly admitted
    /// messages go out immediately.
    #[allow(clippy::too_many_arguments)]
    pub fn insert_outgoing(
        &mut self,
        sink: &mut dyn PacketSink,
        store: &MessageStore,
        cmsg_id: u64,
        mid: u16,
        qos: QoS,
        retain: bool,
        base: &Arc<BaseMessage>,
        subscription_identifier: Option<u32>,
        update: bool,
        persist: bool,
    ) -> Result<InsertOutcome, DeliveryError> {
        let connected = sink.is_connected();

        // A v3.1.1 client subscribed to overlapping filters gets a single
        // copy unless duplicates are explicitly allowed. Retained deliveries
        // are always distinct.
        if self.protocol_version == ProtocolVersion::V311
            && !self.config.allow_duplicate_messages
            && !retain
            && base.was_delivered_to(&self.client_id)
        {
            return Ok(InsertOutcome::Accepted);
        }

        if !connected {
            if self.bridge.is_some_and(|b| b.clean_start_local) {
                return Ok(self.drop_message(Direction::Out));
            }
            if qos == QoS::AtMostOnce
                && !self.config.queue_qos0_messages
                && !self.is_lazy_bridge()
            {
                return Ok(self.drop_message(Direction::Out));
            }
        }

        let qos = qos.min(self.max_qos);

        let state = if connected {
            if self.ready_for_flight(Direction::Out, qos, sink) {
                MessageState::publish_for(qos)
            } else if qos != QoS::AtMostOnce && self.ready_for_queue(Direction::Out, qos, sink) {
                MessageState::Queued
            } else {
                return Ok(self.drop_message(Direction::Out));
            }
        } else if self.ready_for_queue(Direction::Out, qos, sink) {
            MessageState::Queued
        } else {
            return Ok(self.drop_message(Direction::Out));
        };

        let cmsg_id = if cmsg_id == 0 {
            self.next_cmsg_id()
        } else {
            self.last_cmsg_id = self.last_cmsg_id.max(cmsg_id);
            cmsg_id
        };

        store.ref_inc(base);
        let msg = ClientMessage {
            base: base.clone(),
            cmsg_id,
            mid,
            direction: Direction::Out,
            state,
            qos,
            dup: false,
            retain,
            subscription_identifier,
        };

        if persist {
            persist_record_add(&self.persist_target(), base, &msg);
        }

        if !retain && !self.config.allow_duplicate_messages {
            base.mark_delivered(&self.client_id);
        }

        let inflight = state != MessageState::Queued;
        if inflight {
            self.msgs_out.push_inflight(msg);
            if qos != QoS::AtMostOnce {
                self.msgs_out.decrement_quota();
            }
        } else {
            self.msgs_out.push_queued(msg);
        }
        self.is_dropping = false;

        if update && connected {
            self.write_queued_out(sink);
            self.write_inflight_out_latest(sink, store)?;
        }
        Ok(InsertOutcome::Accepted)
    }

    /// Track an incoming QoS 2 publish until its PUBREL arrives.
    ///
    /// The record enters the incoming inflight lane in `WaitForPubrel` (the
    /// session layer sends the PUBREC) or waits in the queued lane until the
    /// receive window has room, in which case [`Self::write_queued_in`]
    /// sends the PUBREC later. The record's `mid` is the publisher's wire
    /// packet id, which is what the PUBREL will carry.
    pub fn insert_incoming(
        &mut self,
        sink: &mut dyn PacketSink,
        store: &MessageStore,
        cmsg_id: u64,
        base: &Arc<BaseMessage>,
        persist: bool,
    ) -> Result<InsertOutcome, DeliveryError> {
        let qos = base.qos.min(self.max_qos);
        if qos != QoS::ExactlyOnce {
            return Err(DeliveryError::Invalid);
        }

        let state = if self.ready_for_flight(Direction::In, qos, sink) {
            MessageState::WaitForPubrel
        } else if self.ready_for_queue(Direction::In, qos, sink) {
            MessageState::Queued
        } else {
            return Ok(self.drop_message(Direction::In));
        };

        let cmsg_id = if cmsg_id == 0 {
            self.next_cmsg_id()
        } else {
            self.last_cmsg_id = self.last_cmsg_id.max(cmsg_id);
            cmsg_id
        };

        store.ref_inc(base);
        let msg = ClientMessage {
            base: base.clone(),
            cmsg_id,
            mid: base.source_mid,
            direction: Direction::In,
            state,
            qos,
            dup: false,
            retain: base.retain,
            subscription_identifier: None,
        };

        if persist {
            persist_record_add(&self.persist_target(), base, &msg);
        }

        if state == MessageState::Queued {
            self.msgs_in.push_queued(msg);
        } else {
            self.msgs_in.push_inflight(msg);
            self.msgs_in.decrement_quota();
        }
        self.is_dropping = false;
        Ok(InsertOutcome::Accepted)
    }

    /// Rebuild a delivery record from the persistence backend.
    ///
    /// No admission, no notifications: the record goes straight into the
    /// lane its stored state names. Callers run
    /// [`Self::reconnect_reset`] afterwards to renormalize counters, states,
    /// and quotas.
    pub fn insert_restored(
        &mut self,
        record: &StoredClientMessage,
        base: Arc<BaseMessage>,
        store: &MessageStore,
    ) -> Result<(), DeliveryError> {
        let state = MessageState::from_u8(record.state).ok_or(DeliveryError::Invalid)?;
        let qos = QoS::from_u8(record.qos).ok_or(DeliveryError::Invalid)?;
        let direction = Direction::from_u8(record.direction).ok_or(DeliveryError::Invalid)?;

        store.ref_inc(&base);
        let msg = ClientMessage {
            base,
            cmsg_id: record.cmsg_id,
            mid: record.mid,
            direction,
            state,
            qos,
            dup: record.dup,
            retain: record.retain,
            subscription_identifier: record.subscription_identifier,
        };
        self.last_cmsg_id = self.last_cmsg_id.max(record.cmsg_id);

        let lane = self.direction_mut(direction);
        if state == MessageState::Queued {
            lane.push_queued(msg);
        } else {
            lane.push_inflight(msg);
        }
        Ok(())
    }

    /// Release every delivery record in both directions.
    ///
    /// Session teardown path: persisted records are deleted from the
    /// backend and every store reference is returned.
    pub fn delete_all(&mut self, store: &MessageStore) {
        self.delete_all_incoming(store);
        self.delete_all_outgoing(store);
    }

    /// Release every incoming delivery record
    pub fn delete_all_incoming(&mut self, store: &MessageStore) {
        let target = self.persist_target();
        Self::clear_direction(&mut self.msgs_in, store, &target);
    }

    /// Release every outgoing delivery record
    pub fn delete_all_outgoing(&mut self, store: &MessageStore) {
        let target = self.persist_target();
        Self::clear_direction(&mut self.msgs_out, store, &target);
    }

    fn clear_direction(state: &mut DeliveryState, store: &MessageStore, target: &PersistTarget) {
        for msg in state.inflight.drain(..).chain(state.queued.drain(..)) {
            persist_record_delete(target, msg.cmsg_id);
            store.ref_dec(msg.base);
        }
        state.reset_for_reconnect();
    }

    /// Remove a record from an inflight lane, returning its flight quota
    /// slot for QoS 1/2 and releasing its store reference.
    pub(crate) fn finish_inflight_removal(
        &mut self,
        direction: Direction,
        idx: usize,
        store: &MessageStore,
    ) {
        let target = self.persist_target();
        let state = self.direction_mut(direction);
        let msg = state.remove_inflight_at(idx);
        if msg.qos != QoS::AtMostOnce {
            state.increment_quota();
        }
        persist_record_delete(&target, msg.cmsg_id);
        store.ref_dec(msg.base);
    }
}
