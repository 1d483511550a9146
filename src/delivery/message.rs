//! Per-client delivery records

use std::sync::Arc;

use crate::protocol::QoS;
use crate::store::BaseMessage;

/// Direction of a delivery relative to the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Direction {
    /// From peer to broker
    In = 0,
    /// From broker to peer
    Out = 1,
}

impl Direction {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Direction::In),
            1 => Some(Direction::Out),
            _ => None,
        }
    }
}

/// Delivery state machine positions.
///
/// A record starts in one of the `Publish*` states (or `Queued` when
/// admission routes it to the backlog) and advances through the
/// acknowledgement states as the QoS 1/2 handshake progresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageState {
    /// PUBLISH due to be sent, fire and forget
    PublishQos0 = 0,
    /// PUBLISH due to be sent, expecting PUBACK
    PublishQos1 = 1,
    /// PUBLISH due to be sent, expecting PUBREC
    PublishQos2 = 2,
    /// PUBLISH sent, awaiting PUBACK
    WaitForPuback = 3,
    /// PUBLISH sent, awaiting PUBREC
    WaitForPubrec = 4,
    /// PUBREC due to be sent
    SendPubrec = 5,
    /// PUBREC sent, awaiting PUBREL
    WaitForPubrel = 6,
    /// PUBREL due to be resent after session resumption
    ResendPubrel = 7,
    /// PUBREL sent, awaiting PUBCOMP
    WaitForPubcomp = 8,
    /// PUBCOMP due to be resent
    ResendPubcomp = 9,
    /// Admitted but not yet eligible for the inflight window
    Queued = 10,
    Invalid = 11,
}

impl MessageState {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(MessageState::PublishQos0),
            1 => Some(MessageState::PublishQos1),
            2 => Some(MessageState::PublishQos2),
            3 => Some(MessageState::WaitForPuback),
            4 => Some(MessageState::WaitForPubrec),
            5 => Some(MessageState::SendPubrec),
            6 => Some(MessageState::WaitForPubrel),
            7 => Some(MessageState::ResendPubrel),
            8 => Some(MessageState::WaitForPubcomp),
            9 => Some(MessageState::ResendPubcomp),
            10 => Some(MessageState::Queued),
            11 => Some(MessageState::Invalid),
            _ => None,
        }
    }

    /// Whether this is one of the initial publish states
    pub fn is_publish(self) -> bool {
        matches!(
            self,
            MessageState::PublishQos0 | MessageState::PublishQos1 | MessageState::PublishQos2
        )
    }

    /// The initial publish state for a delivery of the given QoS
    pub fn publish_for(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => MessageState::PublishQos0,
            QoS::AtLeastOnce => MessageState::PublishQos1,
            QoS::ExactlyOnce => MessageState::PublishQos2,
        }
    }
}

/// One delivery attempt of a stored message, bound to a single client and
/// direction. Holds a counted reference on its [`BaseMessage`]; the
/// reference is released through the store when the record is removed.
#[derive(Debug)]
pub struct ClientMessage {
    pub base: Arc<BaseMessage>,
    /// Per-client monotonic id, stable across restarts
    pub cmsg_id: u64,
    /// Wire packet id used in acknowledgements
    pub mid: u16,
    pub direction: Direction,
    pub state: MessageState,
    /// Effective QoS of this delivery (base QoS capped by the client)
    pub qos: QoS,
    pub dup: bool,
    pub retain: bool,
    pub subscription_identifier: Option<u32>,
}

impl ClientMessage {
    /// Payload size used for the byte budgets
    pub fn payload_len(&self) -> usize {
        self.base.payload.len()
    }
}
