//! Protocol vocabulary shared by the delivery core
//!
//! Only the types the delivery subsystem needs to track and hand to the
//! packet layer: QoS levels, protocol versions, message provenance, and the
//! message properties that survive from publish to delivery. Packet
//! encoding and decoding live outside this crate.

mod error;

pub use error::{DeliveryError, SendError};

use bytes::Bytes;

/// MQTT Protocol Version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ProtocolVersion {
    /// MQTT v3.1.1 (protocol level 4)
    V311 = 4,
    /// MQTT v5.0 (protocol level 5)
    V5 = 5,
}

impl ProtocolVersion {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            4 => Some(ProtocolVersion::V311),
            5 => Some(ProtocolVersion::V5),
            _ => None,
        }
    }
}

/// Quality of Service levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum QoS {
    /// At most once delivery
    #[default]
    AtMostOnce = 0,
    /// At least once delivery
    AtLeastOnce = 1,
    /// Exactly once delivery
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }

    /// Returns the minimum of two QoS levels (cap a delivery at the
    /// subscriber's granted maximum)
    pub fn min(self, other: Self) -> Self {
        if (self as u8) < (other as u8) {
            self
        } else {
            other
        }
    }
}

/// Where a message entered the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum MessageOrigin {
    /// Published by a connected client
    #[default]
    Client = 0,
    /// Generated by the broker itself ($SYS publishes, will messages)
    Broker = 1,
    /// Arrived over a bridge connection
    Bridge = 2,
}

impl MessageOrigin {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(MessageOrigin::Client),
            1 => Some(MessageOrigin::Broker),
            2 => Some(MessageOrigin::Bridge),
            _ => None,
        }
    }
}

/// Message properties that travel with a delivery (MQTT v5.0 subset)
///
/// The packet layer owns the full property table; the delivery core only
/// carries the publish-scoped properties it must forward unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    pub payload_format_indicator: Option<u8>,
    pub message_expiry_interval: Option<u32>,
    pub content_type: Option<String>,
    pub response_topic: Option<String>,
    pub correlation_data: Option<Bytes>,
    pub user_properties: Vec<(String, String)>,
}

impl Properties {
    pub fn is_empty(&self) -> bool {
        self.payload_format_indicator.is_none()
            && self.message_expiry_interval.is_none()
            && self.content_type.is_none()
            && self.response_topic.is_none()
            && self.correlation_data.is_none()
            && self.user_properties.is_empty()
    }
}
