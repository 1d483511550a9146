//! Delivery error types

use std::fmt;

/// Errors surfaced by delivery-core operations.
///
/// These map onto the MQTT reason the session layer reports back to the
/// peer: `Protocol` disconnects the client, `NotFound` is usually ignored
/// per the acknowledgement rules, the rest are internal outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    /// Caller passed an argument outside the operation's domain
    Invalid,
    /// Acknowledgement did not match the tracked message state or QoS
    Protocol,
    /// No tracked message with the given identifier
    NotFound,
    /// A stored message with this id already exists
    AlreadyExists,
    /// The subscription matcher found no receivers
    NoSubscribers,
    /// The packet sink refused a transmission; the affected message keeps
    /// its state and is retried on the next writability event
    Send(SendError),
}

impl fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invalid => write!(f, "invalid argument"),
            Self::Protocol => write!(f, "protocol violation"),
            Self::NotFound => write!(f, "message not found"),
            Self::AlreadyExists => write!(f, "message already exists"),
            Self::NoSubscribers => write!(f, "no subscribers"),
            Self::Send(e) => write!(f, "send failed: {}", e),
        }
    }
}

impl std::error::Error for DeliveryError {}

impl From<SendError> for DeliveryError {
    fn from(e: SendError) -> Self {
        DeliveryError::Send(e)
    }
}

/// Errors returned by the packet sink when the core asks it to transmit.
///
/// `Oversize` is a benign completion: the packet cannot ever be delivered
/// to this client, so the delivery record is discarded. Any other failure
/// leaves the message in place for a later retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// Packet exceeds the client's maximum packet size
    Oversize,
    /// Socket is not writable right now
    WouldBlock,
    /// Connection is gone
    Closed,
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Oversize => write!(f, "packet exceeds maximum packet size"),
            Self::WouldBlock => write!(f, "socket not writable"),
            Self::Closed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for SendError {}
