//! Packet sink seam
//!
//! The delivery core never touches a socket. Everything it sends goes
//! through this trait, implemented by the connection writer; the writer
//! encodes and buffers the packet and reports back. A send either
//! completes, fails permanently for this client (`Oversize`), or fails
//! transiently, in which case the state machine stays put and the
//! connection's writability loop retries later.

use bytes::Bytes;

use crate::protocol::{Properties, QoS, SendError};

/// A PUBLISH handed to the packet layer.
///
/// Borrowed view over a delivery record and its stored message; the packet
/// layer encodes from it without taking ownership.
#[derive(Debug)]
pub struct PublishOut<'a> {
    pub mid: u16,
    pub topic: &'a str,
    pub payload: &'a Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
    pub subscription_identifier: Option<u32>,
    pub properties: &'a Properties,
    /// Absolute expiry instant (wall-clock seconds, 0 = none); the packet
    /// layer converts back to a remaining interval at send time
    pub expiry_time: u64,
}

/// Outbound packet interface of one client connection.
pub trait PacketSink {
    /// Whether the client currently has a live connection
    fn is_connected(&self) -> bool;

    /// Number of packets buffered for the socket but not yet written.
    /// Consulted when sizing the QoS 0 fast path.
    fn backlog(&self) -> usize {
        0
    }

    fn send_publish(&mut self, publish: PublishOut<'_>) -> Result<(), SendError>;

    fn send_pubrec(&mut self, mid: u16, reason: u8) -> Result<(), SendError>;

    fn send_pubrel(&mut self, mid: u16) -> Result<(), SendError>;
}
