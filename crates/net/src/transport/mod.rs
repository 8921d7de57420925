//! Dual-channel datagram transport over a non-blocking UDP socket.
//!
//! Channel 0 carries reliable, ordered payloads (ack bitfields, RTO-driven
//! retransmission, in-order delivery). Channel 1 carries fire-and-forget
//! payloads that still feed the ack state but are never resent or reordered.

mod channel;
mod host;
mod packet;

pub use host::{Host, HostEvent, PeerHandle, PeerState};
pub use packet::{
    sequence_greater_than, Packet, PacketKind, MAX_PACKET_SIZE, PROTOCOL_MAGIC, PROTOCOL_VERSION,
};

pub const NUM_CHANNELS: u8 = 2;
pub const RELIABLE_CHANNEL: u8 = 0;
pub const UNRELIABLE_CHANNEL: u8 = 1;

/// Delivery guarantee requested for an outgoing payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Retransmitted until acknowledged, delivered in send order.
    Reliable,
    /// Sent once; may be lost, duplicated at the network level, or reordered.
    Unreliable,
}

impl Delivery {
    pub fn channel(self) -> u8 {
        match self {
            Delivery::Reliable => RELIABLE_CHANNEL,
            Delivery::Unreliable => UNRELIABLE_CHANNEL,
        }
    }
}
