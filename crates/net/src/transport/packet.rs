use crate::codec::{ByteStream, DecodeError};

pub const PROTOCOL_MAGIC: u32 = 0x4D45_5341;
pub const PROTOCOL_VERSION: u8 = 1;

/// Largest datagram the transport will send or accept. There is no
/// fragmentation; an oversized send is rejected at the API boundary.
pub const MAX_PACKET_SIZE: usize = 8192;

/// Serialized header size: magic + version + kind + channel + seq + ack + ack_bits.
pub const HEADER_SIZE: usize = 4 + 1 + 1 + 1 + 4 + 4 + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketKind {
    ConnectRequest = 0,
    ConnectAccept = 1,
    Disconnect = 2,
    DisconnectAck = 3,
    Keepalive = 4,
    Payload = 5,
}

impl TryFrom<u8> for PacketKind {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PacketKind::ConnectRequest),
            1 => Ok(PacketKind::ConnectAccept),
            2 => Ok(PacketKind::Disconnect),
            3 => Ok(PacketKind::DisconnectAck),
            4 => Ok(PacketKind::Keepalive),
            5 => Ok(PacketKind::Payload),
            other => Err(DecodeError::InvalidPacketKind(other)),
        }
    }
}

/// A single transport frame. Every packet, control or payload, carries the
/// sender's current ack state so acknowledgements piggyback for free.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: PacketKind,
    pub channel: u8,
    pub sequence: u32,
    pub ack: u32,
    pub ack_bits: u32,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn control(kind: PacketKind, ack: u32, ack_bits: u32) -> Self {
        Self {
            kind,
            channel: 0,
            sequence: 0,
            ack,
            ack_bits,
            payload: Vec::new(),
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut stream = ByteStream::with_capacity(HEADER_SIZE + self.payload.len());
        stream.write_u32(PROTOCOL_MAGIC);
        stream.write_u8(PROTOCOL_VERSION);
        stream.write_u8(self.kind as u8);
        stream.write_u8(self.channel);
        stream.write_u32(self.sequence);
        stream.write_u32(self.ack);
        stream.write_u32(self.ack_bits);
        stream.write_bytes(&self.payload);
        stream.into_bytes()
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, DecodeError> {
        let mut stream = ByteStream::from(data);
        if stream.read_u32()? != PROTOCOL_MAGIC {
            return Err(DecodeError::BadMagic);
        }
        let version = stream.read_u8()?;
        if version != PROTOCOL_VERSION {
            return Err(DecodeError::UnsupportedVersion(version));
        }
        let kind = PacketKind::try_from(stream.read_u8()?)?;
        let channel = stream.read_u8()?;
        let sequence = stream.read_u32()?;
        let ack = stream.read_u32()?;
        let ack_bits = stream.read_u32()?;
        let payload = stream.read_remaining();
        Ok(Self {
            kind,
            channel,
            sequence,
            ack,
            ack_bits,
            payload,
        })
    }
}

/// Wrapping sequence comparison: true when `s1` is more recent than `s2`,
/// treating a gap larger than half the space as wraparound.
pub fn sequence_greater_than(s1: u32, s2: u32) -> bool {
    ((s1 > s2) && (s1 - s2 <= u32::MAX / 2)) || ((s1 < s2) && (s2 - s1 > u32::MAX / 2))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let packet = Packet {
            kind: PacketKind::Payload,
            channel: 1,
            sequence: 1234,
            ack: 998,
            ack_bits: 0b1011,
            payload: vec![9, 8, 7],
        };
        let decoded = Packet::deserialize(&packet.serialize()).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = Packet::control(PacketKind::Keepalive, 0, 0).serialize();
        bytes[0] ^= 0xFF;
        assert_eq!(Packet::deserialize(&bytes), Err(DecodeError::BadMagic));
    }

    #[test]
    fn rejects_unknown_version() {
        let mut bytes = Packet::control(PacketKind::Keepalive, 0, 0).serialize();
        bytes[4] = 200;
        assert_eq!(
            Packet::deserialize(&bytes),
            Err(DecodeError::UnsupportedVersion(200))
        );
    }

    #[test]
    fn rejects_truncated_header() {
        let bytes = Packet::control(PacketKind::Keepalive, 0, 0).serialize();
        assert!(matches!(
            Packet::deserialize(&bytes[..HEADER_SIZE - 2]),
            Err(DecodeError::UnexpectedEof { .. })
        ));
    }

    #[test]
    fn test_sequence_comparison() {
        assert!(sequence_greater_than(2, 1));
        assert!(!sequence_greater_than(1, 2));
        assert!(!sequence_greater_than(1, 1));
        // wraparound
        assert!(sequence_greater_than(0, u32::MAX));
        assert!(!sequence_greater_than(u32::MAX, 0));
    }
}
