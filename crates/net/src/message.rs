use crate::codec::{ByteStream, DecodeError};

/// Default port the server listens on.
pub const DEFAULT_PORT: u16 = 7000;

/// Application-level message categories.
///
/// `Connect` and `Disconnect` are synthesized locally from transport
/// lifecycle events; peers never need to send them, though decoding them off
/// the wire is tolerated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Connect = 0,
    Disconnect = 1,
    Data = 2,
    DataRequest = 3,
    DataResponse = 4,
}

impl TryFrom<u8> for MessageKind {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageKind::Connect),
            1 => Ok(MessageKind::Disconnect),
            2 => Ok(MessageKind::Data),
            3 => Ok(MessageKind::DataRequest),
            4 => Ok(MessageKind::DataResponse),
            other => Err(DecodeError::InvalidMessageKind(other)),
        }
    }
}

/// Handler invoked for an incoming request: `(sender_id, payload) -> response`.
pub type RequestHandler = Box<dyn FnMut(u32, &[u8]) -> Vec<u8> + Send>;

/// The envelope every application payload travels in.
///
/// Wire layout: `[peer_id: u32][request_id: u32][kind: u8][payload...]`.
/// On receive, `peer_id` is overwritten with the receiver's stable id for the
/// sender, so application code never trusts the value a peer wrote there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub peer_id: u32,
    pub request_id: u32,
    pub kind: MessageKind,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(peer_id: u32, request_id: u32, kind: MessageKind, payload: Vec<u8>) -> Self {
        Self {
            peer_id,
            request_id,
            kind,
            payload,
        }
    }

    /// A payload-less lifecycle event for the given peer.
    pub fn event(peer_id: u32, kind: MessageKind) -> Self {
        Self::new(peer_id, 0, kind, Vec::new())
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut stream = ByteStream::with_capacity(9 + self.payload.len());
        stream.write_u32(self.peer_id);
        stream.write_u32(self.request_id);
        stream.write_u8(self.kind as u8);
        stream.write_bytes(&self.payload);
        stream.into_bytes()
    }

    pub fn deserialize(stream: &mut ByteStream) -> Result<Self, DecodeError> {
        let peer_id = stream.read_u32()?;
        let request_id = stream.read_u32()?;
        let kind = MessageKind::try_from(stream.read_u8()?)?;
        let payload = stream.read_remaining();
        Ok(Self {
            peer_id,
            request_id,
            kind,
            payload,
        })
    }
}
