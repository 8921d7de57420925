use std::io;

use crate::codec::DecodeError;

/// Errors surfaced by the client and server connection layers.
///
/// Per-message problems inside a poll drain (malformed datagrams, decode
/// failures) are logged and dropped rather than propagated; only conditions
/// the caller can act on appear here.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("failed to bind socket: {0}")]
    Bind(io::Error),

    #[error("transport error: {0}")]
    Transport(io::Error),

    #[error("connection attempt timed out")]
    ConnectTimeout,

    #[error("not connected")]
    NotConnected,

    #[error("peer did not acknowledge disconnect; connection was reset")]
    UnacknowledgedDisconnect,

    #[error("request {0} timed out")]
    RequestTimeout(u32),

    #[error("unknown peer id: {0}")]
    UnknownPeer(u32),

    #[error(transparent)]
    Decode(#[from] DecodeError),
}
