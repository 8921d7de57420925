//! Client/server state synchronization over a dual-channel UDP transport.
//!
//! The library is organized in layers:
//! - [`codec`]: big-endian byte streams with explicit float packing.
//! - [`message`]: the application message envelope.
//! - [`transport`]: connection handshake, reliable/unreliable channels,
//!   acks and retransmission over non-blocking UDP.
//! - [`client`] / [`server`]: connection endpoints with a request/response
//!   dispatcher on top of the message stream.
//! - [`snapshot`]: delay-windowed snapshot interpolation for smooth
//!   presentation of state received on the unreliable channel.

pub mod client;
pub mod codec;
pub mod error;
pub mod message;
pub mod server;
pub mod snapshot;
pub mod transport;

pub use client::{Client, CONNECTION_TIMEOUT_MS, SERVER_ID};
pub use codec::{ByteStream, DecodeError};
pub use error::NetError;
pub use message::{Message, MessageKind, RequestHandler, DEFAULT_PORT};
pub use server::{Server, MAX_CONNECTIONS};
pub use snapshot::{
    interpolate, Frame, FrameBuffer, Sample, Transform, INTERPOLATION_DELAY_US, STEPS_PER_SEC,
    STEP_DURATION_US,
};
pub use transport::{
    Delivery, Host, HostEvent, PeerHandle, MAX_PACKET_SIZE, RELIABLE_CHANNEL, UNRELIABLE_CHANNEL,
};
