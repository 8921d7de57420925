use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::codec::ByteStream;
use crate::error::NetError;
use crate::message::{Message, MessageKind, RequestHandler};
use crate::transport::{Delivery, Host, HostEvent, PeerHandle};

/// Peer slot capacity of a running server.
pub const MAX_CONNECTIONS: usize = 64;

const STOP_TIMEOUT_MS: u64 = 5000;

/// Listens for client connections and exchanges messages with them.
///
/// Clients are addressed by their stable incoming id, never by transport
/// slot; the id map is updated from lifecycle events before they are
/// surfaced, so an id returned from `poll` is always valid for `send` until
/// the matching disconnect is observed.
pub struct Server {
    host: Option<Host>,
    peers: HashMap<u32, PeerHandle>,
    handlers: HashMap<u32, RequestHandler>,
}

impl Server {
    pub fn new() -> Self {
        Self {
            host: None,
            peers: HashMap::new(),
            handlers: HashMap::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.host.is_some()
    }

    pub fn num_clients(&self) -> usize {
        self.peers.len()
    }

    pub fn client_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.peers.keys().copied()
    }

    /// Registers a handler answering incoming requests of `type_id`.
    pub fn on(&mut self, type_id: u32, handler: RequestHandler) {
        self.handlers.insert(type_id, handler);
    }

    /// Binds the listening socket. A bind failure is fatal to the caller;
    /// nothing else about the server can work without it.
    pub fn start(&mut self, port: u16) -> Result<(), NetError> {
        if self.host.is_some() {
            return Ok(());
        }
        let mut host = Host::bind(("0.0.0.0", port), MAX_CONNECTIONS).map_err(NetError::Bind)?;
        host.set_accept_incoming(true);
        info!("listening on port {}", port);
        self.host = Some(host);
        Ok(())
    }

    /// Stops the server, disconnecting every client gracefully and waiting
    /// (bounded) for their acknowledgements. Stragglers are forcibly reset
    /// and `UnacknowledgedDisconnect` is returned. Idempotent.
    pub fn stop(&mut self) -> Result<(), NetError> {
        let Some(mut host) = self.host.take() else {
            return Ok(());
        };
        info!("stopping, disconnecting {} clients", self.peers.len());

        for &handle in self.peers.values() {
            host.disconnect(handle);
        }

        let deadline = Instant::now() + Duration::from_millis(STOP_TIMEOUT_MS);
        while !self.peers.is_empty() {
            for event in host.service() {
                match event {
                    HostEvent::Disconnect { id, .. } => {
                        self.peers.remove(&id);
                    }
                    HostEvent::Connect { peer, .. } => {
                        // a client that races the shutdown is turned away
                        host.disconnect(peer);
                    }
                    HostEvent::Receive { id, .. } => {
                        debug!("discarding message from {} during shutdown", id);
                    }
                }
            }
            if Instant::now() >= deadline {
                warn!(
                    "{} clients did not acknowledge disconnect, resetting",
                    self.peers.len()
                );
                for (_, handle) in self.peers.drain() {
                    host.reset(handle);
                }
                return Err(NetError::UnacknowledgedDisconnect);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        Ok(())
    }

    /// Sends a `Data` message to one client. An unknown id is logged and
    /// reported but otherwise harmless.
    pub fn send(&mut self, id: u32, delivery: Delivery, payload: Vec<u8>) -> Result<(), NetError> {
        let message = Message::new(0, 0, MessageKind::Data, payload);
        self.send_message(id, &message, delivery)
    }

    fn send_message(
        &mut self,
        id: u32,
        message: &Message,
        delivery: Delivery,
    ) -> Result<(), NetError> {
        let host = self.host.as_mut().ok_or(NetError::NotConnected)?;
        let Some(&handle) = self.peers.get(&id) else {
            warn!("send to unknown client id {}", id);
            return Err(NetError::UnknownPeer(id));
        };
        host.send(handle, delivery.channel(), &message.serialize())
            .map_err(NetError::Transport)
    }

    /// Sends a `Data` message to every connected client. Serializes once;
    /// a no-op with zero clients.
    pub fn broadcast(&mut self, delivery: Delivery, payload: Vec<u8>) -> Result<(), NetError> {
        let host = self.host.as_mut().ok_or(NetError::NotConnected)?;
        if self.peers.is_empty() {
            return Ok(());
        }
        let data = Message::new(0, 0, MessageKind::Data, payload).serialize();
        host.broadcast(delivery.channel(), &data);
        Ok(())
    }

    /// Non-blocking drain of everything that happened since the last call.
    /// Connects and disconnects appear as synthesized `Connect`/`Disconnect`
    /// messages carrying the client's id; requests with a registered handler
    /// are answered inline and still surfaced.
    pub fn poll(&mut self) -> Vec<Message> {
        let mut messages = Vec::new();
        let Some(host) = self.host.as_mut() else {
            return messages;
        };

        for event in host.service() {
            match event {
                HostEvent::Connect { peer, id } => {
                    info!("client {} connected from {:?}", id, host.peer_addr(peer));
                    self.peers.insert(id, peer);
                    messages.push(Message::event(id, MessageKind::Connect));
                }
                HostEvent::Disconnect { id, .. } => {
                    info!("client {} disconnected", id);
                    self.peers.remove(&id);
                    messages.push(Message::event(id, MessageKind::Disconnect));
                }
                HostEvent::Receive { peer, id, data, .. } => {
                    let mut stream = ByteStream::from_bytes(data);
                    let mut message = match Message::deserialize(&mut stream) {
                        Ok(message) => message,
                        Err(e) => {
                            warn!("dropping undecodable message from {}: {}", id, e);
                            continue;
                        }
                    };
                    message.peer_id = id;
                    if message.kind == MessageKind::DataRequest {
                        answer_request(host, &mut self.handlers, peer, &message);
                    }
                    messages.push(message);
                }
            }
        }
        messages
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

fn answer_request(
    host: &mut Host,
    handlers: &mut HashMap<u32, RequestHandler>,
    peer: PeerHandle,
    request: &Message,
) {
    let mut stream = ByteStream::from_bytes(request.payload.clone());
    let type_id = match stream.read_u32() {
        Ok(type_id) => type_id,
        Err(e) => {
            warn!(
                "dropping request without a type id from {}: {}",
                request.peer_id, e
            );
            return;
        }
    };
    let body = stream.read_remaining();
    let Some(handler) = handlers.get_mut(&type_id) else {
        debug!("no handler for request type {}", type_id);
        return;
    };
    let response = handler(request.peer_id, &body);
    let reply = Message::new(0, request.request_id, MessageKind::DataResponse, response);
    if let Err(e) = host.send(peer, Delivery::Reliable.channel(), &reply.serialize()) {
        warn!("failed to send response to {}: {}", request.peer_id, e);
    }
}
