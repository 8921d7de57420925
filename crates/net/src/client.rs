use std::collections::{HashMap, VecDeque};
use std::net::ToSocketAddrs;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::codec::ByteStream;
use crate::error::NetError;
use crate::message::{Message, MessageKind, RequestHandler};
use crate::transport::{Delivery, Host, HostEvent, PeerHandle};

/// How long `connect` and `disconnect` wait before giving up.
pub const CONNECTION_TIMEOUT_MS: u64 = 5000;

/// Poll cadence inside a blocking `request` wait.
const REQUEST_INTERVAL: Duration = Duration::from_micros(1_000_000 / 60);

/// The id a client sees for the server end of its connection.
pub const SERVER_ID: u32 = 0;

/// One connection to a server, with a synchronous request/response layer on
/// top of the message stream.
pub struct Client {
    host: Host,
    server: Option<PeerHandle>,
    handlers: HashMap<u32, RequestHandler>,
    queue: VecDeque<Message>,
    next_request_id: u32,
    request_timeout: Duration,
}

impl Client {
    pub fn new() -> Result<Self, NetError> {
        let host = Host::bind("0.0.0.0:0", 1).map_err(NetError::Bind)?;
        Ok(Self {
            host,
            server: None,
            handlers: HashMap::new(),
            queue: VecDeque::new(),
            next_request_id: 1,
            request_timeout: Duration::from_millis(CONNECTION_TIMEOUT_MS),
        })
    }

    /// Connects to a server, blocking until the handshake completes or
    /// [`CONNECTION_TIMEOUT_MS`] elapses. Ok and a no-op when already
    /// connected.
    pub fn connect(&mut self, host: &str, port: u16) -> Result<(), NetError> {
        if self.is_connected() {
            return Ok(());
        }

        // the local socket is IPv4, so only IPv4 resolutions are usable
        let addr = (host, port)
            .to_socket_addrs()
            .map_err(NetError::Transport)?
            .find(|a| a.is_ipv4())
            .ok_or_else(|| {
                NetError::Transport(std::io::Error::other(format!(
                    "{} did not resolve to a usable address",
                    host
                )))
            })?;
        let handle = self.host.connect(addr).map_err(NetError::Transport)?;

        let deadline = Instant::now() + Duration::from_millis(CONNECTION_TIMEOUT_MS);
        loop {
            for event in self.host.service() {
                if let HostEvent::Connect { peer, .. } = event {
                    if peer == handle {
                        info!("connected to {}", addr);
                        self.server = Some(handle);
                        return Ok(());
                    }
                }
            }
            if Instant::now() >= deadline {
                self.host.reset(handle);
                return Err(NetError::ConnectTimeout);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Gracefully disconnects, draining until the remote acknowledges. If
    /// the acknowledgement never arrives the connection is forcibly reset
    /// and `UnacknowledgedDisconnect` is returned. Ok when not connected.
    pub fn disconnect(&mut self) -> Result<(), NetError> {
        let Some(handle) = self.server.take() else {
            return Ok(());
        };
        self.queue.clear();
        self.host.disconnect(handle);

        let deadline = Instant::now() + Duration::from_millis(CONNECTION_TIMEOUT_MS);
        loop {
            for event in self.host.service() {
                match event {
                    HostEvent::Disconnect { peer, .. } if peer == handle => {
                        info!("disconnected");
                        return Ok(());
                    }
                    // data arriving mid-shutdown is discarded
                    _ => {}
                }
            }
            if Instant::now() >= deadline {
                warn!("disconnect not acknowledged, resetting connection");
                self.host.reset(handle);
                return Err(NetError::UnacknowledgedDisconnect);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    pub fn is_connected(&self) -> bool {
        self.server.is_some()
    }

    /// Round-trip time estimate to the server, in milliseconds.
    pub fn rtt_ms(&self) -> Option<f32> {
        self.server.and_then(|h| self.host.peer_rtt_ms(h))
    }

    /// Overrides the request/response deadline (mainly for tests).
    pub fn set_request_timeout(&mut self, timeout: Duration) {
        self.request_timeout = timeout;
    }

    /// Registers a handler answering incoming requests of `type_id`.
    pub fn on(&mut self, type_id: u32, handler: RequestHandler) {
        self.handlers.insert(type_id, handler);
    }

    /// Non-blocking drain. Messages captured while a `request` was waiting
    /// come out first, in arrival order, then freshly received ones.
    pub fn poll(&mut self) -> Vec<Message> {
        let mut messages: Vec<Message> = self.queue.drain(..).collect();
        messages.extend(self.drain_transport());
        messages
    }

    fn drain_transport(&mut self) -> Vec<Message> {
        let mut messages = Vec::new();
        if self.server.is_none() {
            return messages;
        }

        for event in self.host.service() {
            match event {
                HostEvent::Receive { data, .. } => {
                    let mut stream = ByteStream::from_bytes(data);
                    let mut message = match Message::deserialize(&mut stream) {
                        Ok(message) => message,
                        Err(e) => {
                            warn!("dropping undecodable message: {}", e);
                            continue;
                        }
                    };
                    message.peer_id = SERVER_ID;
                    if message.kind == MessageKind::DataRequest {
                        self.answer_request(&message);
                    }
                    messages.push(message);
                }
                HostEvent::Disconnect { .. } => {
                    info!("server closed the connection");
                    self.server = None;
                    messages.push(Message::event(SERVER_ID, MessageKind::Disconnect));
                    break;
                }
                HostEvent::Connect { .. } => {}
            }
        }
        messages
    }

    fn answer_request(&mut self, request: &Message) {
        let mut stream = ByteStream::from_bytes(request.payload.clone());
        let type_id = match stream.read_u32() {
            Ok(type_id) => type_id,
            Err(e) => {
                warn!("dropping request without a type id: {}", e);
                return;
            }
        };
        let body = stream.read_remaining();
        let Some(handler) = self.handlers.get_mut(&type_id) else {
            debug!("no handler for request type {}", type_id);
            return;
        };
        let response = handler(request.peer_id, &body);
        let reply = Message::new(0, request.request_id, MessageKind::DataResponse, response);
        if let Err(e) = self.send_message(&reply, Delivery::Reliable) {
            warn!("failed to send response: {}", e);
        }
    }

    /// Sends a `Data` message with the chosen delivery guarantee.
    pub fn send(&mut self, delivery: Delivery, payload: Vec<u8>) -> Result<(), NetError> {
        let message = Message::new(0, 0, MessageKind::Data, payload);
        self.send_message(&message, delivery)
    }

    fn send_message(&mut self, message: &Message, delivery: Delivery) -> Result<(), NetError> {
        let handle = self.server.ok_or(NetError::NotConnected)?;
        self.host
            .send(handle, delivery.channel(), &message.serialize())
            .map_err(NetError::Transport)
    }

    /// Sends a request and blocks until the matching response arrives or the
    /// request timeout elapses. Every other message received while waiting
    /// is queued for the next `poll`, in order; none are lost. A response
    /// that arrives after the timeout shows up as an unmatched message in a
    /// later `poll`.
    pub fn request(&mut self, type_id: u32, payload: &[u8]) -> Result<Message, NetError> {
        if self.server.is_none() {
            return Err(NetError::NotConnected);
        }

        let request_id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1);
        if self.next_request_id == 0 {
            self.next_request_id = 1;
        }

        let mut stream = ByteStream::with_capacity(4 + payload.len());
        stream.write_u32(type_id);
        stream.write_bytes(payload);
        let message = Message::new(0, request_id, MessageKind::DataRequest, stream.into_bytes());
        self.send_message(&message, Delivery::Reliable)?;

        let deadline = Instant::now() + self.request_timeout;
        loop {
            let mut matched = None;
            for message in self.drain_transport() {
                if matched.is_none()
                    && message.kind == MessageKind::DataResponse
                    && message.request_id == request_id
                {
                    matched = Some(message);
                } else {
                    self.queue.push_back(message);
                }
            }
            if let Some(response) = matched {
                return Ok(response);
            }
            if Instant::now() >= deadline {
                return Err(NetError::RequestTimeout(request_id));
            }
            std::thread::sleep(REQUEST_INTERVAL);
        }
    }
}
