use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::{Duration, Instant};

use log::{debug, error, warn};

use super::channel::{ReliableReceiver, ReliableSender};
use super::packet::{Packet, PacketKind, MAX_PACKET_SIZE};
use super::{RELIABLE_CHANNEL, UNRELIABLE_CHANNEL};

const CONNECT_RESEND_INTERVAL: Duration = Duration::from_millis(250);
const KEEPALIVE_INTERVAL: Duration = Duration::from_millis(500);
const RECEIVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Index into the host's peer slot table.
///
/// Slots are reused lowest-first after a disconnect, so a handle is only
/// meaningful while the connection it was issued for is alive. Code that
/// needs an identifier stable across churn uses the peer's incoming id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerHandle(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connecting,
    Connected,
    Disconnecting,
}

#[derive(Debug)]
struct Peer {
    addr: SocketAddr,
    incoming_id: u32,
    state: PeerState,
    sender: ReliableSender,
    receiver: ReliableReceiver,
    unreliable_sequence: u32,
    last_receive: Instant,
    last_send: Instant,
    last_connect_send: Instant,
    needs_ack: bool,
}

impl Peer {
    fn new(addr: SocketAddr, incoming_id: u32, state: PeerState) -> Self {
        let now = Instant::now();
        Self {
            addr,
            incoming_id,
            state,
            sender: ReliableSender::new(),
            receiver: ReliableReceiver::new(),
            unreliable_sequence: 0,
            last_receive: now,
            last_send: now,
            last_connect_send: now,
            needs_ack: false,
        }
    }
}

/// Events produced by [`Host::service`]. Each carries both the slot handle
/// (for immediate replies) and the stable incoming id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    Connect {
        peer: PeerHandle,
        id: u32,
    },
    Receive {
        peer: PeerHandle,
        id: u32,
        channel: u8,
        data: Vec<u8>,
    },
    Disconnect {
        peer: PeerHandle,
        id: u32,
    },
}

/// A bound UDP endpoint managing up to `max_peers` connections.
///
/// Everything is non-blocking and single-threaded; callers drive the host by
/// calling [`Host::service`] regularly, which drains the socket, runs
/// timers (handshake resends, reliable retransmission, keepalives, receive
/// timeouts) and returns the events that occurred.
pub struct Host {
    socket: UdpSocket,
    local_addr: SocketAddr,
    slots: Vec<Option<Peer>>,
    by_addr: HashMap<SocketAddr, usize>,
    next_incoming_id: u32,
    accept_incoming: bool,
    recv_buf: [u8; MAX_PACKET_SIZE],
}

impl Host {
    pub fn bind<A: ToSocketAddrs>(addr: A, max_peers: usize) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        let local_addr = socket.local_addr()?;

        Ok(Self {
            socket,
            local_addr,
            slots: (0..max_peers).map(|_| None).collect(),
            by_addr: HashMap::new(),
            next_incoming_id: 1,
            accept_incoming: false,
            recv_buf: [0u8; MAX_PACKET_SIZE],
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Whether unsolicited connection requests are accepted. Off by default;
    /// servers turn it on, clients leave it off.
    pub fn set_accept_incoming(&mut self, accept: bool) {
        self.accept_incoming = accept;
    }

    pub fn num_connected(&self) -> usize {
        self.slots
            .iter()
            .flatten()
            .filter(|p| p.state == PeerState::Connected)
            .count()
    }

    pub fn peer_state(&self, handle: PeerHandle) -> Option<PeerState> {
        self.peer(handle).map(|p| p.state)
    }

    pub fn peer_id(&self, handle: PeerHandle) -> Option<u32> {
        self.peer(handle).map(|p| p.incoming_id)
    }

    pub fn peer_addr(&self, handle: PeerHandle) -> Option<SocketAddr> {
        self.peer(handle).map(|p| p.addr)
    }

    pub fn peer_rtt_ms(&self, handle: PeerHandle) -> Option<f32> {
        self.peer(handle).map(|p| p.sender.srtt())
    }

    fn peer(&self, handle: PeerHandle) -> Option<&Peer> {
        self.slots.get(handle.0).and_then(|slot| slot.as_ref())
    }

    fn peer_mut(&mut self, handle: PeerHandle) -> Option<&mut Peer> {
        self.slots.get_mut(handle.0).and_then(|slot| slot.as_mut())
    }

    fn alloc_slot(&mut self) -> Option<usize> {
        self.slots.iter().position(|slot| slot.is_none())
    }

    fn insert_peer(&mut self, slot: usize, peer: Peer) {
        self.by_addr.insert(peer.addr, slot);
        self.slots[slot] = Some(peer);
    }

    fn remove_peer(&mut self, slot: usize) -> Option<Peer> {
        let peer = self.slots[slot].take()?;
        self.by_addr.remove(&peer.addr);
        Some(peer)
    }

    /// Starts an outgoing connection. The handshake completes asynchronously;
    /// a `Connect` event is produced once the remote accepts.
    pub fn connect(&mut self, addr: SocketAddr) -> io::Result<PeerHandle> {
        if let Some(&slot) = self.by_addr.get(&addr) {
            return Ok(PeerHandle(slot));
        }
        let slot = self
            .alloc_slot()
            .ok_or_else(|| io::Error::other("no free peer slots"))?;

        let id = self.next_id();
        let peer = Peer::new(addr, id, PeerState::Connecting);
        transmit(
            &self.socket,
            addr,
            &Packet::control(PacketKind::ConnectRequest, 0, 0),
        )?;
        self.insert_peer(slot, peer);
        Ok(PeerHandle(slot))
    }

    fn next_id(&mut self) -> u32 {
        let id = self.next_incoming_id;
        self.next_incoming_id = self.next_incoming_id.wrapping_add(1);
        if self.next_incoming_id == 0 {
            self.next_incoming_id = 1;
        }
        id
    }

    /// Queues a payload for the peer on the given channel.
    pub fn send(&mut self, handle: PeerHandle, channel: u8, data: &[u8]) -> io::Result<()> {
        if data.len() > MAX_PACKET_SIZE - super::packet::HEADER_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "payload exceeds packet size limit",
            ));
        }
        let socket = &self.socket;
        let peer = self
            .slots
            .get_mut(handle.0)
            .and_then(|slot| slot.as_mut())
            .filter(|p| p.state == PeerState::Connected)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "peer not connected"))?;

        let now = Instant::now();
        let (ack, ack_bits) = peer.receiver.ack_data();
        let sequence = match channel {
            RELIABLE_CHANNEL => peer.sender.track(data.to_vec(), now),
            _ => {
                peer.unreliable_sequence = peer.unreliable_sequence.wrapping_add(1);
                peer.unreliable_sequence
            }
        };
        let packet = Packet {
            kind: PacketKind::Payload,
            channel,
            sequence,
            ack,
            ack_bits,
            payload: data.to_vec(),
        };
        transmit(socket, peer.addr, &packet)?;
        peer.last_send = now;
        peer.needs_ack = false;
        Ok(())
    }

    /// Sends to every connected peer. Individual send failures are logged
    /// and skipped so one bad peer cannot block the rest.
    pub fn broadcast(&mut self, channel: u8, data: &[u8]) {
        let handles: Vec<PeerHandle> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| {
                slot.as_ref()
                    .is_some_and(|p| p.state == PeerState::Connected)
            })
            .map(|(i, _)| PeerHandle(i))
            .collect();
        for handle in handles {
            if let Err(e) = self.send(handle, channel, data) {
                warn!("broadcast send to peer {:?} failed: {}", handle, e);
            }
        }
    }

    /// Begins a graceful disconnect. The peer stays in `Disconnecting` until
    /// the remote acks or the receive timeout removes it.
    pub fn disconnect(&mut self, handle: PeerHandle) {
        let socket = &self.socket;
        if let Some(peer) = self.slots.get_mut(handle.0).and_then(|slot| slot.as_mut()) {
            let (ack, ack_bits) = peer.receiver.ack_data();
            if let Err(e) = transmit(
                socket,
                peer.addr,
                &Packet::control(PacketKind::Disconnect, ack, ack_bits),
            ) {
                warn!("disconnect notify failed: {}", e);
            }
            peer.state = PeerState::Disconnecting;
            peer.last_send = Instant::now();
        }
    }

    /// Drops the peer immediately without notifying the remote.
    pub fn reset(&mut self, handle: PeerHandle) {
        self.remove_peer(handle.0);
    }

    /// Drains the socket and runs all timers. Returns the events that
    /// occurred, in order. Malformed datagrams are logged and dropped; a
    /// socket error other than `WouldBlock` ends the drain early and returns
    /// what was collected.
    pub fn service(&mut self) -> Vec<HostEvent> {
        let mut events = Vec::new();
        self.drain_socket(&mut events);
        self.run_timers(&mut events);
        events
    }

    fn drain_socket(&mut self, events: &mut Vec<HostEvent>) {
        loop {
            let (size, addr) = match self.socket.recv_from(&mut self.recv_buf) {
                Ok(ok) => ok,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!("socket receive error: {}", e);
                    break;
                }
            };
            let packet = match Packet::deserialize(&self.recv_buf[..size]) {
                Ok(packet) => packet,
                Err(e) => {
                    debug!("dropping malformed datagram from {}: {}", addr, e);
                    continue;
                }
            };
            self.handle_packet(addr, packet, events);
        }
    }

    fn handle_packet(&mut self, addr: SocketAddr, packet: Packet, events: &mut Vec<HostEvent>) {
        let slot = self.by_addr.get(&addr).copied();

        match packet.kind {
            PacketKind::ConnectRequest => self.handle_connect_request(addr, slot, events),
            PacketKind::ConnectAccept => {
                if let Some(slot) = slot {
                    let peer = match self.slots[slot].as_mut() {
                        Some(peer) => peer,
                        None => return,
                    };
                    peer.last_receive = Instant::now();
                    if peer.state == PeerState::Connecting {
                        peer.state = PeerState::Connected;
                        events.push(HostEvent::Connect {
                            peer: PeerHandle(slot),
                            id: peer.incoming_id,
                        });
                    }
                }
            }
            PacketKind::Disconnect => {
                let (ack, ack_bits) = slot
                    .and_then(|s| self.slots[s].as_ref())
                    .map(|p| p.receiver.ack_data())
                    .unwrap_or((0, 0));
                if let Err(e) = transmit(
                    &self.socket,
                    addr,
                    &Packet::control(PacketKind::DisconnectAck, ack, ack_bits),
                ) {
                    debug!("disconnect ack to {} failed: {}", addr, e);
                }
                if let Some(slot) = slot {
                    if let Some(peer) = self.remove_peer(slot) {
                        events.push(HostEvent::Disconnect {
                            peer: PeerHandle(slot),
                            id: peer.incoming_id,
                        });
                    }
                }
            }
            PacketKind::DisconnectAck => {
                if let Some(slot) = slot {
                    if let Some(peer) = self.remove_peer(slot) {
                        events.push(HostEvent::Disconnect {
                            peer: PeerHandle(slot),
                            id: peer.incoming_id,
                        });
                    }
                }
            }
            PacketKind::Keepalive => {
                if let Some(slot) = slot {
                    if let Some(peer) = self.slots[slot].as_mut() {
                        peer.last_receive = Instant::now();
                        peer.sender.process_ack(packet.ack, packet.ack_bits);
                    }
                }
            }
            PacketKind::Payload => {
                let Some(slot) = slot else {
                    debug!("payload from unknown address {}", addr);
                    return;
                };
                let Some(peer) = self.slots[slot].as_mut() else {
                    return;
                };
                peer.last_receive = Instant::now();
                peer.sender.process_ack(packet.ack, packet.ack_bits);
                if peer.state != PeerState::Connected {
                    return;
                }
                let id = peer.incoming_id;
                match packet.channel {
                    RELIABLE_CHANNEL => {
                        let deliverable = peer.receiver.on_payload(packet.sequence, packet.payload);
                        // ack promptly even when nothing became deliverable,
                        // otherwise duplicates keep getting retransmitted
                        peer.needs_ack = true;
                        for data in deliverable {
                            events.push(HostEvent::Receive {
                                peer: PeerHandle(slot),
                                id,
                                channel: RELIABLE_CHANNEL,
                                data,
                            });
                        }
                    }
                    UNRELIABLE_CHANNEL => {
                        events.push(HostEvent::Receive {
                            peer: PeerHandle(slot),
                            id,
                            channel: UNRELIABLE_CHANNEL,
                            data: packet.payload,
                        });
                    }
                    other => {
                        debug!("dropping payload on unknown channel {}", other);
                    }
                }
            }
        }
    }

    fn handle_connect_request(
        &mut self,
        addr: SocketAddr,
        slot: Option<usize>,
        events: &mut Vec<HostEvent>,
    ) {
        // duplicate request from a known peer: re-accept, the original
        // accept may have been lost
        if let Some(slot) = slot {
            if let Some(peer) = self.slots[slot].as_mut() {
                peer.last_receive = Instant::now();
                let (ack, ack_bits) = peer.receiver.ack_data();
                if let Err(e) = transmit(
                    &self.socket,
                    addr,
                    &Packet::control(PacketKind::ConnectAccept, ack, ack_bits),
                ) {
                    debug!("connect re-accept to {} failed: {}", addr, e);
                }
            }
            return;
        }

        if !self.accept_incoming {
            debug!("rejecting unsolicited connect from {}", addr);
            return;
        }
        let Some(slot) = self.alloc_slot() else {
            warn!("rejecting connect from {}: all peer slots in use", addr);
            return;
        };

        let id = self.next_id();
        let peer = Peer::new(addr, id, PeerState::Connected);
        if let Err(e) = transmit(
            &self.socket,
            addr,
            &Packet::control(PacketKind::ConnectAccept, 0, 0),
        ) {
            warn!("connect accept to {} failed: {}", addr, e);
            return;
        }
        self.insert_peer(slot, peer);
        events.push(HostEvent::Connect {
            peer: PeerHandle(slot),
            id,
        });
    }

    fn run_timers(&mut self, events: &mut Vec<HostEvent>) {
        let now = Instant::now();
        let socket = &self.socket;
        let mut timed_out = Vec::new();

        for (slot, entry) in self.slots.iter_mut().enumerate() {
            let Some(peer) = entry.as_mut() else { continue };

            if now.duration_since(peer.last_receive) > RECEIVE_TIMEOUT {
                timed_out.push(slot);
                continue;
            }

            match peer.state {
                PeerState::Connecting => {
                    if now.duration_since(peer.last_connect_send) >= CONNECT_RESEND_INTERVAL {
                        peer.last_connect_send = now;
                        if let Err(e) = transmit(
                            socket,
                            peer.addr,
                            &Packet::control(PacketKind::ConnectRequest, 0, 0),
                        ) {
                            debug!("connect resend failed: {}", e);
                        }
                    }
                }
                PeerState::Connected => {
                    let (ack, ack_bits) = peer.receiver.ack_data();
                    for (sequence, data) in peer.sender.due_for_resend(now) {
                        let packet = Packet {
                            kind: PacketKind::Payload,
                            channel: RELIABLE_CHANNEL,
                            sequence,
                            ack,
                            ack_bits,
                            payload: data,
                        };
                        if let Err(e) = transmit(socket, peer.addr, &packet) {
                            debug!("retransmit failed: {}", e);
                        }
                        peer.last_send = now;
                    }

                    let idle = now.duration_since(peer.last_send) >= KEEPALIVE_INTERVAL;
                    if idle || peer.needs_ack {
                        if let Err(e) = transmit(
                            socket,
                            peer.addr,
                            &Packet::control(PacketKind::Keepalive, ack, ack_bits),
                        ) {
                            debug!("keepalive failed: {}", e);
                        }
                        peer.last_send = now;
                        peer.needs_ack = false;
                    }
                }
                PeerState::Disconnecting => {
                    // disconnect notify resend until the ack or the timeout
                    if now.duration_since(peer.last_send) >= CONNECT_RESEND_INTERVAL {
                        let (ack, ack_bits) = peer.receiver.ack_data();
                        if let Err(e) = transmit(
                            socket,
                            peer.addr,
                            &Packet::control(PacketKind::Disconnect, ack, ack_bits),
                        ) {
                            debug!("disconnect resend failed: {}", e);
                        }
                        peer.last_send = now;
                    }
                }
            }
        }

        for slot in timed_out {
            if let Some(peer) = self.remove_peer(slot) {
                debug!("peer {} at {} timed out", peer.incoming_id, peer.addr);
                // a peer that never finished connecting produces no event
                if peer.state != PeerState::Connecting {
                    events.push(HostEvent::Disconnect {
                        peer: PeerHandle(slot),
                        id: peer.incoming_id,
                    });
                }
            }
        }
    }
}

fn transmit(socket: &UdpSocket, addr: SocketAddr, packet: &Packet) -> io::Result<()> {
    let data = packet.serialize();
    socket.send_to(&data, addr)?;
    Ok(())
}
