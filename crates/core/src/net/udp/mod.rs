mod datagram;
mod peer;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::thread;
use std::time::{Duration, Instant};

pub use datagram::{
    Datagram, DatagramError, DatagramHeader, DatagramKind, FRAGMENT_SIZE, Fragment,
    MAX_DATAGRAM_SIZE,
};
pub use peer::PeerLink;

use super::conditions::{DelayQueue, NetworkStats, rand_u64};
use super::transport::{
    DropEvent, DropReason, DropSender, SERVER_ID, Transport, TransportOptions, UserId,
};
use crate::error::TransportError;

const HANDSHAKE_RESEND: Duration = Duration::from_millis(100);
const KEEPALIVE_INTERVAL: Duration = Duration::from_millis(250);
const PENDING_HANDSHAKE_TTL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Idle,
    Host,
    Client,
}

#[derive(Debug)]
struct PendingHandshake {
    client_salt: u64,
    server_salt: u64,
    since: Instant,
    verified: bool,
}

/// Connection-oriented messaging over a single non-blocking UDP socket.
///
/// Sequenced messages are fragmented, acknowledged, retransmitted and handed
/// out in order. Unsequenced messages are fire-and-forget.
pub struct UdpTransport {
    socket: Option<UdpSocket>,
    role: Role,
    drops: Option<DropSender>,
    options: TransportOptions,
    peers: BTreeMap<UserId, PeerLink>,
    by_addr: HashMap<SocketAddr, UserId>,
    pending: HashMap<SocketAddr, PendingHandshake>,
    awaiting_accept: VecDeque<SocketAddr>,
    delayed: DelayQueue<(SocketAddr, Vec<u8>)>,
    stats: NetworkStats,
    recv_buffer: Vec<u8>,
}

impl Default for UdpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl UdpTransport {
    pub fn new() -> Self {
        Self {
            socket: None,
            role: Role::Idle,
            drops: None,
            options: TransportOptions::default(),
            peers: BTreeMap::new(),
            by_addr: HashMap::new(),
            pending: HashMap::new(),
            awaiting_accept: VecDeque::new(),
            delayed: DelayQueue::default(),
            stats: NetworkStats::default(),
            recv_buffer: vec![0u8; MAX_DATAGRAM_SIZE],
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    pub fn stats(&self) -> &NetworkStats {
        &self.stats
    }

    fn bind(&mut self, addr: SocketAddr) -> Result<(), TransportError> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        self.socket = Some(socket);
        Ok(())
    }

    fn transmit(&mut self, addr: SocketAddr, datagram: &Datagram, delay: Duration) {
        let data = match datagram.serialize() {
            Ok(data) => data,
            Err(e) => {
                log::error!("Failed to encode datagram: {}", e);
                return;
            }
        };
        if !delay.is_zero() {
            self.delayed.push((addr, data), delay);
            return;
        }
        self.send_raw(addr, &data);
    }

    fn send_raw(&mut self, addr: SocketAddr, data: &[u8]) {
        let Some(socket) = self.socket.as_ref() else {
            return;
        };
        match socket.send_to(data, addr) {
            Ok(bytes) => {
                self.stats.packets_sent += 1;
                self.stats.bytes_sent += bytes as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.stats.packets_dropped += 1;
            }
            Err(e) => log::warn!("UDP send to {} failed: {}", addr, e),
        }
    }

    /// Sends a handshake datagram outside any peer's sequence space.
    fn send_control(&mut self, addr: SocketAddr, payload: DatagramKind) {
        let datagram = Datagram::new(DatagramHeader::new(0, 0, 0), payload);
        self.transmit(addr, &datagram, Duration::ZERO);
    }

    fn send_to_peer(&mut self, id: UserId, payload: DatagramKind, sequenced: bool) -> Option<u32> {
        let conditions = self.options.conditions.clone();
        let peer = self.peers.get_mut(&id)?;
        let sequence = peer.next_sequence();
        let (ack, ack_bitfield) = peer.receive.ack_data();
        peer.acks.track(sequence);
        peer.last_send = Instant::now();
        peer.ack_pending = false;
        peer.sent_count += 1;
        let addr = peer.addr;
        let sent_count = peer.sent_count;

        let impaired = conditions.applies_to(sequenced)
            && !matches!(payload, DatagramKind::Keepalive | DatagramKind::Disconnect);
        if impaired && conditions.should_drop(sent_count) {
            self.stats.packets_dropped += 1;
            return Some(sequence);
        }
        let delay = if impaired {
            conditions.delay()
        } else {
            Duration::ZERO
        };

        let datagram = Datagram::new(DatagramHeader::new(sequence, ack, ack_bitfield), payload);
        self.transmit(addr, &datagram, delay);
        Some(sequence)
    }

    fn flush_peer(&mut self, id: UserId) {
        let Some(peer) = self.peers.get_mut(&id) else {
            return;
        };
        let fragments = peer.take_due_fragments();
        for fragment in fragments {
            let stream_id = fragment.stream_id;
            if self.peers.get(&id).is_some_and(|p| p.is_retransmit(stream_id)) {
                self.stats.packets_resent += 1;
            }
            if let Some(sequence) = self.send_to_peer(id, DatagramKind::Sequenced(fragment), true) {
                if let Some(peer) = self.peers.get_mut(&id) {
                    peer.mark_sent(stream_id, sequence);
                }
            }
        }
    }

    fn receive_all(&mut self) -> Vec<(Datagram, SocketAddr)> {
        let mut datagrams = Vec::new();
        let Some(socket) = self.socket.as_ref() else {
            return datagrams;
        };

        loop {
            match socket.recv_from(&mut self.recv_buffer) {
                Ok((size, addr)) => {
                    match Datagram::deserialize(&self.recv_buffer[..size]) {
                        Ok(datagram) if datagram.header.is_valid() => {
                            self.stats.packets_received += 1;
                            self.stats.bytes_received += size as u64;
                            datagrams.push((datagram, addr));
                        }
                        Ok(_) => continue,
                        Err(e) => {
                            log::trace!("Ignoring malformed datagram from {}: {}", addr, e);
                        }
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
                Err(e) => {
                    log::warn!("UDP receive failed: {}", e);
                    break;
                }
            }
        }
        datagrams
    }

    fn notify_drop(&mut self, id: UserId, reason: DropReason) {
        if let Some(peer) = self.peers.remove(&id) {
            self.by_addr.remove(&peer.addr);
        }
        log::info!("UDP user {} {}", id, reason.as_str());
        if let Some(drops) = &self.drops {
            let _ = drops.send(DropEvent { id, reason });
        }
    }

    fn handle_peer_datagram(&mut self, id: UserId, datagram: Datagram) {
        let Some(peer) = self.peers.get_mut(&id) else {
            return;
        };
        peer.last_receive = Instant::now();
        let addr = peer.addr;

        if datagram.header.sequence != 0 {
            if !peer.receive.record_received(datagram.header.sequence) {
                return;
            }
            let acked = peer
                .acks
                .process_ack(datagram.header.ack, datagram.header.ack_bitfield);
            peer.on_acked(&acked);
            if let Some(rtt) = peer.acks.smoothed_rtt() {
                self.stats.rtt_ms = rtt.as_secs_f32() * 1000.0;
            }
        }

        match datagram.payload {
            DatagramKind::Sequenced(fragment) => {
                peer.accept_fragment(fragment);
                peer.ack_pending = true;
            }
            DatagramKind::Unsequenced(data) => {
                peer.deliver_unsequenced(data);
                peer.ack_pending = true;
            }
            DatagramKind::Keepalive => {}
            DatagramKind::Disconnect => self.notify_drop(id, DropReason::Disconnected),
            DatagramKind::ChallengeResponse { .. } if self.role == Role::Host => {
                // our acceptance was lost
                self.send_control(addr, DatagramKind::ConnectionAccepted { user_id: id });
            }
            _ => {}
        }
    }

    fn handle_stranger_datagram(&mut self, addr: SocketAddr, datagram: Datagram) {
        if self.role != Role::Host {
            return;
        }
        match datagram.payload {
            DatagramKind::ConnectionRequest { client_salt } => {
                let pending = self
                    .pending
                    .entry(addr)
                    .or_insert_with(|| PendingHandshake {
                        client_salt,
                        server_salt: rand_u64(),
                        since: Instant::now(),
                        verified: false,
                    });
                pending.client_salt = client_salt;
                let server_salt = pending.server_salt;
                self.send_control(addr, DatagramKind::ConnectionChallenge {
                    server_salt,
                    challenge: client_salt ^ server_salt,
                });
            }
            DatagramKind::ChallengeResponse { combined_salt } => {
                let Some(pending) = self.pending.get_mut(&addr) else {
                    return;
                };
                if combined_salt != pending.client_salt ^ pending.server_salt {
                    log::debug!("Bad challenge response from {}", addr);
                    return;
                }
                if !pending.verified {
                    pending.verified = true;
                    self.awaiting_accept.push_back(addr);
                }
            }
            _ => {}
        }
    }

    /// Drives the socket: receive, retransmit, keep links alive, time out.
    fn pump(&mut self) {
        for (addr, data) in self.delayed.take_due() {
            self.send_raw(addr, &data);
        }

        for (datagram, addr) in self.receive_all() {
            match self.by_addr.get(&addr).copied() {
                Some(id) => self.handle_peer_datagram(id, datagram),
                None => self.handle_stranger_datagram(addr, datagram),
            }
        }

        self.pending
            .retain(|_, p| p.since.elapsed() < PENDING_HANDSHAKE_TTL);

        let ids: Vec<UserId> = self.peers.keys().copied().collect();
        for id in ids {
            let Some(peer) = self.peers.get(&id) else {
                continue;
            };
            if peer.is_timed_out(self.options.idle_timeout) {
                self.notify_drop(id, DropReason::Timeout);
                continue;
            }
            self.flush_peer(id);
            let needs_keepalive = self.peers.get(&id).is_some_and(|p| {
                p.ack_pending || p.last_send.elapsed() >= KEEPALIVE_INTERVAL
            });
            if needs_keepalive {
                self.send_to_peer(id, DatagramKind::Keepalive, false);
            }
        }
    }

    fn connect(&mut self, host: SocketAddr, timeout: Duration) -> Result<UserId, TransportError> {
        let client_salt = rand_u64();
        let mut server_salt: Option<u64> = None;
        let start = Instant::now();
        let mut last_send: Option<Instant> = None;

        while start.elapsed() < timeout {
            if last_send.is_none_or(|t| t.elapsed() >= HANDSHAKE_RESEND) {
                let payload = match server_salt {
                    Some(server_salt) => DatagramKind::ChallengeResponse {
                        combined_salt: client_salt ^ server_salt,
                    },
                    None => DatagramKind::ConnectionRequest { client_salt },
                };
                self.send_control(host, payload);
                last_send = Some(Instant::now());
            }

            for (datagram, addr) in self.receive_all() {
                if addr != host {
                    continue;
                }
                match datagram.payload {
                    DatagramKind::ConnectionChallenge {
                        server_salt: salt,
                        challenge,
                    } if challenge == client_salt ^ salt => {
                        if server_salt.is_none() {
                            server_salt = Some(salt);
                            last_send = None;
                        }
                    }
                    DatagramKind::ConnectionAccepted { user_id } => return Ok(user_id),
                    DatagramKind::ConnectionDenied { reason } => {
                        return Err(TransportError::Rejected(reason));
                    }
                    _ => {}
                }
            }
            thread::sleep(Duration::from_millis(1));
        }
        Err(TransportError::ConnectTimeout)
    }
}

fn resolve(endpoint: &str) -> Result<SocketAddr, TransportError> {
    endpoint
        .to_socket_addrs()
        .map_err(|_| TransportError::InvalidEndpoint(endpoint.to_string()))?
        .next()
        .ok_or_else(|| TransportError::InvalidEndpoint(endpoint.to_string()))
}

impl Transport for UdpTransport {
    fn init(&mut self, drops: DropSender) -> Result<(), TransportError> {
        self.drops = Some(drops);
        Ok(())
    }

    fn exit(&mut self) {
        let ids: Vec<UserId> = self.peers.keys().copied().collect();
        for id in ids {
            self.send_to_peer(id, DatagramKind::Disconnect, false);
        }
        for (addr, data) in self.delayed.take_due() {
            self.send_raw(addr, &data);
        }
        self.delayed.clear();
        self.peers.clear();
        self.by_addr.clear();
        self.pending.clear();
        self.awaiting_accept.clear();
        self.socket = None;
        self.role = Role::Idle;
    }

    fn host(&mut self, endpoint: &str, options: &TransportOptions) -> Result<(), TransportError> {
        let addr = resolve(endpoint)?;
        self.bind(addr)?;
        self.options = options.clone();
        self.role = Role::Host;
        log::info!("UDP session hosted on {}", self.local_addr().unwrap_or(addr));
        Ok(())
    }

    fn join(&mut self, endpoint: &str, options: &TransportOptions) -> Result<(), TransportError> {
        let host = resolve(endpoint)?;
        let local = if host.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        self.bind(local)?;
        self.options = options.clone();
        self.role = Role::Client;

        match self.connect(host, options.connect_timeout) {
            Ok(assigned) => {
                log::info!("UDP link to {} established, host granted slot {}", host, assigned);
                self.peers.insert(SERVER_ID, PeerLink::new(host, SERVER_ID));
                self.by_addr.insert(host, SERVER_ID);
                Ok(())
            }
            Err(e) => {
                self.socket = None;
                self.role = Role::Idle;
                Err(e)
            }
        }
    }

    fn update(&mut self, accept: &mut dyn FnMut() -> Option<UserId>) {
        self.pump();

        while let Some(addr) = self.awaiting_accept.pop_front() {
            self.pending.remove(&addr);
            if self.by_addr.contains_key(&addr) {
                continue;
            }
            match accept() {
                Some(id) => {
                    self.peers.insert(id, PeerLink::new(addr, id));
                    self.by_addr.insert(addr, id);
                    self.send_control(addr, DatagramKind::ConnectionAccepted { user_id: id });
                    log::debug!("UDP peer {} accepted as user {}", addr, id);
                }
                None => {
                    self.send_control(addr, DatagramKind::ConnectionDenied {
                        reason: "session is closed to new players".to_string(),
                    });
                }
            }
        }
    }

    fn send_single(&mut self, id: UserId, data: &[u8]) -> Result<(), TransportError> {
        let peer = self
            .peers
            .get_mut(&id)
            .ok_or(TransportError::UnknownPeer(id))?;
        peer.queue_message(data);
        self.flush_peer(id);
        Ok(())
    }

    fn send_single_unsequenced(&mut self, id: UserId, data: &[u8]) -> Result<(), TransportError> {
        if data.len() > FRAGMENT_SIZE {
            return self.send_single(id, data);
        }
        self.send_to_peer(id, DatagramKind::Unsequenced(data.to_vec()), false)
            .map(|_| ())
            .ok_or(TransportError::UnknownPeer(id))
    }

    fn send_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let ids: Vec<UserId> = self.peers.keys().copied().collect();
        for id in ids {
            self.send_single(id, data)?;
        }
        Ok(())
    }

    fn message_ready(&mut self, id: UserId, timeout: Duration) -> usize {
        let start = Instant::now();
        loop {
            self.pump();
            match self.peers.get(&id) {
                Some(peer) => {
                    if let Some(len) = peer.peek_message_len() {
                        return len;
                    }
                }
                None => return 0,
            }
            if start.elapsed() >= timeout {
                return 0;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn read_message(&mut self, id: UserId, max_size: usize) -> Option<Vec<u8>> {
        let message = self.peers.get_mut(&id)?.pop_message()?;
        if message.len() > max_size {
            log::warn!(
                "Discarding {} byte message from user {}, limit is {}",
                message.len(),
                id,
                max_size
            );
            return None;
        }
        Some(message)
    }

    fn drop_user(&mut self, id: UserId) {
        if self.peers.contains_key(&id) {
            self.send_to_peer(id, DatagramKind::Disconnect, false);
            if let Some(peer) = self.peers.remove(&id) {
                self.by_addr.remove(&peer.addr);
            }
        }
    }

    fn latency(&self, id: UserId) -> Option<Duration> {
        let peer = self.peers.get(&id)?;
        peer.acks.smoothed_rtt()
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        if self.socket.is_some() {
            self.exit();
        }
    }
}
