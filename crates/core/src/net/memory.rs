use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::conditions::LinkConditions;
use super::transport::{
    DropEvent, DropReason, DropSender, SERVER_ID, Transport, TransportOptions, UserId,
};
use crate::error::TransportError;

type NodeId = u64;

/// Returns false to swallow a message in flight.
pub type DeliveryFilter = Box<dyn FnMut(&[u8]) -> bool + Send>;

#[derive(Default)]
struct Node {
    inbox: HashMap<NodeId, VecDeque<Vec<u8>>>,
    connects: VecDeque<NodeId>,
    closed: VecDeque<NodeId>,
}

#[derive(Default)]
struct Hub {
    next_node: NodeId,
    listeners: HashMap<String, NodeId>,
    nodes: HashMap<NodeId, Node>,
    conditions: LinkConditions,
    filter: Option<DeliveryFilter>,
    sent_per_link: HashMap<(NodeId, NodeId), u64>,
    dropped: u64,
}

impl Hub {
    fn deliver(&mut self, from: NodeId, to: NodeId, data: &[u8], sequenced: bool) -> bool {
        let sent = self.sent_per_link.entry((from, to)).or_insert(0);
        *sent += 1;
        let sent = *sent;

        if self.conditions.applies_to(sequenced) && self.conditions.should_drop(sent) {
            self.dropped += 1;
            return false;
        }
        if let Some(filter) = self.filter.as_mut() {
            if !filter(data) {
                self.dropped += 1;
                return false;
            }
        }

        match self.nodes.get_mut(&to) {
            Some(node) => {
                node.inbox.entry(from).or_default().push_back(data.to_vec());
                true
            }
            None => false,
        }
    }

    fn close_link(&mut self, from: NodeId, to: NodeId) {
        if let Some(node) = self.nodes.get_mut(&to) {
            node.closed.push_back(from);
        }
        if let Some(node) = self.nodes.get_mut(&from) {
            node.inbox.remove(&to);
        }
    }
}

/// An in-process network shared by every [`MemoryTransport`] created from
/// it. Peers may live on different threads.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    shared: Arc<(Mutex<Hub>, Condvar)>,
}

impl fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryNetwork").finish_non_exhaustive()
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_conditions(&self, conditions: LinkConditions) {
        self.lock().conditions = conditions;
    }

    pub fn set_filter(&self, filter: Option<DeliveryFilter>) {
        self.lock().filter = filter;
    }

    pub fn dropped_count(&self) -> u64 {
        self.lock().dropped
    }

    fn lock(&self) -> MutexGuard<'_, Hub> {
        self.shared.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self) {
        self.shared.1.notify_all();
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, Hub>, timeout: Duration) -> MutexGuard<'a, Hub> {
        match self.shared.1.wait_timeout(guard, timeout) {
            Ok((guard, _)) => guard,
            Err(poisoned) => poisoned.into_inner().0,
        }
    }
}

pub struct MemoryTransport {
    network: MemoryNetwork,
    node: Option<NodeId>,
    listening: Option<String>,
    peers: BTreeMap<UserId, NodeId>,
    drops: Option<DropSender>,
}

impl MemoryTransport {
    pub fn new(network: MemoryNetwork) -> Self {
        Self {
            network,
            node: None,
            listening: None,
            peers: BTreeMap::new(),
            drops: None,
        }
    }

    fn node(&self) -> Result<NodeId, TransportError> {
        self.node.ok_or(TransportError::NotInitialized)
    }

    fn user_for(&self, node: NodeId) -> Option<UserId> {
        self.peers
            .iter()
            .find(|&(_, &n)| n == node)
            .map(|(&id, _)| id)
    }

    /// Turns hang-ups noticed by the hub into drop notifications.
    fn reap_closed(&mut self, hub: &mut Hub) {
        let Some(node) = self.node else {
            return;
        };
        let closed: Vec<NodeId> = match hub.nodes.get_mut(&node) {
            Some(state) => state.closed.drain(..).collect(),
            None => return,
        };
        for peer in closed {
            if let Some(id) = self.user_for(peer) {
                self.peers.remove(&id);
                log::debug!("Memory link to user {} closed", id);
                if let Some(drops) = &self.drops {
                    let _ = drops.send(DropEvent {
                        id,
                        reason: DropReason::Disconnected,
                    });
                }
            }
        }
    }

    fn send_to(&mut self, id: UserId, data: &[u8], sequenced: bool) -> Result<(), TransportError> {
        let from = self.node()?;
        let to = *self.peers.get(&id).ok_or(TransportError::UnknownPeer(id))?;
        let network = self.network.clone();
        let mut hub = network.lock();
        if !hub.deliver(from, to, data, sequenced) {
            log::trace!("Memory message to user {} lost", id);
        }
        drop(hub);
        network.notify();
        Ok(())
    }
}

impl Transport for MemoryTransport {
    fn init(&mut self, drops: DropSender) -> Result<(), TransportError> {
        let mut hub = self.network.lock();
        let node = hub.next_node;
        hub.next_node += 1;
        hub.nodes.insert(node, Node::default());
        drop(hub);

        self.node = Some(node);
        self.drops = Some(drops);
        Ok(())
    }

    fn exit(&mut self) {
        let Some(node) = self.node.take() else {
            return;
        };
        let network = self.network.clone();
        let mut hub = network.lock();
        for &peer in self.peers.values() {
            hub.close_link(node, peer);
        }
        if let Some(name) = self.listening.take() {
            hub.listeners.remove(&name);
        }
        hub.nodes.remove(&node);
        drop(hub);
        network.notify();

        self.peers.clear();
        self.drops = None;
    }

    fn host(&mut self, endpoint: &str, _options: &TransportOptions) -> Result<(), TransportError> {
        let node = self.node()?;
        let mut hub = self.network.lock();
        if hub.listeners.contains_key(endpoint) {
            return Err(TransportError::InvalidEndpoint(format!(
                "{} is already hosted",
                endpoint
            )));
        }
        hub.listeners.insert(endpoint.to_string(), node);
        drop(hub);

        self.listening = Some(endpoint.to_string());
        log::info!("Memory session hosted at {}", endpoint);
        Ok(())
    }

    fn join(&mut self, endpoint: &str, _options: &TransportOptions) -> Result<(), TransportError> {
        let node = self.node()?;
        let network = self.network.clone();
        let mut hub = network.lock();
        let host = *hub
            .listeners
            .get(endpoint)
            .ok_or_else(|| TransportError::NoListener(endpoint.to_string()))?;
        if let Some(state) = hub.nodes.get_mut(&host) {
            state.connects.push_back(node);
        }
        drop(hub);
        network.notify();

        self.peers.insert(SERVER_ID, host);
        Ok(())
    }

    fn update(&mut self, accept: &mut dyn FnMut() -> Option<UserId>) {
        let Some(node) = self.node else {
            return;
        };
        let network = self.network.clone();
        let connects: Vec<NodeId> = {
            let mut hub = network.lock();
            self.reap_closed(&mut hub);
            match hub.nodes.get_mut(&node) {
                Some(state) => state.connects.drain(..).collect(),
                None => Vec::new(),
            }
        };

        for peer in connects {
            match accept() {
                Some(id) => {
                    self.peers.insert(id, peer);
                    log::debug!("Memory peer accepted as user {}", id);
                }
                None => {
                    network.lock().close_link(node, peer);
                    network.notify();
                }
            }
        }
    }

    fn send_single(&mut self, id: UserId, data: &[u8]) -> Result<(), TransportError> {
        self.send_to(id, data, true)
    }

    fn send_single_unsequenced(&mut self, id: UserId, data: &[u8]) -> Result<(), TransportError> {
        self.send_to(id, data, false)
    }

    fn send_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let ids: Vec<UserId> = self.peers.keys().copied().collect();
        for id in ids {
            self.send_to(id, data, true)?;
        }
        Ok(())
    }

    fn message_ready(&mut self, id: UserId, timeout: Duration) -> usize {
        let Some(node) = self.node else {
            return 0;
        };
        let deadline = Instant::now() + timeout;
        let network = self.network.clone();
        let mut hub = network.lock();
        loop {
            self.reap_closed(&mut hub);
            let Some(&peer) = self.peers.get(&id) else {
                return 0;
            };
            let ready = hub
                .nodes
                .get(&node)
                .and_then(|state| state.inbox.get(&peer))
                .and_then(|queue| queue.front())
                .map(Vec::len);
            if let Some(size) = ready {
                return size;
            }

            let now = Instant::now();
            if now >= deadline {
                return 0;
            }
            hub = network.wait(hub, deadline - now);
        }
    }

    fn read_message(&mut self, id: UserId, max_size: usize) -> Option<Vec<u8>> {
        let node = self.node?;
        let peer = *self.peers.get(&id)?;
        let mut hub = self.network.lock();
        let queue = hub.nodes.get_mut(&node)?.inbox.get_mut(&peer)?;
        let message = queue.pop_front()?;
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
        let (Some(node), Some(peer)) = (self.node, self.peers.remove(&id)) else {
            return;
        };
        let network = self.network.clone();
        network.lock().close_link(node, peer);
        network.notify();
    }

    fn latency(&self, id: UserId) -> Option<Duration> {
        self.peers.get(&id).map(|_| Duration::ZERO)
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.exit();
    }
}
