use std::sync::mpsc;
use std::time::Duration;

use super::conditions::LinkConditions;
use super::memory::{MemoryNetwork, MemoryTransport};
use super::udp::UdpTransport;
use crate::error::TransportError;

pub type UserId = u8;

pub const SERVER_ID: UserId = 0;
pub const MAX_USERS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Disconnected,
    Timeout,
    Kicked,
    Error,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::Disconnected => "disconnected",
            DropReason::Timeout => "timed out",
            DropReason::Kicked => "kicked",
            DropReason::Error => "dropped on error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DropEvent {
    pub id: UserId,
    pub reason: DropReason,
}

/// Providers report lost peers here; the session drains it at every poll.
pub type DropSender = mpsc::Sender<DropEvent>;

#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub max_users: usize,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub conditions: LinkConditions,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            max_users: 4,
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(10),
            conditions: LinkConditions::default(),
        }
    }
}

/// A pluggable network backend.
///
/// A joined peer addresses the host as [`SERVER_ID`]; a hosting peer learns
/// client ids from the acceptance callback passed to [`Transport::update`].
pub trait Transport {
    fn init(&mut self, drops: DropSender) -> Result<(), TransportError>;

    fn exit(&mut self);

    fn host(&mut self, endpoint: &str, options: &TransportOptions) -> Result<(), TransportError>;

    fn join(&mut self, endpoint: &str, options: &TransportOptions) -> Result<(), TransportError>;

    /// Polls for new connections. `accept` returns the slot granted to the
    /// newcomer, or `None` to turn it away.
    fn update(&mut self, accept: &mut dyn FnMut() -> Option<UserId>);

    fn send_single(&mut self, id: UserId, data: &[u8]) -> Result<(), TransportError>;

    fn send_single_unsequenced(&mut self, id: UserId, data: &[u8]) -> Result<(), TransportError> {
        self.send_single(id, data)
    }

    fn send_all(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Size of the next message from `id`, waiting up to `timeout`. Zero means
    /// nothing arrived in time.
    fn message_ready(&mut self, id: UserId, timeout: Duration) -> usize;

    fn read_message(&mut self, id: UserId, max_size: usize) -> Option<Vec<u8>>;

    fn drop_user(&mut self, id: UserId);

    fn latency(&self, _id: UserId) -> Option<Duration> {
        None
    }
}

/// Selects the provider a session is built on.
#[derive(Debug, Clone)]
pub enum ServiceKind {
    Udp,
    Memory(MemoryNetwork),
}

impl ServiceKind {
    pub fn from_name(name: &str) -> Result<Self, TransportError> {
        match name.to_ascii_lowercase().as_str() {
            "udp" => Ok(ServiceKind::Udp),
            "memory" | "loopback" => Ok(ServiceKind::Memory(MemoryNetwork::new())),
            other => Err(TransportError::UnknownService(other.to_string())),
        }
    }

    pub fn create(self) -> Box<dyn Transport> {
        match self {
            ServiceKind::Udp => Box::new(UdpTransport::new()),
            ServiceKind::Memory(network) => Box::new(MemoryTransport::new(network)),
        }
    }
}
