pub mod conditions;
pub mod memory;
pub mod tracking;
pub mod transport;
pub mod udp;

pub use conditions::{LinkConditions, NetworkStats};
pub use memory::{DeliveryFilter, MemoryNetwork, MemoryTransport};
pub use transport::{
    DropEvent, DropReason, DropSender, MAX_USERS, SERVER_ID, ServiceKind, Transport,
    TransportOptions, UserId,
};
pub use udp::UdpTransport;
