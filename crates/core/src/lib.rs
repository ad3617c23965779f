pub mod config;
pub mod desync;
pub mod error;
pub mod net;
pub mod protocol;
pub mod session;
pub mod turn;

pub use config::{InputLagConfig, NetConfig};
pub use desync::{
    DesyncHistory, DesyncMonitor, DesyncReport, PlayerState, RngSeeds, RoomState, StateView,
    ThingClass, ThingClasses, ThingState, TurnChecksums,
};
pub use error::{ExchangeError, JoinError, SessionError, TimeSyncError, TransportError};
pub use net::{
    DropReason, LinkConditions, MemoryNetwork, SERVER_ID, ServiceKind, Transport, UdpTransport,
    UserId,
};
pub use protocol::{Bundle, MessageType, NetMessage, PacketFlags, ResyncError, TurnPacket};
pub use session::{ExchangeKind, NetHooks, NetUser, NoHooks, Role, Session, SyncedGame};
pub use turn::{FrameBuffer, ReceivedPackets, Redundancy};
