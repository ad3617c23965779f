mod message;
mod packet;
pub mod resync;

pub use message::{
    CodecError, FrameKind, MAX_MESSAGE_SIZE, MAX_NAME_LEN, MAX_PASSWORD_LEN, MessageType,
    NetMessage, Reader, UserProgress, Writer,
};
pub use packet::{BUNDLE_DEPTH, Bundle, PacketFlags, TurnPacket};
pub use resync::{RESYNC_HEADER_SIZE, ResyncError};
