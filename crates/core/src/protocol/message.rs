use super::packet::Bundle;
use crate::net::UserId;

pub const MAX_MESSAGE_SIZE: usize = 5000;
/// Field capacities including the terminating NUL.
pub const MAX_NAME_LEN: usize = 32;
pub const MAX_PASSWORD_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("empty message")]
    Empty,
    #[error("unknown message type {0}")]
    UnknownType(u8),
    #[error("{0:?} is a bulk transfer, not a control message")]
    Bulk(MessageType),
    #[error("message truncated: needed {needed} bytes, {remaining} left")]
    Truncated { needed: usize, remaining: usize },
    #[error("expected {expected} bytes, got {actual}")]
    Length { expected: usize, actual: usize },
    #[error("{0} is not terminated within the message")]
    Unterminated(&'static str),
    #[error("{0} is not valid UTF-8")]
    InvalidText(&'static str),
    #[error("{field} of {len} bytes exceeds {max}")]
    TooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },
    #[error("{0} contains a NUL byte")]
    InteriorNul(&'static str),
    #[error("peer index {id} outside 0..{max}")]
    PeerOutOfRange { id: u8, max: usize },
    #[error("bundle holds {0} packets")]
    BundleCount(u8),
    #[error("unknown user progress {0}")]
    InvalidProgress(u8),
    #[error("message of {0} bytes exceeds the message buffer")]
    TooLarge(usize),
}

impl CodecError {
    /// Peer indices out of range mean a corrupted or hostile sender.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, CodecError::PeerOutOfRange { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Login = 1,
    LoginReply = 2,
    UserUpdate = 3,
    Frontend = 4,
    SmallData = 5,
    Gameplay = 6,
    Pause = 7,
    Chat = 8,
    ResyncDiagnostics = 9,
    ResyncData = 10,
    ResyncResume = 11,
    TimeSyncRequest = 12,
    TimeSyncReply = 13,
    TimeSyncComplete = 14,
}

impl TryFrom<u8> for MessageType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => MessageType::Login,
            2 => MessageType::LoginReply,
            3 => MessageType::UserUpdate,
            4 => MessageType::Frontend,
            5 => MessageType::SmallData,
            6 => MessageType::Gameplay,
            7 => MessageType::Pause,
            8 => MessageType::Chat,
            9 => MessageType::ResyncDiagnostics,
            10 => MessageType::ResyncData,
            11 => MessageType::ResyncResume,
            12 => MessageType::TimeSyncRequest,
            13 => MessageType::TimeSyncReply,
            14 => MessageType::TimeSyncComplete,
            other => return Err(CodecError::UnknownType(other)),
        })
    }
}

impl MessageType {
    pub fn of(data: &[u8]) -> Result<Self, CodecError> {
        let tag = *data.first().ok_or(CodecError::Empty)?;
        Self::try_from(tag)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum UserProgress {
    #[default]
    Unused = 0,
    Connected = 1,
    LoggedIn = 2,
}

impl TryFrom<u8> for UserProgress {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(UserProgress::Unused),
            1 => Ok(UserProgress::Connected),
            2 => Ok(UserProgress::LoggedIn),
            other => Err(CodecError::InvalidProgress(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Frontend,
    SmallData,
}

/// Every control message exchanged by peers. Bulk resync data travels
/// separately, see [`super::resync`].
#[derive(Debug, Clone, PartialEq)]
pub enum NetMessage {
    Login {
        password: String,
        name: String,
    },
    LoginReply {
        id: UserId,
    },
    UserUpdate {
        id: UserId,
        progress: UserProgress,
        name: String,
    },
    Frame {
        kind: FrameKind,
        peer: UserId,
        seq: i32,
        payload: Vec<u8>,
    },
    Gameplay {
        peer: UserId,
        seq: i32,
        bundle: Bundle,
    },
    Pause {
        paused: bool,
        delay_ms: u32,
    },
    Chat {
        player: UserId,
        text: String,
    },
    ResyncDiagnostics {
        history: Vec<u8>,
    },
    ResyncResume {
        resume_at: u64,
    },
    TimeSyncRequest {
        client_send: u64,
    },
    TimeSyncReply {
        client_send: u64,
        host_receive: u64,
        host_send: u64,
    },
    TimeSyncComplete {
        rtt: u64,
    },
}

impl NetMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            NetMessage::Login { .. } => MessageType::Login,
            NetMessage::LoginReply { .. } => MessageType::LoginReply,
            NetMessage::UserUpdate { .. } => MessageType::UserUpdate,
            NetMessage::Frame {
                kind: FrameKind::Frontend,
                ..
            } => MessageType::Frontend,
            NetMessage::Frame {
                kind: FrameKind::SmallData,
                ..
            } => MessageType::SmallData,
            NetMessage::Gameplay { .. } => MessageType::Gameplay,
            NetMessage::Pause { .. } => MessageType::Pause,
            NetMessage::Chat { .. } => MessageType::Chat,
            NetMessage::ResyncDiagnostics { .. } => MessageType::ResyncDiagnostics,
            NetMessage::ResyncResume { .. } => MessageType::ResyncResume,
            NetMessage::TimeSyncRequest { .. } => MessageType::TimeSyncRequest,
            NetMessage::TimeSyncReply { .. } => MessageType::TimeSyncReply,
            NetMessage::TimeSyncComplete { .. } => MessageType::TimeSyncComplete,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut out = Writer::with_capacity(64);
        out.put_u8(self.message_type() as u8);

        match self {
            NetMessage::Login { password, name } => {
                out.put_cstr(password, "password", MAX_PASSWORD_LEN)?;
                out.put_cstr(name, "name", MAX_NAME_LEN)?;
            }
            NetMessage::LoginReply { id } => out.put_u8(*id),
            NetMessage::UserUpdate { id, progress, name } => {
                out.put_u8(*id);
                out.put_u8(*progress as u8);
                out.put_cstr(name, "name", MAX_NAME_LEN)?;
            }
            NetMessage::Frame {
                peer, seq, payload, ..
            } => {
                out.put_u8(*peer);
                out.put_i32(*seq);
                out.put_bytes(payload);
            }
            NetMessage::Gameplay { peer, seq, bundle } => {
                out.put_u8(*peer);
                out.put_i32(*seq);
                bundle.write(&mut out);
            }
            NetMessage::Pause { paused, delay_ms } => {
                out.put_u8(*paused as u8);
                out.put_u32(*delay_ms);
            }
            NetMessage::Chat { player, text } => {
                out.put_u8(*player);
                out.put_cstr(text, "chat text", MAX_MESSAGE_SIZE - 2)?;
            }
            NetMessage::ResyncDiagnostics { history } => out.put_bytes(history),
            NetMessage::ResyncResume { resume_at } => out.put_u64(*resume_at),
            NetMessage::TimeSyncRequest { client_send } => out.put_u64(*client_send),
            NetMessage::TimeSyncReply {
                client_send,
                host_receive,
                host_send,
            } => {
                out.put_u64(*client_send);
                out.put_u64(*host_receive);
                out.put_u64(*host_send);
            }
            NetMessage::TimeSyncComplete { rtt } => out.put_u64(*rtt),
        }

        let data = out.into_inner();
        // diagnostics ride the bulk path and may exceed the control buffer
        if data.len() > MAX_MESSAGE_SIZE && !matches!(self, NetMessage::ResyncDiagnostics { .. })
        {
            return Err(CodecError::TooLarge(data.len()));
        }
        Ok(data)
    }

    /// Decodes one message. Peer indices are checked against `max_players`.
    pub fn decode(data: &[u8], max_players: usize) -> Result<Self, CodecError> {
        let message_type = MessageType::of(data)?;
        let mut input = Reader::new(&data[1..]);
        let peer = |id: u8| -> Result<UserId, CodecError> {
            if (id as usize) < max_players {
                Ok(id)
            } else {
                Err(CodecError::PeerOutOfRange {
                    id,
                    max: max_players,
                })
            }
        };

        let message = match message_type {
            MessageType::Login => {
                let password = input.cstr("password", MAX_PASSWORD_LEN)?;
                let name = input.cstr("name", MAX_NAME_LEN)?;
                NetMessage::Login { password, name }
            }
            MessageType::LoginReply => NetMessage::LoginReply {
                id: peer(input.u8()?)?,
            },
            MessageType::UserUpdate => {
                let id = peer(input.u8()?)?;
                let progress = UserProgress::try_from(input.u8()?)?;
                let name = input.cstr("name", MAX_NAME_LEN)?;
                NetMessage::UserUpdate { id, progress, name }
            }
            MessageType::Frontend | MessageType::SmallData => {
                let kind = if message_type == MessageType::Frontend {
                    FrameKind::Frontend
                } else {
                    FrameKind::SmallData
                };
                let peer = peer(input.u8()?)?;
                let seq = input.i32()?;
                NetMessage::Frame {
                    kind,
                    peer,
                    seq,
                    payload: input.rest().to_vec(),
                }
            }
            MessageType::Gameplay => {
                let peer = peer(input.u8()?)?;
                let seq = input.i32()?;
                let bundle = Bundle::read(&mut input)?;
                NetMessage::Gameplay { peer, seq, bundle }
            }
            MessageType::Pause => NetMessage::Pause {
                paused: input.u8()? != 0,
                delay_ms: input.u32()?,
            },
            MessageType::Chat => {
                let player = peer(input.u8()?)?;
                let remaining = input.remaining();
                let text = input.cstr("chat text", remaining)?;
                NetMessage::Chat { player, text }
            }
            MessageType::ResyncDiagnostics => NetMessage::ResyncDiagnostics {
                history: input.rest().to_vec(),
            },
            MessageType::ResyncData => return Err(CodecError::Bulk(MessageType::ResyncData)),
            MessageType::ResyncResume => NetMessage::ResyncResume {
                resume_at: input.u64()?,
            },
            MessageType::TimeSyncRequest => NetMessage::TimeSyncRequest {
                client_send: input.u64()?,
            },
            MessageType::TimeSyncReply => NetMessage::TimeSyncReply {
                client_send: input.u64()?,
                host_receive: input.u64()?,
                host_send: input.u64()?,
            },
            MessageType::TimeSyncComplete => NetMessage::TimeSyncComplete { rtt: input.u64()? },
        };
        Ok(message)
    }
}

/// Little-endian byte packer.
#[derive(Debug, Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn put_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_bytes(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Writes `text` NUL-terminated; `capacity` counts the terminator.
    pub fn put_cstr(
        &mut self,
        text: &str,
        field: &'static str,
        capacity: usize,
    ) -> Result<(), CodecError> {
        if text.as_bytes().contains(&0) {
            return Err(CodecError::InteriorNul(field));
        }
        if text.len() + 1 > capacity {
            return Err(CodecError::TooLong {
                field,
                len: text.len(),
                max: capacity.saturating_sub(1),
            });
        }
        self.buf.extend_from_slice(text.as_bytes());
        self.buf.push(0);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

/// Bounds-checked little-endian reader over a received message.
#[derive(Debug)]
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < len {
            return Err(CodecError::Truncated {
                needed: len,
                remaining: self.remaining(),
            });
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, CodecError> {
        self.array().map(u16::from_le_bytes)
    }

    pub fn u32(&mut self) -> Result<u32, CodecError> {
        self.array().map(u32::from_le_bytes)
    }

    pub fn i32(&mut self) -> Result<i32, CodecError> {
        self.array().map(i32::from_le_bytes)
    }

    pub fn u64(&mut self) -> Result<u64, CodecError> {
        self.array().map(u64::from_le_bytes)
    }

    pub fn rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos..];
        self.pos = self.data.len();
        rest
    }

    /// Reads a NUL-terminated string that must end within both the remaining
    /// bytes and `capacity`.
    pub fn cstr(&mut self, field: &'static str, capacity: usize) -> Result<String, CodecError> {
        let window = &self.data[self.pos..];
        let bound = window.len().min(capacity);
        let len = window[..bound]
            .iter()
            .position(|&b| b == 0)
            .ok_or(CodecError::Unterminated(field))?;
        let text = std::str::from_utf8(&window[..len])
            .map_err(|_| CodecError::InvalidText(field))?
            .to_string();
        self.pos += len + 1;
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TurnPacket;

    #[test]
    fn test_login_layout() {
        let message = NetMessage::Login {
            password: "pw".to_string(),
            name: "Keeper".to_string(),
        };
        let bytes = message.encode().unwrap();
        assert_eq!(bytes, b"\x01pw\0Keeper\0");
        assert_eq!(NetMessage::decode(&bytes, 4).unwrap(), message);
    }

    #[test]
    fn test_unterminated_name_rejected() {
        let bytes = b"\x01pw\0Keeper";
        assert!(matches!(
            NetMessage::decode(bytes, 4),
            Err(CodecError::Unterminated("name"))
        ));
    }

    #[test]
    fn test_name_must_terminate_within_capacity() {
        let mut bytes = vec![MessageType::Login as u8, 0];
        bytes.extend(std::iter::repeat_n(b'a', MAX_NAME_LEN));
        bytes.push(0);
        assert!(matches!(
            NetMessage::decode(&bytes, 4),
            Err(CodecError::Unterminated("name"))
        ));
    }

    #[test]
    fn test_overlong_name_not_encoded() {
        let message = NetMessage::Login {
            password: String::new(),
            name: "n".repeat(MAX_NAME_LEN),
        };
        assert!(matches!(
            message.encode(),
            Err(CodecError::TooLong { field: "name", .. })
        ));
    }

    #[test]
    fn test_user_update_peer_out_of_range() {
        let bytes = [MessageType::UserUpdate as u8, 9, 2, b'x', 0];
        let err = NetMessage::decode(&bytes, 4).unwrap_err();
        assert!(err.is_protocol_violation());
    }

    #[test]
    fn test_frame_peer_out_of_range() {
        let message = NetMessage::Frame {
            kind: FrameKind::SmallData,
            peer: 3,
            seq: 1,
            payload: vec![1, 2, 3],
        };
        let bytes = message.encode().unwrap();
        assert_eq!(NetMessage::decode(&bytes, 4).unwrap(), message);
        assert!(NetMessage::decode(&bytes, 3).unwrap_err().is_protocol_violation());
    }

    #[test]
    fn test_gameplay_frame_layout() {
        let bundle = Bundle::new(vec![TurnPacket::new(9, 1), TurnPacket::new(8, 1)]);
        let message = NetMessage::Gameplay {
            peer: 1,
            seq: -1,
            bundle,
        };
        let bytes = message.encode().unwrap();

        assert_eq!(bytes.len(), 1 + 1 + 4 + 1 + 2 * TurnPacket::SIZE);
        assert_eq!(&bytes[2..6], &[0xFF; 4]);
        assert_eq!(bytes[6], 2);
        assert_eq!(NetMessage::decode(&bytes, 4).unwrap(), message);
    }

    #[test]
    fn test_chat_bounded_by_message() {
        let bytes = [MessageType::Chat as u8, 1, b'h', b'i'];
        assert!(matches!(
            NetMessage::decode(&bytes, 4),
            Err(CodecError::Unterminated("chat text"))
        ));
    }

    #[test]
    fn test_truncated_timesync_reply() {
        let bytes = [MessageType::TimeSyncReply as u8, 0, 0, 0, 0, 0, 0, 0, 0];
        assert!(matches!(
            NetMessage::decode(&bytes, 4),
            Err(CodecError::Truncated { needed: 8, .. })
        ));
    }

    #[test]
    fn test_resync_data_is_not_a_control_message() {
        let bytes = [MessageType::ResyncData as u8, 0, 0];
        assert!(matches!(
            NetMessage::decode(&bytes, 4),
            Err(CodecError::Bulk(MessageType::ResyncData))
        ));
    }

    #[test]
    fn test_unknown_type() {
        assert!(matches!(
            NetMessage::decode(&[0xEE], 4),
            Err(CodecError::UnknownType(0xEE))
        ));
        assert!(matches!(NetMessage::decode(&[], 4), Err(CodecError::Empty)));
    }
}
