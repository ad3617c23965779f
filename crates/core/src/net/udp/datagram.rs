use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize, rancor};

pub const MAX_DATAGRAM_SIZE: usize = 1200;
/// Payload bytes per fragment, leaving room for the archived envelope.
pub const FRAGMENT_SIZE: usize = 1024;
pub const PROTOCOL_VERSION: u32 = 1;
pub const PROTOCOL_MAGIC: u32 = 0x544C_4B31;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(compare(PartialEq), derive(Debug))]
pub struct DatagramHeader {
    pub magic: u32,
    pub version: u32,
    pub sequence: u32,
    pub ack: u32,
    pub ack_bitfield: u32,
}

impl DatagramHeader {
    pub fn new(sequence: u32, ack: u32, ack_bitfield: u32) -> Self {
        Self {
            magic: PROTOCOL_MAGIC,
            version: PROTOCOL_VERSION,
            sequence,
            ack,
            ack_bitfield,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.magic == PROTOCOL_MAGIC && self.version == PROTOCOL_VERSION
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct Fragment {
    /// Position in the peer's sequenced stream; fragments of one message are
    /// consecutive.
    pub stream_id: u32,
    pub index: u16,
    pub count: u16,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub enum DatagramKind {
    ConnectionRequest { client_salt: u64 },
    ConnectionChallenge { server_salt: u64, challenge: u64 },
    ChallengeResponse { combined_salt: u64 },
    ConnectionAccepted { user_id: u8 },
    ConnectionDenied { reason: String },
    Sequenced(Fragment),
    Unsequenced(Vec<u8>),
    Keepalive,
    Disconnect,
}

#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct Datagram {
    pub header: DatagramHeader,
    pub payload: DatagramKind,
}

#[derive(Debug, thiserror::Error)]
pub enum DatagramError {
    #[error("serialization failed: {0}")]
    Serialize(rancor::Error),
    #[error("deserialization failed: {0}")]
    Deserialize(rancor::Error),
}

impl Datagram {
    pub fn new(header: DatagramHeader, payload: DatagramKind) -> Self {
        Self { header, payload }
    }

    pub fn serialize(&self) -> Result<Vec<u8>, DatagramError> {
        rkyv::to_bytes::<rancor::Error>(self)
            .map(|aligned| aligned.into_vec())
            .map_err(DatagramError::Serialize)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, DatagramError> {
        let mut aligned = AlignedVec::<16>::with_capacity(data.len());
        aligned.extend_from_slice(data);
        rkyv::from_bytes::<Self, rancor::Error>(&aligned).map_err(DatagramError::Deserialize)
    }

    pub fn is_handshake(&self) -> bool {
        !matches!(
            self.payload,
            DatagramKind::Sequenced(_) | DatagramKind::Unsequenced(_) | DatagramKind::Keepalive
        )
    }
}
