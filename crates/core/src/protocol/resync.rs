//! Bulk game-state transfer used to resynchronize peers.
//!
//! Layout: type tag, compressed length, original length and CRC32 of the
//! uncompressed state, all little-endian, followed by the zstd frame.

use super::message::{MessageType, Reader, Writer};

pub const RESYNC_HEADER_SIZE: usize = 13;
const COMPRESSION_LEVEL: i32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum ResyncError {
    #[error("expected resync data, got message type {0}")]
    WrongType(u8),
    #[error("state is {declared} bytes, expected {expected}")]
    OriginalLength { declared: usize, expected: usize },
    #[error("received {actual} bytes, header announces {expected}")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("compression failed: {0}")]
    Compress(std::io::Error),
    #[error("decompression failed: {0}")]
    Decompress(std::io::Error),
    #[error("decompressed {actual} bytes, expected {expected}")]
    DecompressedLength { expected: usize, actual: usize },
    #[error("checksum mismatch: header {expected:08x}, computed {actual:08x}")]
    Checksum { expected: u32, actual: u32 },
    #[error("state of {0} bytes does not fit the resync header")]
    TooLarge(usize),
    #[error("no resync data within the timeout")]
    Timeout,
    #[error("host connection lost")]
    NotConnected,
    #[error("game rejected the received state: {0}")]
    Rejected(String),
}

impl ResyncError {
    /// Fatal errors end the attempt. The others reject one message and the
    /// receiver keeps waiting for a valid one.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            ResyncError::WrongType(_)
                | ResyncError::OriginalLength { .. }
                | ResyncError::SizeMismatch { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResyncHeader {
    pub compressed_len: u32,
    pub original_len: u32,
    pub crc: u32,
}

impl ResyncHeader {
    fn read(data: &[u8]) -> Result<Self, ResyncError> {
        let tag = data.first().copied().unwrap_or(0);
        if tag != MessageType::ResyncData as u8 {
            return Err(ResyncError::WrongType(tag));
        }
        let mut input = Reader::new(&data[1..]);
        let mut field = || {
            input.u32().map_err(|_| ResyncError::SizeMismatch {
                expected: RESYNC_HEADER_SIZE,
                actual: data.len(),
            })
        };
        Ok(Self {
            compressed_len: field()?,
            original_len: field()?,
            crc: field()?,
        })
    }
}

/// Compresses `state` into one resync message.
pub fn pack(state: &[u8]) -> Result<Vec<u8>, ResyncError> {
    let original_len = u32::try_from(state.len()).map_err(|_| ResyncError::TooLarge(state.len()))?;
    let crc = crc32fast::hash(state);
    let compressed =
        zstd::bulk::compress(state, COMPRESSION_LEVEL).map_err(ResyncError::Compress)?;
    let compressed_len =
        u32::try_from(compressed.len()).map_err(|_| ResyncError::TooLarge(compressed.len()))?;

    let mut out = Writer::with_capacity(RESYNC_HEADER_SIZE + compressed.len());
    out.put_u8(MessageType::ResyncData as u8);
    out.put_u32(compressed_len);
    out.put_u32(original_len);
    out.put_u32(crc);
    out.put_bytes(&compressed);

    log::debug!(
        "Packed {} byte state into {} bytes, crc {:08x}",
        state.len(),
        compressed.len(),
        crc
    );
    Ok(out.into_inner())
}

/// Validates and decompresses a resync message carrying `expected_len`
/// bytes of state.
pub fn unpack(message: &[u8], expected_len: usize) -> Result<Vec<u8>, ResyncError> {
    let header = ResyncHeader::read(message)?;

    if header.original_len as usize != expected_len {
        return Err(ResyncError::OriginalLength {
            declared: header.original_len as usize,
            expected: expected_len,
        });
    }
    let announced = RESYNC_HEADER_SIZE + header.compressed_len as usize;
    if message.len() != announced {
        return Err(ResyncError::SizeMismatch {
            expected: announced,
            actual: message.len(),
        });
    }

    let state = zstd::bulk::decompress(&message[RESYNC_HEADER_SIZE..], expected_len)
        .map_err(ResyncError::Decompress)?;
    if state.len() != expected_len {
        return Err(ResyncError::DecompressedLength {
            expected: expected_len,
            actual: state.len(),
        });
    }

    let actual = crc32fast::hash(&state);
    if actual != header.crc {
        return Err(ResyncError::Checksum {
            expected: header.crc,
            actual,
        });
    }
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state(len: usize) -> Vec<u8> {
        let mut seed = 0x2545_F491u32;
        (0..len)
            .map(|i| {
                seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
                if i % 7 == 0 { (seed >> 16) as u8 } else { (i / 64) as u8 }
            })
            .collect()
    }

    #[test]
    fn test_pack_unpack() {
        let state = sample_state(20_000);
        let message = pack(&state).unwrap();
        assert_eq!(message[0], MessageType::ResyncData as u8);
        assert_eq!(unpack(&message, state.len()).unwrap(), state);
    }

    #[test]
    fn test_header_layout() {
        let state = vec![7u8; 100];
        let message = pack(&state).unwrap();
        let compressed = (message.len() - RESYNC_HEADER_SIZE) as u32;
        assert_eq!(&message[1..5], &compressed.to_le_bytes());
        assert_eq!(&message[5..9], &100u32.to_le_bytes());
        assert_eq!(&message[9..13], &crc32fast::hash(&state).to_le_bytes());
    }

    #[test]
    fn test_original_length_rejected() {
        let message = pack(&sample_state(512)).unwrap();
        let err = unpack(&message, 513).unwrap_err();
        assert!(matches!(err, ResyncError::OriginalLength { declared: 512, expected: 513 }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_truncated_message_rejected() {
        let message = pack(&sample_state(512)).unwrap();
        let err = unpack(&message[..message.len() - 1], 512).unwrap_err();
        assert!(matches!(err, ResyncError::SizeMismatch { .. }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_wrong_type_rejected() {
        let mut message = pack(&sample_state(64)).unwrap();
        message[0] = MessageType::Chat as u8;
        assert!(matches!(
            unpack(&message, 64),
            Err(ResyncError::WrongType(8))
        ));
    }

    #[test]
    fn test_crc_mismatch_detected() {
        let mut message = pack(&sample_state(4096)).unwrap();
        message[9] ^= 0x01;
        let err = unpack(&message, 4096).unwrap_err();
        assert!(matches!(err, ResyncError::Checksum { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_corrupted_payload_never_passes() {
        let state = sample_state(4096);
        let message = pack(&state).unwrap();
        let middle = RESYNC_HEADER_SIZE + (message.len() - RESYNC_HEADER_SIZE) / 2;
        for offset in [middle, message.len() - 1] {
            let mut corrupted = message.clone();
            corrupted[offset] ^= 0x5A;
            match unpack(&corrupted, state.len()) {
                Err(err) => assert!(err.is_fatal(), "offset {}: {}", offset, err),
                Ok(decoded) => panic!(
                    "corruption at offset {} went unnoticed ({} bytes)",
                    offset,
                    decoded.len()
                ),
            }
        }
    }
}
