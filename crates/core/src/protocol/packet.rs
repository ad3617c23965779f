use bitflags::bitflags;

use super::message::{CodecError, Reader, Writer};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PacketFlags: u16 {
        const LBUTTON_CLICK   = 1 << 0;
        const RBUTTON_CLICK   = 1 << 1;
        const LBUTTON_RELEASE = 1 << 2;
        const RBUTTON_RELEASE = 1 << 3;
        const MAP_COORDS      = 1 << 4;
        const HELD_SHIFT      = 1 << 5;
        const HELD_CONTROL    = 1 << 6;
        const GUI_ACTION      = 1 << 7;
    }
}

/// One player's input for one simulation turn.
///
/// The simulation layer owns the meaning of `action` and `params`; the
/// networking core only writes `checksum` and routes the packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TurnPacket {
    pub turn: u32,
    pub action: u16,
    pub flags: PacketFlags,
    pub params: [i32; 4],
    pub checksum: u32,
}

impl TurnPacket {
    pub const SIZE: usize = 28;

    pub fn new(turn: u32, action: u16) -> Self {
        Self {
            turn,
            action,
            ..Default::default()
        }
    }

    pub fn with_params(mut self, params: [i32; 4]) -> Self {
        self.params = params;
        self
    }

    /// A packet nobody filled in.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn write(&self, out: &mut Writer) {
        out.put_u32(self.turn);
        out.put_u16(self.action);
        out.put_u16(self.flags.bits());
        for param in self.params {
            out.put_i32(param);
        }
        out.put_u32(self.checksum);
    }

    pub fn read(input: &mut Reader<'_>) -> Result<Self, CodecError> {
        let turn = input.u32()?;
        let action = input.u16()?;
        let flags = PacketFlags::from_bits_retain(input.u16()?);
        let mut params = [0i32; 4];
        for param in &mut params {
            *param = input.i32()?;
        }
        let checksum = input.u32()?;
        Ok(Self {
            turn,
            action,
            flags,
            params,
            checksum,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Writer::with_capacity(Self::SIZE);
        self.write(&mut out);
        out.into_inner()
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() != Self::SIZE {
            return Err(CodecError::Length {
                expected: Self::SIZE,
                actual: data.len(),
            });
        }
        Self::read(&mut Reader::new(data))
    }
}

pub const BUNDLE_DEPTH: usize = 3;

/// The newest turn packet of one player plus up to two earlier ones,
/// newest first.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Bundle {
    packets: Vec<TurnPacket>,
}

impl Bundle {
    pub fn new(mut packets: Vec<TurnPacket>) -> Self {
        packets.truncate(BUNDLE_DEPTH);
        Self { packets }
    }

    pub fn packets(&self) -> &[TurnPacket] {
        &self.packets
    }

    pub fn newest(&self) -> Option<&TurnPacket> {
        self.packets.first()
    }

    pub fn write(&self, out: &mut Writer) {
        out.put_u8(self.packets.len() as u8);
        for packet in &self.packets {
            packet.write(out);
        }
    }

    pub fn read(input: &mut Reader<'_>) -> Result<Self, CodecError> {
        let count = input.u8()?;
        if count == 0 || count as usize > BUNDLE_DEPTH {
            return Err(CodecError::BundleCount(count));
        }
        let packets = (0..count)
            .map(|_| TurnPacket::read(input))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { packets })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_wire_size() {
        let packet = TurnPacket::new(u32::MAX, 7).with_params([-1, 2, -3, 4]);
        assert_eq!(packet.to_bytes().len(), TurnPacket::SIZE);
    }

    #[test]
    fn test_little_endian_layout() {
        let mut packet = TurnPacket::new(0x0102_0304, 0x0506);
        packet.flags = PacketFlags::LBUTTON_CLICK | PacketFlags::HELD_SHIFT;
        packet.checksum = 0xAABB_CCDD;

        let bytes = packet.to_bytes();
        assert_eq!(&bytes[0..4], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&bytes[4..6], &[0x06, 0x05]);
        assert_eq!(&bytes[6..8], &[0x21, 0x00]);
        assert_eq!(&bytes[24..28], &[0xDD, 0xCC, 0xBB, 0xAA]);
        assert_eq!(TurnPacket::from_bytes(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_empty_packet() {
        assert!(TurnPacket::default().is_empty());
        assert!(!TurnPacket::new(1, 0).is_empty());
    }

    #[test]
    fn test_bundle_count_bounds() {
        let mut zero = Writer::with_capacity(1);
        zero.put_u8(0);
        let bytes = zero.into_inner();
        assert!(matches!(
            Bundle::read(&mut Reader::new(&bytes)),
            Err(CodecError::BundleCount(0))
        ));

        let mut four = Writer::with_capacity(1 + 4 * TurnPacket::SIZE);
        four.put_u8(4);
        for turn in 0..4 {
            TurnPacket::new(turn, 0).write(&mut four);
        }
        let bytes = four.into_inner();
        assert!(matches!(
            Bundle::read(&mut Reader::new(&bytes)),
            Err(CodecError::BundleCount(4))
        ));
    }

    #[test]
    fn test_bundle_keeps_newest_three() {
        let packets = (1..=5).rev().map(|turn| TurnPacket::new(turn, 0)).collect();
        let bundle = Bundle::new(packets);
        let turns: Vec<u32> = bundle.packets().iter().map(|p| p.turn).collect();
        assert_eq!(turns, vec![5, 4, 3]);
        assert_eq!(bundle.newest().map(|p| p.turn), Some(5));
    }

    #[test]
    fn test_wrong_length_rejected() {
        let result = TurnPacket::from_bytes(&[0u8; 27]);
        assert!(matches!(
            result,
            Err(CodecError::Length {
                expected: 28,
                actual: 27
            })
        ));
    }
}
