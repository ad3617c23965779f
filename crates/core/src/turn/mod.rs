mod input_lag;
mod received;
mod redundancy;

pub use input_lag::InputLagController;
pub use received::{InsertResult, ReceivedPackets};
pub use redundancy::{Redundancy, unbundle};

use crate::net::UserId;

/// One fixed-size frame per player slot, exchanged during lobby phases and
/// filled with the newest turn packets during gameplay.
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    frame_size: usize,
    data: Vec<u8>,
}

impl FrameBuffer {
    pub fn new(players: usize, frame_size: usize) -> Self {
        Self {
            frame_size,
            data: vec![0; players * frame_size],
        }
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn players(&self) -> usize {
        self.data.len().checked_div(self.frame_size).unwrap_or(0)
    }

    pub fn slot(&self, id: UserId) -> Option<&[u8]> {
        let start = id as usize * self.frame_size;
        self.data.get(start..start + self.frame_size)
    }

    pub fn slot_mut(&mut self, id: UserId) -> Option<&mut [u8]> {
        let start = id as usize * self.frame_size;
        self.data.get_mut(start..start + self.frame_size)
    }

    pub fn clear(&mut self) {
        self.data.fill(0);
    }
}
