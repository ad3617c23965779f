use std::collections::VecDeque;

use super::received::{InsertResult, ReceivedPackets};
use crate::net::{MAX_USERS, UserId};
use crate::protocol::{BUNDLE_DEPTH, Bundle, TurnPacket};

/// Remembers the last packets each player sent so every gameplay frame can
/// carry the two turns before it.
#[derive(Debug)]
pub struct Redundancy {
    sent: Vec<VecDeque<TurnPacket>>,
}

impl Default for Redundancy {
    fn default() -> Self {
        Self::new()
    }
}

impl Redundancy {
    pub fn new() -> Self {
        Self {
            sent: (0..MAX_USERS).map(|_| VecDeque::with_capacity(BUNDLE_DEPTH)).collect(),
        }
    }

    /// Builds the bundle for `current`, newest first, and records it.
    pub fn bundle(&mut self, player: UserId, current: TurnPacket) -> Bundle {
        let Some(history) = self.sent.get_mut(player as usize) else {
            return Bundle::new(vec![current]);
        };
        // a repeated turn replaces the copy sent earlier
        if history.front().is_some_and(|p| p.turn == current.turn) {
            history.pop_front();
        }

        let mut packets = Vec::with_capacity(BUNDLE_DEPTH);
        packets.push(current);
        packets.extend(history.iter().copied());
        let bundle = Bundle::new(packets);

        history.push_front(current);
        history.truncate(BUNDLE_DEPTH - 1);
        bundle
    }

    pub fn clear(&mut self) {
        for history in &mut self.sent {
            history.clear();
        }
    }
}

/// Stores every packet of `bundle` that is not already known. Returns how
/// many were new.
pub fn unbundle(bundle: &Bundle, source: UserId, store: &mut ReceivedPackets) -> usize {
    bundle
        .packets()
        .iter()
        .filter(|packet| store.insert_if_absent(source, **packet) == InsertResult::Stored)
        .count()
}
