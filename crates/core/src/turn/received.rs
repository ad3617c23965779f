use crate::net::{MAX_USERS, UserId};
use crate::protocol::TurnPacket;

#[derive(Debug, Clone)]
struct TurnSlot {
    turn: u32,
    packets: [Option<TurnPacket>; MAX_USERS],
}

/// Accepted turn packets for a sliding window of recent turns.
///
/// Entries are write-once: the first packet stored for a (turn, player) pair
/// wins and later copies are ignored.
#[derive(Debug)]
pub struct ReceivedPackets {
    slots: Vec<Option<TurnSlot>>,
    capacity: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertResult {
    Stored,
    Duplicate,
    /// The turn already left the window.
    Stale,
}

impl ReceivedPackets {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn index(&self, turn: u32) -> usize {
        turn as usize % self.capacity
    }

    pub fn insert_if_absent(&mut self, player: UserId, packet: TurnPacket) -> InsertResult {
        let cell = player as usize;
        if cell >= MAX_USERS {
            return InsertResult::Stale;
        }
        let index = self.index(packet.turn);
        let slot = self.slots[index].get_or_insert_with(|| TurnSlot {
            turn: packet.turn,
            packets: [None; MAX_USERS],
        });

        if slot.turn > packet.turn {
            return InsertResult::Stale;
        }
        if slot.turn < packet.turn {
            *slot = TurnSlot {
                turn: packet.turn,
                packets: [None; MAX_USERS],
            };
        }
        if slot.packets[cell].is_some() {
            return InsertResult::Duplicate;
        }
        slot.packets[cell] = Some(packet);
        InsertResult::Stored
    }

    pub fn get(&self, turn: u32, player: UserId) -> Option<&TurnPacket> {
        self.slots[self.index(turn)]
            .as_ref()
            .filter(|slot| slot.turn == turn)
            .and_then(|slot| slot.packets.get(player as usize))
            .and_then(Option::as_ref)
    }

    /// The packets of `turn` in player order, once every player in `players`
    /// has one stored.
    pub fn complete(&self, turn: u32, players: &[UserId]) -> Option<Vec<(UserId, TurnPacket)>> {
        players
            .iter()
            .map(|&player| self.get(turn, player).map(|packet| (player, *packet)))
            .collect()
    }

    pub fn is_complete(&self, turn: u32, players: &[UserId]) -> bool {
        players.iter().all(|&player| self.get(turn, player).is_some())
    }

    pub fn discard_before(&mut self, turn: u32) {
        for slot in &mut self.slots {
            if slot.as_ref().is_some_and(|s| s.turn < turn) {
                *slot = None;
            }
        }
    }

    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
    }

    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .flatten()
            .map(|slot| slot.packets.iter().flatten().count())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
