use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize, rancor};

use super::checksum::{PlayerState, RoomState, StateView, ThingClasses, ThingList, ThingState, TurnChecksums};

/// Detail kept per thing list and for rooms in each history entry.
pub const MAX_DETAIL_PER_CATEGORY: usize = 256;

/// Checksums of one turn plus the raw fields they were computed from.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub sums: TurnChecksums,
    pub things: Vec<ThingState>,
    pub rooms: Vec<RoomState>,
    pub players: Vec<PlayerState>,
}

impl HistoryEntry {
    pub fn capture(view: &StateView<'_>, non_synced: ThingClasses) -> Self {
        let sums = TurnChecksums::compute(view, non_synced);

        let mut per_list = [0usize; ThingList::ALL.len()];
        let things = view
            .things
            .iter()
            .filter(|thing| !non_synced.contains_class(thing.class))
            .filter(|thing| match thing.class.list() {
                Some(list) => {
                    per_list[list as usize] += 1;
                    per_list[list as usize] <= MAX_DETAIL_PER_CATEGORY
                }
                None => false,
            })
            .cloned()
            .collect();

        Self {
            sums,
            things,
            rooms: view.rooms.iter().take(MAX_DETAIL_PER_CATEGORY).cloned().collect(),
            players: view.players.to_vec(),
        }
    }

    pub fn turn(&self) -> u32 {
        self.sums.turn
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("history encoding failed: {0}")]
    Encode(rancor::Error),
    #[error("history decoding failed: {0}")]
    Decode(rancor::Error),
}

/// Ring of the most recent turn entries, overwritten oldest first.
#[derive(Debug)]
pub struct DesyncHistory {
    entries: Vec<Option<HistoryEntry>>,
    head: usize,
}

impl DesyncHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: (0..capacity.max(1)).map(|_| None).collect(),
            head: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn record(&mut self, entry: HistoryEntry) {
        self.entries[self.head] = Some(entry);
        self.head = (self.head + 1) % self.entries.len();
    }

    pub fn find(&self, turn: u32) -> Option<&HistoryEntry> {
        self.entries.iter().flatten().find(|entry| entry.turn() == turn)
    }

    pub fn latest(&self) -> Option<&HistoryEntry> {
        let index = (self.head + self.entries.len() - 1) % self.entries.len();
        self.entries[index].as_ref()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter().flatten()
    }

    pub fn clear(&mut self) {
        for entry in &mut self.entries {
            *entry = None;
        }
        self.head = 0;
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, HistoryError> {
        let entries: Vec<HistoryEntry> = self.iter().cloned().collect();
        rkyv::to_bytes::<rancor::Error>(&entries)
            .map(|aligned| aligned.into_vec())
            .map_err(HistoryError::Encode)
    }

    pub fn entries_from_bytes(data: &[u8]) -> Result<Vec<HistoryEntry>, HistoryError> {
        let mut aligned = AlignedVec::<16>::with_capacity(data.len());
        aligned.extend_from_slice(data);
        rkyv::from_bytes::<Vec<HistoryEntry>, rancor::Error>(&aligned).map_err(HistoryError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desync::checksum::{RngSeeds, ThingClass};

    fn entry(turn: u32, things: &[ThingState]) -> HistoryEntry {
        let view = StateView {
            turn,
            things,
            rooms: &[],
            players: &[],
            seeds: RngSeeds::default(),
        };
        HistoryEntry::capture(&view, ThingClasses::default())
    }

    #[test]
    fn test_ring_overwrites_oldest() {
        let mut history = DesyncHistory::new(3);
        for turn in 1..=5 {
            history.record(entry(turn, &[]));
        }
        assert!(history.find(2).is_none());
        assert!(history.find(3).is_some());
        assert_eq!(history.latest().map(HistoryEntry::turn), Some(5));
        assert_eq!(history.iter().count(), 3);
    }

    #[test]
    fn test_detail_skips_non_synced_and_caps() {
        let mut things: Vec<ThingState> = (0..300)
            .map(|i| ThingState::new(i, ThingClass::Object))
            .collect();
        things.push(ThingState::new(400, ThingClass::AmbientSound));
        things.push(ThingState::new(401, ThingClass::Door));

        let captured = entry(1, &things);
        assert_eq!(captured.things.len(), MAX_DETAIL_PER_CATEGORY + 1);
        assert!(captured.things.iter().all(|t| t.class != ThingClass::AmbientSound));
    }

    #[test]
    fn test_history_serialization() {
        let mut history = DesyncHistory::new(4);
        history.record(entry(7, &[ThingState::new(1, ThingClass::Trap)]));
        history.record(entry(8, &[]));

        let bytes = history.to_bytes().unwrap();
        let entries = DesyncHistory::entries_from_bytes(&bytes).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(Some(&entries[0]), history.find(7));
    }
}
