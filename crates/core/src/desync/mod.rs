//! Per-turn state checksums and desync diagnosis.

mod analysis;
mod checksum;
mod history;

pub use analysis::{
    Category, CategoryReport, DesyncReport, EntityMismatch, MAX_EXAMPLES, checksums_differ,
    compare_with_host,
};
pub use checksum::{
    CreatureInstance, PlayerState, RngSeeds, RoomState, StateView, ThingClass, ThingClasses,
    ThingList, ThingState, TurnChecksums, checksum_add,
};
pub use history::{DesyncHistory, HistoryEntry, HistoryError, MAX_DETAIL_PER_CATEGORY};

/// Local checksum history plus what is known about the current desync.
#[derive(Debug)]
pub struct DesyncMonitor {
    history: DesyncHistory,
    non_synced: ThingClasses,
    desync_turn: Option<u32>,
    host_history: Option<Vec<HistoryEntry>>,
}

impl DesyncMonitor {
    pub fn new(history_len: usize, non_synced: ThingClasses) -> Self {
        Self {
            history: DesyncHistory::new(history_len),
            non_synced,
            desync_turn: None,
            host_history: None,
        }
    }

    pub fn history(&self) -> &DesyncHistory {
        &self.history
    }

    pub fn non_synced(&self) -> ThingClasses {
        self.non_synced
    }

    pub fn set_non_synced(&mut self, classes: ThingClasses) {
        self.non_synced = classes;
    }

    /// Records this turn and returns the checksum for the outgoing packet.
    pub fn update_turn_checksums(&mut self, view: &StateView<'_>) -> u32 {
        let entry = HistoryEntry::capture(view, self.non_synced);
        let total = entry.sums.total;
        log::trace!(
            "Turn {} checksum {:08x} things {:08x} rooms {:08x} players {:08x}",
            entry.sums.turn,
            total,
            entry.sums.things,
            entry.sums.rooms,
            entry.sums.players
        );
        self.history.record(entry);
        total
    }

    pub fn desync_turn(&self) -> Option<u32> {
        self.desync_turn
    }

    pub fn set_desync_turn(&mut self, turn: u32) {
        self.desync_turn = Some(turn);
    }

    pub fn pack_history(&self) -> Result<Vec<u8>, HistoryError> {
        let bytes = self.history.to_bytes()?;
        log::info!("Packed {} turns of desync history for resync", self.history.iter().count());
        Ok(bytes)
    }

    pub fn store_host_history(&mut self, data: &[u8]) -> Result<(), HistoryError> {
        self.host_history = Some(DesyncHistory::entries_from_bytes(data)?);
        Ok(())
    }

    pub fn has_host_history(&self) -> bool {
        self.host_history.is_some()
    }

    /// Compares against the host history received during resync, once.
    pub fn compare_with_host(&mut self) -> Option<DesyncReport> {
        let host = self.host_history.take()?;
        let turn = self.desync_turn?;
        Some(compare_with_host(&self.history, &host, turn, self.non_synced))
    }

    pub fn clear_desync(&mut self) {
        self.desync_turn = None;
        self.host_history = None;
    }
}
