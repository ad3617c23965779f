use std::collections::BTreeMap;

use super::checksum::{ThingClasses, ThingList};
use super::history::{DesyncHistory, HistoryEntry};
use crate::net::UserId;
use crate::protocol::TurnPacket;

/// Example mismatches logged and reported per category.
pub const MAX_EXAMPLES: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    TurnChecksum,
    Things,
    List(ThingList),
    Rooms,
    Players,
    ActionSeed,
    AiSeed,
    PlayerSeed,
}

impl Category {
    pub fn name(&self) -> &'static str {
        match self {
            Category::TurnChecksum => "Turn Checksum",
            Category::Things => "Things",
            Category::List(list) => list.name(),
            Category::Rooms => "Rooms",
            Category::Players => "Players",
            Category::ActionSeed => "GAME_RANDOM seed",
            Category::AiSeed => "AI_RANDOM seed",
            Category::PlayerSeed => "PLAYER_RANDOM seed",
        }
    }
}

/// One entity whose checksum differs, or that only one side has.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityMismatch {
    pub index: u16,
    pub local: Option<u32>,
    pub host: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryReport {
    pub category: Category,
    pub local: u32,
    pub host: u32,
    pub examples: Vec<EntityMismatch>,
}

impl CategoryReport {
    pub fn matches(&self) -> bool {
        self.local == self.host
    }
}

/// Outcome of comparing local history against the host's for the desync
/// turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesyncReport {
    pub turn: u32,
    /// False when either side no longer held the turn.
    pub history_available: bool,
    pub categories: Vec<CategoryReport>,
}

impl DesyncReport {
    pub fn category(&self, category: Category) -> Option<&CategoryReport> {
        self.categories.iter().find(|c| c.category == category)
    }

    pub fn mismatched(&self) -> impl Iterator<Item = &CategoryReport> {
        self.categories.iter().filter(|c| !c.matches())
    }
}

/// Compares every non-host player's packet checksum with the host's.
/// Returns the host packet's turn when they disagree. An empty packet counts
/// as a mismatch.
pub fn checksums_differ(host: &TurnPacket, others: &[(UserId, TurnPacket)]) -> Option<u32> {
    let mut mismatch = false;
    for (id, packet) in others {
        if packet.is_empty() {
            log::debug!("Packet of player {} is empty", id);
            mismatch = true;
            continue;
        }
        if packet.checksum != host.checksum {
            log::error!(
                "Checksums {:08x}(host) != {:08x}(player {}) turn: {} vs {}",
                host.checksum,
                packet.checksum,
                id,
                host.turn,
                packet.turn
            );
            mismatch = true;
        }
    }
    mismatch.then_some(host.turn)
}

fn entity_examples(
    local: impl Iterator<Item = (u16, u32)>,
    host: impl Iterator<Item = (u16, u32)>,
) -> Vec<EntityMismatch> {
    let mut by_index: BTreeMap<u16, (Option<u32>, Option<u32>)> = BTreeMap::new();
    for (index, sum) in local {
        by_index.entry(index).or_default().0 = Some(sum);
    }
    for (index, sum) in host {
        by_index.entry(index).or_default().1 = Some(sum);
    }
    by_index
        .into_iter()
        .filter(|(_, (local, host))| local != host)
        .map(|(index, (local, host))| EntityMismatch { index, local, host })
        .take(MAX_EXAMPLES)
        .collect()
}

fn thing_sums(
    entry: &HistoryEntry,
    list: ThingList,
    non_synced: ThingClasses,
) -> impl Iterator<Item = (u16, u32)> + '_ {
    entry
        .things
        .iter()
        .filter(move |thing| thing.class.list() == Some(list))
        .map(move |thing| (thing.index, thing.checksum(non_synced)))
}

fn build_report(local: &HistoryEntry, host: &HistoryEntry, non_synced: ThingClasses) -> Vec<CategoryReport> {
    let plain = |category, local, host| CategoryReport {
        category,
        local,
        host,
        examples: Vec::new(),
    };

    let mut categories = vec![
        plain(Category::TurnChecksum, local.sums.total, host.sums.total),
        plain(Category::Things, local.sums.things, host.sums.things),
    ];
    for list in ThingList::ALL {
        let mut report = plain(Category::List(list), local.sums.list(list), host.sums.list(list));
        if !report.matches() {
            report.examples = entity_examples(
                thing_sums(local, list, non_synced),
                thing_sums(host, list, non_synced),
            );
        }
        categories.push(report);
    }

    let mut rooms = plain(Category::Rooms, local.sums.rooms, host.sums.rooms);
    if !rooms.matches() {
        rooms.examples = entity_examples(
            local.rooms.iter().map(|r| (r.index, r.checksum())),
            host.rooms.iter().map(|r| (r.index, r.checksum())),
        );
    }
    categories.push(rooms);

    let mut players = plain(Category::Players, local.sums.players, host.sums.players);
    if !players.matches() {
        players.examples = entity_examples(
            local.players.iter().map(|p| (p.id as u16, p.checksum())),
            host.players.iter().map(|p| (p.id as u16, p.checksum())),
        );
    }
    categories.push(players);

    categories.push(plain(Category::ActionSeed, local.sums.seeds.action, host.sums.seeds.action));
    categories.push(plain(Category::AiSeed, local.sums.seeds.ai, host.sums.seeds.ai));
    categories.push(plain(Category::PlayerSeed, local.sums.seeds.player, host.sums.seeds.player));
    categories
}

/// Diffs the local entry for `turn` against the host's and logs the result.
pub fn compare_with_host(
    local: &DesyncHistory,
    host: &[HistoryEntry],
    turn: u32,
    non_synced: ThingClasses,
) -> DesyncReport {
    let local_entry = local.find(turn);
    let host_entry = host.iter().find(|entry| entry.turn() == turn);

    let (Some(local_entry), Some(host_entry)) = (local_entry, host_entry) else {
        log::error!(
            "No desync history for turn {}; a packet was likely received too late for the current input lag",
            turn
        );
        return DesyncReport {
            turn,
            history_available: false,
            categories: Vec::new(),
        };
    };

    let report = DesyncReport {
        turn,
        history_available: true,
        categories: build_report(local_entry, host_entry, non_synced),
    };

    log::error!("=== DESYNC ANALYSIS: turn {} ===", turn);
    for category in &report.categories {
        log::error!(
            "    {} {} - Local: {:08x}, Host: {:08x}",
            category.category.name(),
            if category.matches() { "match" } else { "MISMATCH" },
            category.local,
            category.host
        );
        for example in &category.examples {
            log::error!(
                "        index {}: local {:?} host {:?}",
                example.index,
                example.local,
                example.host
            );
        }
    }
    log::error!("=== END DESYNC ANALYSIS ===");
    report
}
