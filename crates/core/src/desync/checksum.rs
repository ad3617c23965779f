use bitflags::bitflags;
use rkyv::{Archive, Deserialize, Serialize};

/// Folds one value into a rolling checksum.
#[inline]
pub fn checksum_add(acc: u32, value: u32) -> u32 {
    acc.rotate_left(5) ^ value
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Archive, Serialize, Deserialize)]
#[repr(u8)]
pub enum ThingClass {
    Object = 1,
    Shot = 2,
    EffectElement = 3,
    DeadCreature = 4,
    Creature = 5,
    Effect = 6,
    EffectGenerator = 7,
    Trap = 8,
    Door = 9,
    AmbientSound = 10,
}

bitflags! {
    /// Set of thing classes, used to mark the ones left out of checksums.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ThingClasses: u16 {
        const OBJECT           = 1 << 1;
        const SHOT             = 1 << 2;
        const EFFECT_ELEMENT   = 1 << 3;
        const DEAD_CREATURE    = 1 << 4;
        const CREATURE         = 1 << 5;
        const EFFECT           = 1 << 6;
        const EFFECT_GENERATOR = 1 << 7;
        const TRAP             = 1 << 8;
        const DOOR             = 1 << 9;
        const AMBIENT_SOUND    = 1 << 10;
    }
}

impl Default for ThingClasses {
    /// Cosmetic classes are not created in the same order on every peer.
    fn default() -> Self {
        ThingClasses::EFFECT_ELEMENT | ThingClasses::AMBIENT_SOUND
    }
}

impl ThingClasses {
    pub fn contains_class(&self, class: ThingClass) -> bool {
        self.contains(ThingClasses::from_bits_retain(1 << class as u16))
    }
}

/// The per-class thing lists whose sums make up the things checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Archive, Serialize, Deserialize)]
pub enum ThingList {
    Creatures,
    Traps,
    Shots,
    Objects,
    Effects,
    DeadCreatures,
    EffectGenerators,
    Doors,
}

impl ThingList {
    pub const ALL: [ThingList; 8] = [
        ThingList::Creatures,
        ThingList::Traps,
        ThingList::Shots,
        ThingList::Objects,
        ThingList::Effects,
        ThingList::DeadCreatures,
        ThingList::EffectGenerators,
        ThingList::Doors,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ThingList::Creatures => "Creatures",
            ThingList::Traps => "Traps",
            ThingList::Shots => "Shots",
            ThingList::Objects => "Objects",
            ThingList::Effects => "Effects",
            ThingList::DeadCreatures => "Dead Creatures",
            ThingList::EffectGenerators => "Effect Generators",
            ThingList::Doors => "Doors",
        }
    }
}

impl ThingClass {
    pub fn list(&self) -> Option<ThingList> {
        match self {
            ThingClass::Creature => Some(ThingList::Creatures),
            ThingClass::Trap => Some(ThingList::Traps),
            ThingClass::Shot => Some(ThingList::Shots),
            ThingClass::Object => Some(ThingList::Objects),
            ThingClass::Effect => Some(ThingList::Effects),
            ThingClass::DeadCreature => Some(ThingList::DeadCreatures),
            ThingClass::EffectGenerator => Some(ThingList::EffectGenerators),
            ThingClass::Door => Some(ThingList::Doors),
            ThingClass::EffectElement | ThingClass::AmbientSound => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Archive, Serialize, Deserialize)]
pub struct CreatureInstance {
    pub instance_id: u16,
    pub inst_turn: u32,
}

/// The synchronized fields of one live thing.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub struct ThingState {
    pub index: u16,
    pub class: ThingClass,
    pub model: u16,
    pub owner: u8,
    pub creation_turn: u32,
    pub random_seed: u32,
    pub pos: [i32; 3],
    pub health: i32,
    pub current_frame: u16,
    pub max_frames: u16,
    /// Set for creatures only.
    pub creature: Option<CreatureInstance>,
}

impl ThingState {
    pub fn new(index: u16, class: ThingClass) -> Self {
        Self {
            index,
            class,
            model: 0,
            owner: 0,
            creation_turn: 0,
            random_seed: 0,
            pos: [0; 3],
            health: 0,
            current_frame: 0,
            max_frames: 0,
            creature: None,
        }
    }

    /// Zero for classes in `non_synced`.
    pub fn checksum(&self, non_synced: ThingClasses) -> u32 {
        if non_synced.contains_class(self.class) {
            return 0;
        }
        let mut sum = 0;
        sum = checksum_add(sum, self.index as u32);
        sum = checksum_add(sum, self.class as u32);
        sum = checksum_add(sum, self.model as u32);
        sum = checksum_add(sum, self.owner as u32);
        sum = checksum_add(sum, self.creation_turn);
        sum = checksum_add(sum, self.random_seed);
        for axis in self.pos {
            sum = checksum_add(sum, axis as u32);
        }
        sum = checksum_add(sum, self.health as u32);
        sum = checksum_add(sum, self.current_frame as u32);
        sum = checksum_add(sum, self.max_frames as u32);

        if self.class == ThingClass::Creature {
            let instance = self.creature.unwrap_or_default();
            sum = checksum_add(sum, instance.inst_turn);
            sum = checksum_add(sum, instance.instance_id as u32);
        }
        sum
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Archive, Serialize, Deserialize)]
pub struct RoomState {
    pub index: u16,
    pub slabs_count: u32,
    pub center: [i32; 2],
    pub efficiency: u32,
    pub used_capacity: u32,
}

impl RoomState {
    pub fn checksum(&self) -> u32 {
        let mut sum = 0;
        sum = checksum_add(sum, self.slabs_count);
        sum = checksum_add(sum, self.center[0] as u32);
        sum = checksum_add(sum, self.center[1] as u32);
        sum = checksum_add(sum, self.efficiency);
        sum = checksum_add(sum, self.used_capacity);
        checksum_add(sum, self.index as u32)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Archive, Serialize, Deserialize)]
pub struct PlayerState {
    pub id: u8,
    pub computer: bool,
    pub instance_num: u32,
    pub instance_remain_turns: u32,
    pub camera: Option<[i32; 3]>,
}

impl PlayerState {
    /// Only human players with a camera contribute.
    pub fn checksum(&self) -> u32 {
        let Some(camera) = self.camera.filter(|_| !self.computer) else {
            return 0;
        };
        let mut sum = 0;
        sum = checksum_add(sum, self.instance_remain_turns);
        sum = checksum_add(sum, self.instance_num);
        for axis in camera {
            sum = checksum_add(sum, axis as u32);
        }
        sum
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Archive, Serialize, Deserialize)]
pub struct RngSeeds {
    pub action: u32,
    pub ai: u32,
    pub player: u32,
}

/// What the simulation exposes for one turn's checksum.
#[derive(Debug, Clone, Copy)]
pub struct StateView<'a> {
    pub turn: u32,
    pub things: &'a [ThingState],
    pub rooms: &'a [RoomState],
    pub players: &'a [PlayerState],
    pub seeds: RngSeeds,
}

/// Aggregate checksums of one turn.
#[derive(Debug, Clone, PartialEq, Eq, Default, Archive, Serialize, Deserialize)]
pub struct TurnChecksums {
    pub turn: u32,
    pub lists: [u32; 8],
    pub things: u32,
    pub rooms: u32,
    pub players: u32,
    pub player_checksums: Vec<u32>,
    pub seeds: RngSeeds,
    pub total: u32,
}

impl TurnChecksums {
    pub fn compute(view: &StateView<'_>, non_synced: ThingClasses) -> Self {
        let mut lists = [0u32; 8];
        for thing in view.things {
            if let Some(list) = thing.class.list() {
                lists[list as usize] = lists[list as usize].wrapping_add(thing.checksum(non_synced));
            }
        }
        let things = lists.iter().fold(0u32, |acc, sum| acc.wrapping_add(*sum));

        let rooms = view
            .rooms
            .iter()
            .fold(0, |acc, room| checksum_add(acc, room.checksum()));

        let player_checksums: Vec<u32> = view.players.iter().map(PlayerState::checksum).collect();
        let players = player_checksums
            .iter()
            .fold(0u32, |acc, sum| acc.wrapping_add(*sum));

        let total = things
            .wrapping_add(rooms)
            .wrapping_add(players)
            .wrapping_add(view.seeds.action)
            .wrapping_add(view.seeds.player)
            .wrapping_add(view.seeds.ai);

        Self {
            turn: view.turn,
            lists,
            things,
            rooms,
            players,
            player_checksums,
            seeds: view.seeds,
            total,
        }
    }

    pub fn list(&self, list: ThingList) -> u32 {
        self.lists[list as usize]
    }
}
