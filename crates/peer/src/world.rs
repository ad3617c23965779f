use turnlock::desync::{CreatureInstance, PlayerState, RngSeeds, RoomState};
use turnlock::{
    ResyncError, StateView, SyncedGame, ThingClass, ThingState, TurnPacket, UserId, SERVER_ID,
};

const CREATURES_PER_PLAYER: usize = 4;
const EFFECTS: usize = 8;
const MAP_SIZE: i32 = 85 * 256;

const THING_BYTES: usize = 4 * 3 + 4 + 2 + 4;
const ROOM_BYTES: usize = 4 * 2;
const PLAYER_BYTES: usize = 4 * 2 + 4 * 3;

fn next_random(seed: &mut u32) -> u32 {
    *seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
    *seed >> 16
}

/// A small dungeon: every keeper owns a few wandering creatures and one
/// treasure room. Effects flicker around but are never synchronized.
#[derive(Debug, Clone)]
pub struct Dungeon {
    pub turn: u32,
    seeds: RngSeeds,
    things: Vec<ThingState>,
    rooms: Vec<RoomState>,
    players: Vec<PlayerState>,
    local_seed: u32,
    /// Local view only, survives a resync.
    zoom: i32,
    stashed_zoom: i32,
}

impl Dungeon {
    pub fn new(slots: usize, me: UserId) -> Self {
        let mut things = Vec::new();
        for owner in 0..slots {
            for n in 0..CREATURES_PER_PLAYER {
                let index = things.len() as u16 + 1;
                things.push(ThingState {
                    model: 1 + n as u16,
                    owner: owner as u8,
                    pos: [owner as i32 * 4096 + n as i32 * 256, owner as i32 * 2048, 0],
                    health: 400,
                    max_frames: 12,
                    creature: Some(CreatureInstance::default()),
                    ..ThingState::new(index, ThingClass::Creature)
                });
            }
        }
        for n in 0..EFFECTS {
            let index = things.len() as u16 + 1;
            things.push(ThingState {
                model: 30,
                max_frames: 6,
                pos: [n as i32 * 512, 0, 128],
                ..ThingState::new(index, ThingClass::EffectElement)
            });
        }

        let rooms = (0..slots)
            .map(|owner| RoomState {
                index: owner as u16 + 1,
                slabs_count: 9,
                center: [owner as i32 * 16 + 8, 8],
                efficiency: 256,
                used_capacity: 0,
            })
            .collect();
        let players = (0..slots)
            .map(|id| PlayerState {
                id: id as u8,
                computer: false,
                instance_num: 0,
                instance_remain_turns: 0,
                camera: Some([0, 0, 1024]),
            })
            .collect();

        Self {
            turn: 0,
            seeds: RngSeeds {
                action: 0x2A,
                ai: 0x1D,
                player: 0x07,
            },
            things,
            rooms,
            players,
            local_seed: 0x9E37_79B9 ^ me as u32,
            zoom: 256,
            stashed_zoom: 256,
        }
    }

    pub fn view(&self, turn: u32) -> StateView<'_> {
        StateView {
            turn,
            things: &self.things,
            rooms: &self.rooms,
            players: &self.players,
            seeds: self.seeds,
        }
    }

    pub fn zoom(&self) -> i32 {
        self.zoom
    }

    /// Picks a creature of ours and a random destination.
    pub fn local_input(&mut self, turn: u32) -> TurnPacket {
        let creature = next_random(&mut self.local_seed) % CREATURES_PER_PLAYER as u32;
        let dx = (next_random(&mut self.local_seed) % 65) as i32 - 32;
        let dy = (next_random(&mut self.local_seed) % 65) as i32 - 32;
        self.zoom = (self.zoom + dx).clamp(64, 1024);
        TurnPacket::new(turn, 1).with_params([creature as i32, dx, dy, 0])
    }

    pub fn step(&mut self, inputs: &[(UserId, TurnPacket)]) {
        self.turn += 1;
        for (player, packet) in inputs {
            let [creature, dx, dy, _] = packet.params;
            let index =
                *player as usize * CREATURES_PER_PLAYER + creature as usize % CREATURES_PER_PLAYER;
            if let Some(thing) = self.things.get_mut(index) {
                thing.pos[0] = (thing.pos[0] + dx).clamp(0, MAP_SIZE);
                thing.pos[1] = (thing.pos[1] + dy).clamp(0, MAP_SIZE);
                thing.current_frame = (thing.current_frame + 1) % thing.max_frames;
                if let Some(instance) = thing.creature.as_mut() {
                    instance.inst_turn = self.turn;
                }
            }
            if let Some(camera) = self
                .players
                .get_mut(*player as usize)
                .and_then(|p| p.camera.as_mut())
            {
                camera[0] += dx;
                camera[1] += dy;
            }
            if let Some(room) = self.rooms.get_mut(*player as usize) {
                room.used_capacity = (room.used_capacity + 1) % room.slabs_count;
            }
            self.seeds.action = self.seeds.action.wrapping_mul(31).wrapping_add(packet.action as u32);
        }
        let turn = self.turn;
        for thing in self.things.iter_mut().filter(|t| t.class == ThingClass::Creature) {
            thing.health = (thing.health + 1).min(400);
            thing.random_seed = next_random(&mut self.seeds.ai) ^ turn;
        }
        // cosmetic only, differs between peers
        for thing in self.things.iter_mut().filter(|t| t.class == ThingClass::EffectElement) {
            thing.current_frame = (next_random(&mut self.local_seed) % 6) as u16;
        }
        self.seeds.player = self.seeds.player.wrapping_add(turn);
    }

    /// Nudges one of the host's creatures, as a stray floating point result
    /// would.
    pub fn corrupt(&mut self) {
        if let Some(thing) = self.things.get_mut(SERVER_ID as usize) {
            thing.pos[2] += 1;
            thing.health -= 7;
        }
    }

    fn synced_things(&self) -> impl Iterator<Item = &ThingState> {
        self.things.iter().filter(|t| t.class == ThingClass::Creature)
    }
}

impl SyncedGame for Dungeon {
    fn state_size(&self) -> usize {
        16 + self.synced_things().count() * THING_BYTES
            + self.rooms.len() * ROOM_BYTES
            + self.players.len() * PLAYER_BYTES
    }

    fn save_state(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.state_size());
        for word in [self.turn, self.seeds.action, self.seeds.ai, self.seeds.player] {
            out.extend_from_slice(&word.to_le_bytes());
        }
        for thing in self.synced_things() {
            for axis in thing.pos {
                out.extend_from_slice(&axis.to_le_bytes());
            }
            out.extend_from_slice(&thing.health.to_le_bytes());
            out.extend_from_slice(&thing.current_frame.to_le_bytes());
            out.extend_from_slice(&thing.creature.unwrap_or_default().inst_turn.to_le_bytes());
        }
        for room in &self.rooms {
            out.extend_from_slice(&room.used_capacity.to_le_bytes());
            out.extend_from_slice(&room.efficiency.to_le_bytes());
        }
        for player in &self.players {
            out.extend_from_slice(&player.instance_num.to_le_bytes());
            out.extend_from_slice(&player.instance_remain_turns.to_le_bytes());
            for axis in player.camera.unwrap_or_default() {
                out.extend_from_slice(&axis.to_le_bytes());
            }
        }
        out
    }

    fn load_state(&mut self, state: &[u8]) -> Result<(), ResyncError> {
        if state.len() != self.state_size() {
            return Err(ResyncError::Rejected(format!(
                "{} byte state, expected {}",
                state.len(),
                self.state_size()
            )));
        }
        let mut words = state
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]));
        let mut next = || words.next().unwrap_or_default();

        self.turn = next();
        self.seeds = RngSeeds {
            action: next(),
            ai: next(),
            player: next(),
        };
        let mut at = 16;
        for thing in self.things.iter_mut().filter(|t| t.class == ThingClass::Creature) {
            let field = |offset: usize| {
                let b = &state[at + offset..at + offset + 4];
                u32::from_le_bytes([b[0], b[1], b[2], b[3]])
            };
            thing.pos = [field(0) as i32, field(4) as i32, field(8) as i32];
            thing.health = field(12) as i32;
            thing.current_frame = u16::from_le_bytes([state[at + 16], state[at + 17]]);
            if let Some(instance) = thing.creature.as_mut() {
                instance.inst_turn = field(18);
            }
            at += THING_BYTES;
        }
        let mut tail = state[at..]
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]));
        for room in &mut self.rooms {
            room.used_capacity = tail.next().unwrap_or_default();
            room.efficiency = tail.next().unwrap_or_default();
        }
        for player in &mut self.players {
            player.instance_num = tail.next().unwrap_or_default();
            player.instance_remain_turns = tail.next().unwrap_or_default();
            let mut camera = [0; 3];
            for axis in &mut camera {
                *axis = tail.next().unwrap_or_default() as i32;
            }
            player.camera = Some(camera);
        }
        Ok(())
    }

    fn stash_local_state(&mut self) {
        self.stashed_zoom = self.zoom;
    }

    fn restore_local_state(&mut self) {
        self.zoom = self.stashed_zoom;
    }
}
