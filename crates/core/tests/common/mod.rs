#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use turnlock::desync::{CreatureInstance, PlayerState, RngSeeds, RoomState, ThingClass, ThingState};
use turnlock::{
    FrameBuffer, InputLagConfig, NetConfig, ResyncError, Session, StateView, SyncedGame,
    TurnPacket, UserId,
};

static ENDPOINT_COUNTER: AtomicU32 = AtomicU32::new(0);

pub fn next_endpoint(name: &str) -> String {
    format!("{}-{}", name, ENDPOINT_COUNTER.fetch_add(1, Ordering::SeqCst))
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Short timeouts. The adaptive input lag stays at zero; tests drive their
/// own fixed lag.
pub fn test_config() -> NetConfig {
    NetConfig {
        max_players: 4,
        turns_per_second: 20,
        lobby_exchange_timeout_ms: 200,
        join_timeout_ms: 2000,
        missing_packet_timeout_ms: 2000,
        resync_timeout_ms: 5000,
        timesync_timeout_ms: 5000,
        resume_timeout_ms: 5000,
        input_lag: InputLagConfig {
            initial_turns: 0,
            min_turns: 0,
            max_turns: 4,
            warmup_ms: 60_000,
            sample_period_ms: 60_000,
        },
        ..Default::default()
    }
}

pub fn turn_frames(config: &NetConfig) -> FrameBuffer {
    FrameBuffer::new(config.player_slots(), TurnPacket::SIZE)
}

/// Services the session until `count` users are logged in.
pub fn wait_for_players(session: &mut Session, count: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while session.roster().logged_in_ids().len() < count {
        assert!(Instant::now() < deadline, "players did not log in");
        session.service().unwrap();
        std::thread::sleep(Duration::from_millis(1));
    }
}

const THINGS: usize = 6;
const THING_BYTES: usize = 2 + 4 * 3 + 4;
const STATE_SIZE: usize = 4 + 12 + THINGS * THING_BYTES;

/// A tiny deterministic simulation: every player owns one creature that
/// moves by the params of its turn packets.
#[derive(Debug, Clone, PartialEq)]
pub struct ToyWorld {
    pub turn: u32,
    pub seeds: RngSeeds,
    pub things: Vec<ThingState>,
    pub rooms: Vec<RoomState>,
    pub players: Vec<PlayerState>,
    pub stashed_camera: Option<[i32; 3]>,
}

impl ToyWorld {
    pub fn new() -> Self {
        let things = (0..THINGS as u16)
            .map(|index| {
                let class = if index < 4 {
                    ThingClass::Creature
                } else {
                    ThingClass::Object
                };
                ThingState {
                    model: 10 + index,
                    owner: index as u8,
                    health: 100,
                    max_frames: 8,
                    creature: (class == ThingClass::Creature).then_some(CreatureInstance {
                        instance_id: 1,
                        inst_turn: 0,
                    }),
                    ..ThingState::new(index, class)
                }
            })
            .collect();
        let rooms = vec![RoomState {
            index: 1,
            slabs_count: 9,
            center: [12, 12],
            efficiency: 200,
            used_capacity: 0,
        }];
        let players = (0..4)
            .map(|id| PlayerState {
                id,
                computer: false,
                instance_num: 0,
                instance_remain_turns: 0,
                camera: Some([0, 0, 0]),
            })
            .collect();
        Self {
            turn: 0,
            seeds: RngSeeds {
                action: 1,
                ai: 2,
                player: 3,
            },
            things,
            rooms,
            players,
            stashed_camera: None,
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

    /// Input this peer sends for `turn`.
    pub fn local_packet(&self, me: UserId, turn: u32) -> TurnPacket {
        TurnPacket::new(turn, 1).with_params([me as i32 + 1, turn as i32 % 3, 0, 0])
    }

    pub fn step(&mut self, inputs: &[(UserId, TurnPacket)]) {
        self.turn += 1;
        for (player, packet) in inputs {
            if let Some(thing) = self.things.get_mut(*player as usize) {
                thing.pos[0] += packet.params[0];
                thing.pos[1] += packet.params[1];
                thing.current_frame = (thing.current_frame + 1) % thing.max_frames;
            }
            self.seeds.action = self
                .seeds
                .action
                .wrapping_mul(1_103_515_245)
                .wrapping_add(packet.action as u32 + *player as u32);
        }
        self.seeds.ai = self.seeds.ai.wrapping_mul(69_069).wrapping_add(1);
        self.rooms[0].used_capacity = self.turn % 5;
    }
}

impl SyncedGame for ToyWorld {
    fn state_size(&self) -> usize {
        STATE_SIZE
    }

    fn save_state(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(STATE_SIZE);
        out.extend_from_slice(&self.turn.to_le_bytes());
        for seed in [self.seeds.action, self.seeds.ai, self.seeds.player] {
            out.extend_from_slice(&seed.to_le_bytes());
        }
        for thing in &self.things {
            out.extend_from_slice(&thing.current_frame.to_le_bytes());
            for axis in thing.pos {
                out.extend_from_slice(&axis.to_le_bytes());
            }
            out.extend_from_slice(&thing.health.to_le_bytes());
        }
        out
    }

    fn load_state(&mut self, state: &[u8]) -> Result<(), ResyncError> {
        if state.len() != STATE_SIZE {
            return Err(ResyncError::Rejected(format!("{} byte state", state.len())));
        }
        let word = |at: usize| u32::from_le_bytes([state[at], state[at + 1], state[at + 2], state[at + 3]]);
        self.turn = word(0);
        self.seeds = RngSeeds {
            action: word(4),
            ai: word(8),
            player: word(12),
        };
        for (n, thing) in self.things.iter_mut().enumerate() {
            let at = 16 + n * THING_BYTES;
            thing.current_frame = u16::from_le_bytes([state[at], state[at + 1]]);
            for (axis, value) in thing.pos.iter_mut().enumerate() {
                *value = word(at + 2 + axis * 4) as i32;
            }
            thing.health = word(at + 14) as i32;
        }
        self.rooms[0].used_capacity = self.turn % 5;
        Ok(())
    }

    fn stash_local_state(&mut self) {
        self.stashed_camera = self.players.first().and_then(|p| p.camera);
    }

    fn restore_local_state(&mut self) {
        if let Some(player) = self.players.first_mut() {
            player.camera = self.stashed_camera.take();
        }
    }
}

/// Turns between sending an input and simulating it.
pub const TEST_INPUT_LAG: u32 = 2;

/// Drives a [`ToyWorld`] through lockstep turns with a fixed input lag.
pub struct Lockstep {
    pub world: ToyWorld,
    pub frames: FrameBuffer,
    /// Last turn whose packet was exchanged.
    pub sent: u32,
    pub sums: Vec<u32>,
}

impl Lockstep {
    pub fn new(config: &NetConfig) -> Self {
        Self {
            world: ToyWorld::new(),
            frames: turn_frames(config),
            sent: 0,
            sums: Vec::new(),
        }
    }

    /// Exchanges the next turn and simulates the one `TEST_INPUT_LAG`
    /// behind it. Returns true when the simulated turn's checksums differ.
    pub fn advance(&mut self, session: &mut Session) -> bool {
        let me = session.my_id().unwrap();
        self.sent += 1;
        let turn = self.sent;
        let mut packet = self.world.local_packet(me, turn);
        packet.checksum = session.update_turn_checksums(&self.world.view(turn));
        self.sums.push(packet.checksum);
        session.exchange_turn(&packet, &mut self.frames).unwrap();

        let Some(sim) = turn.checked_sub(TEST_INPUT_LAG).filter(|&t| t > 0) else {
            return false;
        };
        assert!(
            session.wait_for_missing_packets(sim, &mut self.frames).unwrap(),
            "turn {} incomplete",
            sim
        );
        let desync = session.checksums_differ(sim);
        let players = session.roster().logged_in_ids();
        let inputs = session.received().complete(sim, &players).unwrap();
        self.world.step(&inputs);
        desync
    }

    /// Exchanges until turn `last` has been simulated.
    pub fn run_until(&mut self, session: &mut Session, last: u32) -> Vec<u32> {
        let mut desyncs = Vec::new();
        while self.world.turn < last {
            if self.advance(session) {
                desyncs.push(self.world.turn);
            }
        }
        desyncs
    }
}
