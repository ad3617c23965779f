use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use turnlock::{
    ExchangeKind, FrameBuffer, NetHooks, NetUser, SERVER_ID, Session, TurnPacket, UserId,
};

use crate::config::PeerConfig;
use crate::world::Dungeon;

const LOBBY_FRAME_SIZE: usize = 4;
const LOBBY_READY: usize = 0;
const LOBBY_START: usize = 1;
const LOBBY_PLAYERS: usize = 2;
const LOBBY_POLL: Duration = Duration::from_millis(10);

struct ConsoleHooks;

impl NetHooks for ConsoleHooks {
    fn resync_progress(&mut self, step: u32, total: u32) {
        log::info!("Resync {}/{}", step, total);
    }

    fn user_updated(&mut self, user: &NetUser) {
        log::info!("Player {} '{}' is now {:?}", user.id, user.name, user.progress);
    }

    fn pause_changed(&mut self, paused: bool) {
        log::info!("{}", if paused { "Paused" } else { "Resumed" });
    }

    fn chat(&mut self, player: UserId, text: &str) {
        log::info!("<{}> {}", player, text);
    }
}

pub fn run(config: PeerConfig) -> Result<()> {
    let mut session =
        Session::init_named(&config.service, config.net.clone(), Box::new(ConsoleHooks))
            .context("failed to start networking")?;
    session.set_link_conditions(config.conditions.clone());

    if config.hosting {
        session.host(&config.endpoint, &config.name, &config.password)?;
        log::info!("Hosting on {} as '{}'", config.endpoint, config.name);
        wait_for_players(&mut session, config.players)?;
        session.enable_new_players(false);
    } else {
        let id = session.join(&config.endpoint, &config.name, &config.password)?;
        log::info!("Joined {} as player {}", config.endpoint, id);
    }

    let result = lobby(&mut session).and_then(|players| play(&mut session, &config, players));
    session.stop();
    result
}

fn wait_for_players(session: &mut Session, players: usize) -> Result<()> {
    let mut seen = 1;
    loop {
        session.service()?;
        let logged_in = session.roster().logged_in_ids().len();
        if logged_in >= players {
            return Ok(());
        }
        if logged_in != seen {
            seen = logged_in;
            log::info!("Waiting for players: {}/{}", logged_in, players);
        }
        thread::sleep(LOBBY_POLL);
    }
}

/// Frontend handshake. The host announces the start; everyone echoes it back
/// so the host knows each peer left the lobby. Returns the player count the
/// host announced.
fn lobby(session: &mut Session) -> Result<usize> {
    let me = session.my_id().context("not connected")?;
    let slots = session.config().player_slots();
    let mut frames = FrameBuffer::new(slots, LOBBY_FRAME_SIZE);
    let mut local = [0u8; LOBBY_FRAME_SIZE];
    local[LOBBY_READY] = 1;

    if session.is_host() {
        let players = session.roster().logged_in_ids();
        local[LOBBY_START] = 1;
        local[LOBBY_PLAYERS] = players.len() as u8;
        loop {
            session.exchange(ExchangeKind::Frontend, &local, &mut frames)?;
            let waiting: Vec<UserId> = players
                .iter()
                .copied()
                .filter(|&id| id != me)
                .filter(|&id| frames.slot(id).is_none_or(|f| f[LOBBY_START] == 0))
                .collect();
            if waiting.is_empty() {
                return Ok(players.len());
            }
            let roster = session.roster();
            if waiting.iter().any(|&id| !roster.get(id).is_some_and(|u| u.is_logged_in())) {
                bail!("a player left the lobby");
            }
        }
    }

    loop {
        session.exchange(ExchangeKind::Frontend, &local, &mut frames)?;
        let Some(host) = frames.slot(SERVER_ID) else {
            bail!("no host slot");
        };
        if host[LOBBY_START] != 0 {
            let players = host[LOBBY_PLAYERS] as usize;
            local[LOBBY_START] = 1;
            session.exchange(ExchangeKind::Frontend, &local, &mut frames)?;
            return Ok(players);
        }
    }
}

fn play(session: &mut Session, config: &PeerConfig, players: usize) -> Result<()> {
    let me = session.my_id().context("not connected")?;
    let slots = session.config().player_slots();
    let turn_period = session.config().turn_period();
    let mut world = Dungeon::new(slots, me);
    let mut frames = FrameBuffer::new(slots, TurnPacket::SIZE);
    let mut desync_injected = false;
    log::info!("Starting with {} players", players);

    resync(session, &mut world)?;
    let mut sent = world.turn;
    let mut next_turn = Instant::now();

    while world.turn < config.turns {
        session.take_due_unpause();

        sent += 1;
        let mut packet = world.local_input(sent);
        packet.checksum = session.update_turn_checksums(&world.view(sent));
        session.exchange_turn(&packet, &mut frames)?;

        if session.consume_skip_turn() {
            continue;
        }
        let turn = world.turn + 1;
        if !session.wait_for_missing_packets(turn, &mut frames)? {
            bail!("turn {} never completed", turn);
        }
        let desync = session.checksums_differ(turn);
        let inputs = session
            .received()
            .complete(turn, &session.roster().logged_in_ids())
            .with_context(|| format!("turn {} lost its packets", turn))?;
        world.step(&inputs);

        if config.desync_at == Some(world.turn) && !session.is_host() && !desync_injected {
            log::warn!("Corrupting local state after turn {}", world.turn);
            world.corrupt();
            desync_injected = true;
        }

        if desync {
            log::warn!("Desync at turn {}, resynchronizing", turn);
            resync(session, &mut world)?;
            sent = world.turn;
            next_turn = Instant::now();
            continue;
        }

        if world.turn % 100 == 0 {
            log::info!(
                "Turn {} (input lag {}, zoom {})",
                world.turn,
                session.input_lag(),
                world.zoom()
            );
        }

        next_turn += turn_period;
        let now = Instant::now();
        if next_turn > now {
            thread::sleep(next_turn - now);
        } else {
            next_turn = now;
        }
    }

    log::info!("Finished {} turns", world.turn);
    Ok(())
}

fn resync(session: &mut Session, world: &mut Dungeon) -> Result<()> {
    if let Some(report) = session.resync_game(world)? {
        for category in report.mismatched() {
            log::warn!(
                "Turn {} {:?}: {:08x} local, {:08x} host",
                report.turn,
                category.category,
                category.local,
                category.host
            );
        }
    }
    Ok(())
}
