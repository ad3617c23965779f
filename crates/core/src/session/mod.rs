//! The lockstep session: peers, login, turn exchange, resync and time sync.

mod exchange;
mod hooks;
mod resync;
mod roster;
mod timesync;

use std::collections::VecDeque;
use std::sync::mpsc;
use std::time::{Duration, Instant};

pub use exchange::ExchangeKind;
pub use hooks::{NetHooks, NoHooks};
pub use resync::SyncedGame;
pub use roster::{NetUser, Roster};
pub use timesync::{
    NetClock, TimeSyncState, clock_offset, resume_delay, round_trip, translate_resume, wait_until,
};

pub use crate::protocol::UserProgress;

use crate::config::NetConfig;
use crate::desync::{DesyncMonitor, StateView, ThingClasses};
use crate::error::{JoinError, SessionError};
use crate::net::{
    DropEvent, DropReason, LinkConditions, SERVER_ID, ServiceKind, Transport, TransportOptions,
    UserId,
};
use crate::protocol::{CodecError, MAX_MESSAGE_SIZE, MessageType, NetMessage, TurnPacket};
use crate::turn::{FrameBuffer, InputLagController, ReceivedPackets, Redundancy, unbundle};

/// Largest message read from a transport; bulk resync data can be big.
const MAX_TRANSFER_SIZE: usize = 64 * 1024 * 1024;
const POLL_SLICE: Duration = Duration::from_millis(100);

/// Called when a peer sends an index outside the player range. Must not
/// return.
pub type AbortHandler = fn(&str) -> !;

fn abort_process(reason: &str) -> ! {
    log::error!("Critical error: {}", reason);
    std::process::abort()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Idle,
    Host,
    Client,
}

/// What a processed message turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Processed {
    Handled,
    /// A frontend or small-data frame carrying `peer`'s payload.
    Frame { message_type: MessageType, peer: UserId },
    /// A gameplay frame originating from the peer it was read from.
    OwnGameplay,
    Deferred,
    Rejected,
}

pub struct Session {
    transport: Box<dyn Transport>,
    drops: mpsc::Receiver<DropEvent>,
    config: NetConfig,
    hooks: Box<dyn NetHooks>,
    abort: AbortHandler,
    conditions: LinkConditions,
    role: Role,
    roster: Roster,
    my_id: Option<UserId>,
    local_name: String,
    password: String,
    locked: bool,
    seq: i32,
    last_draw: Instant,
    scheduled_unpause: Option<Instant>,
    store: ReceivedPackets,
    redundancy: Redundancy,
    input_lag: InputLagController,
    desync: DesyncMonitor,
    clock: NetClock,
    time_sync: TimeSyncState,
    deferred: VecDeque<(UserId, Vec<u8>)>,
}

impl Session {
    /// Creates a session over the selected provider.
    pub fn init(
        service: ServiceKind,
        config: NetConfig,
        hooks: Box<dyn NetHooks>,
    ) -> Result<Self, SessionError> {
        Self::with_transport(service.create(), config, hooks)
    }

    /// Like [`Session::init`] with the provider picked by name.
    pub fn init_named(
        service: &str,
        config: NetConfig,
        hooks: Box<dyn NetHooks>,
    ) -> Result<Self, SessionError> {
        let service = ServiceKind::from_name(service).map_err(SessionError::Init)?;
        Self::init(service, config, hooks)
    }

    pub fn with_transport(
        mut transport: Box<dyn Transport>,
        config: NetConfig,
        hooks: Box<dyn NetHooks>,
    ) -> Result<Self, SessionError> {
        let (drop_tx, drops) = mpsc::channel();
        transport.init(drop_tx).map_err(SessionError::Init)?;

        let slots = config.player_slots();
        Ok(Self {
            transport,
            drops,
            hooks,
            abort: abort_process,
            conditions: LinkConditions::default(),
            role: Role::Idle,
            roster: Roster::new(slots),
            my_id: None,
            local_name: String::new(),
            password: String::new(),
            locked: false,
            seq: 0,
            last_draw: Instant::now(),
            scheduled_unpause: None,
            store: ReceivedPackets::new(config.packet_window),
            redundancy: Redundancy::new(),
            input_lag: InputLagController::new(config.input_lag.clone(), config.turn_period()),
            desync: DesyncMonitor::new(config.desync_history_len, ThingClasses::default()),
            clock: NetClock::new(),
            time_sync: TimeSyncState::default(),
            deferred: VecDeque::new(),
            config,
        })
    }

    pub fn set_abort_handler(&mut self, handler: AbortHandler) {
        self.abort = handler;
    }

    /// Impairs outgoing traffic of links opened after this call.
    pub fn set_link_conditions(&mut self, conditions: LinkConditions) {
        self.conditions = conditions;
    }

    pub fn set_non_synced_classes(&mut self, classes: ThingClasses) {
        self.desync.set_non_synced(classes);
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_host(&self) -> bool {
        self.role == Role::Host
    }

    pub fn my_id(&self) -> Option<UserId> {
        self.my_id
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn seq(&self) -> i32 {
        self.seq
    }

    pub fn received(&self) -> &ReceivedPackets {
        &self.store
    }

    pub fn desync(&self) -> &DesyncMonitor {
        &self.desync
    }

    pub fn input_lag(&self) -> u32 {
        self.input_lag.input_lag()
    }

    pub fn time_sync_state(&self) -> &TimeSyncState {
        &self.time_sync
    }

    pub fn clock(&self) -> &NetClock {
        &self.clock
    }

    /// Marks the end of a rendered frame; network waits are clipped to the
    /// next one.
    pub fn frame_drawn(&mut self) {
        self.last_draw = Instant::now();
    }

    fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            max_users: self.config.player_slots(),
            connect_timeout: self.config.join_timeout(),
            conditions: self.conditions.clone(),
            ..Default::default()
        }
    }

    pub fn host(&mut self, endpoint: &str, name: &str, password: &str) -> Result<(), SessionError> {
        let options = self.transport_options();
        self.transport
            .host(endpoint, &options)
            .map_err(SessionError::Host)?;

        self.role = Role::Host;
        self.my_id = Some(SERVER_ID);
        self.local_name = name.to_string();
        self.password = password.to_string();
        self.locked = false;
        self.roster.set(SERVER_ID, UserProgress::LoggedIn, name);
        log::info!("Hosting session at {} as {}", endpoint, name);
        Ok(())
    }

    /// Connects to a host and logs in. Returns the slot the host assigned.
    pub fn join(&mut self, endpoint: &str, name: &str, password: &str) -> Result<UserId, SessionError> {
        let login = NetMessage::Login {
            password: password.to_string(),
            name: name.to_string(),
        }
        .encode()
        .map_err(JoinError::Credentials)?;

        let options = self.transport_options();
        self.transport
            .join(endpoint, &options)
            .map_err(JoinError::Transport)?;
        self.role = Role::Client;
        self.local_name = name.to_string();
        self.password = password.to_string();
        self.roster.set(SERVER_ID, UserProgress::Connected, "");

        log::info!("Logging in to {} as {}", endpoint, name);
        if let Err(e) = self.transport.send_single(SERVER_ID, &login) {
            log::warn!("Failed to send login: {}", e);
            self.stop();
            return Err(JoinError::Transport(e).into());
        }

        let deadline = Instant::now() + self.config.join_timeout();
        loop {
            self.poll_transport();
            if self.role == Role::Idle {
                log::warn!("Network login rejected");
                return Err(JoinError::Rejected.into());
            }
            if let Some(id) = self.my_id {
                log::info!("Logged in as user {}", id);
                return Ok(id);
            }
            let now = Instant::now();
            if now >= deadline {
                log::warn!("No login reply within {:?}", self.config.join_timeout());
                self.stop();
                return Err(JoinError::Timeout.into());
            }
            if let Some(data) = self.next_message(SERVER_ID, (deadline - now).min(POLL_SLICE)) {
                self.process_message(SERVER_ID, data, None);
            }
        }
    }

    /// Opens or closes the session to newcomers. Closing drops everyone
    /// still in the middle of logging in.
    pub fn enable_new_players(&mut self, allow: bool) {
        if !allow {
            let half_joined: Vec<UserId> = self
                .roster
                .iter()
                .filter(|user| user.progress == UserProgress::Connected && Some(user.id) != self.my_id)
                .map(|user| user.id)
                .collect();
            for id in half_joined {
                log::info!("Dropping user {} who had not logged in", id);
                self.kick_user(id);
            }
        }
        self.locked = !allow;
        if allow {
            log::info!("New players are allowed to join");
        } else {
            log::info!("New players are no longer allowed to join");
        }
    }

    pub fn stop(&mut self) {
        if self.role != Role::Idle {
            log::info!("Stopping network session");
        }
        self.transport.exit();
        self.role = Role::Idle;
        self.my_id = None;
        self.roster.clear();
        self.password.clear();
        self.locked = false;
        self.seq = 0;
        self.scheduled_unpause = None;
        self.store.clear();
        self.redundancy.clear();
        self.desync.clear_desync();
        self.deferred.clear();
        while self.drops.try_recv().is_ok() {}
    }

    /// One non-blocking pass over the network outside of an exchange.
    pub fn service(&mut self) -> Result<(), SessionError> {
        if self.role == Role::Idle {
            return Err(SessionError::NotRunning);
        }
        self.poll_transport();
        for id in self.listen_targets() {
            while let Some(data) = self.next_message(id, Duration::ZERO) {
                self.process_message(id, data, None);
            }
        }
        Ok(())
    }

    /// Computes this turn's checksums, records them and returns the value
    /// to put in the outgoing packet.
    pub fn update_turn_checksums(&mut self, view: &StateView<'_>) -> u32 {
        self.desync.update_turn_checksums(view)
    }

    /// Compares the checksums everyone sent for `turn` against the host's.
    pub fn checksums_differ(&mut self, turn: u32) -> bool {
        let host = self.store.get(turn, SERVER_ID).copied().unwrap_or_default();
        let others: Vec<(UserId, TurnPacket)> = self
            .roster
            .logged_in_ids()
            .into_iter()
            .filter(|&id| id != SERVER_ID)
            .map(|id| (id, self.store.get(turn, id).copied().unwrap_or_default()))
            .collect();

        match crate::desync::checksums_differ(&host, &others) {
            Some(host_turn) => {
                let desync_turn = if host.is_empty() { turn } else { host_turn };
                log::warn!("Desync detected at turn {}", desync_turn);
                self.desync.set_desync_turn(desync_turn);
                true
            }
            None => false,
        }
    }

    /// Returns true once a scheduled unpause is due and tells the hooks.
    pub fn take_due_unpause(&mut self) -> bool {
        match self.scheduled_unpause {
            Some(at) if Instant::now() >= at => {
                self.scheduled_unpause = None;
                self.hooks.pause_changed(false);
                true
            }
            _ => false,
        }
    }

    pub fn has_scheduled_unpause(&self) -> bool {
        self.scheduled_unpause.is_some()
    }

    /// Peers whose messages this peer reads: a client only hears the host.
    fn listen_targets(&self) -> Vec<UserId> {
        match self.role {
            Role::Host => self
                .roster
                .active_ids()
                .into_iter()
                .filter(|&id| Some(id) != self.my_id)
                .collect(),
            Role::Client => vec![SERVER_ID],
            Role::Idle => Vec::new(),
        }
    }

    /// Peers this peer sends to: a client only reaches the host.
    fn send_targets(&self) -> Vec<UserId> {
        match self.role {
            Role::Host => self
                .roster
                .logged_in_ids()
                .into_iter()
                .filter(|&id| Some(id) != self.my_id)
                .collect(),
            Role::Client => vec![SERVER_ID],
            Role::Idle => Vec::new(),
        }
    }

    fn send(&mut self, id: UserId, data: &[u8]) {
        if let Err(e) = self.transport.send_single(id, data) {
            log::warn!("Send to user {} failed: {}", id, e);
        }
    }

    /// Sends to every peer this one talks to, skipping `except`. Gameplay
    /// frames go out once unsequenced and once sequenced.
    fn broadcast(&mut self, data: &[u8], except: Option<UserId>, gameplay: bool) {
        for id in self.send_targets() {
            if Some(id) == except {
                continue;
            }
            if gameplay {
                if let Err(e) = self.transport.send_single_unsequenced(id, data) {
                    log::debug!("Unsequenced send to user {} failed: {}", id, e);
                }
            }
            self.send(id, data);
        }
    }

    fn send_message(&mut self, id: UserId, message: &NetMessage) {
        match message.encode() {
            Ok(data) => self.send(id, &data),
            Err(e) => log::error!("Failed to encode {:?}: {}", message.message_type(), e),
        }
    }

    /// Pops a message from `id`, preferring ones set aside earlier.
    fn next_message(&mut self, id: UserId, timeout: Duration) -> Option<Vec<u8>> {
        if let Some(index) = self.deferred.iter().position(|(source, _)| *source == id) {
            return self.deferred.remove(index).map(|(_, data)| data);
        }
        if self.transport.message_ready(id, timeout) == 0 {
            return None;
        }
        let data = self.transport.read_message(id, MAX_TRANSFER_SIZE);
        if data.is_none() {
            log::warn!("Problem reading message from user {}", id);
        }
        data
    }

    /// Accepts newcomers and handles lost peers.
    fn poll_transport(&mut self) {
        let locked = self.locked;
        let is_host = self.role == Role::Host;
        let roster = &mut self.roster;
        let mut accepted = Vec::new();
        self.transport.update(&mut || {
            if locked || !is_host {
                return None;
            }
            let id = roster.claim_free_slot()?;
            accepted.push(id);
            Some(id)
        });
        for id in accepted {
            log::info!("New user connected in slot {}", id);
        }

        while let Ok(event) = self.drops.try_recv() {
            self.on_dropped_user(event.id, event.reason);
        }
    }

    fn kick_user(&mut self, id: UserId) {
        self.transport.drop_user(id);
        self.on_dropped_user(id, DropReason::Kicked);
    }

    fn on_dropped_user(&mut self, id: UserId, reason: DropReason) {
        if Some(id) == self.my_id {
            log::error!("Bug: local user {} reported as dropped ({})", id, reason.as_str());
            return;
        }
        match self.role {
            Role::Idle => {}
            Role::Client => {
                log::warn!("User {} {}, leaving session", id, reason.as_str());
                self.stop();
            }
            Role::Host => {
                let was_active = self.roster.get(id).is_some_and(NetUser::is_active);
                self.roster.release(id);
                if !was_active {
                    return;
                }
                log::info!("User {} {}", id, reason.as_str());
                let update = NetMessage::UserUpdate {
                    id,
                    progress: UserProgress::Unused,
                    name: String::new(),
                };
                for target in self.send_targets() {
                    self.send_message(target, &update);
                }
                if let Some(user) = self.roster.get(id) {
                    self.hooks.user_updated(user);
                }
            }
        }
    }

    fn protocol_violation(&self, source: UserId, error: &CodecError) -> ! {
        let reason = format!("message from user {} is out of range: {}", source, error);
        (self.abort)(&reason)
    }

    fn is_deferred_type(message_type: MessageType) -> bool {
        matches!(
            message_type,
            MessageType::ResyncDiagnostics
                | MessageType::ResyncData
                | MessageType::ResyncResume
                | MessageType::TimeSyncRequest
                | MessageType::TimeSyncReply
                | MessageType::TimeSyncComplete
        )
    }

    /// Decodes and applies one message read from `source`.
    fn process_message(
        &mut self,
        source: UserId,
        data: Vec<u8>,
        frames: Option<&mut FrameBuffer>,
    ) -> Processed {
        let message_type = match MessageType::of(&data) {
            Ok(message_type) => message_type,
            Err(e) => {
                log::warn!("Ignoring message from user {}: {}", source, e);
                return Processed::Rejected;
            }
        };
        if Self::is_deferred_type(message_type) {
            log::trace!("Setting aside {:?} from user {}", message_type, source);
            self.deferred.push_back((source, data));
            return Processed::Deferred;
        }
        if data.len() > MAX_MESSAGE_SIZE {
            log::warn!("{:?} from user {} is {} bytes, dropped", message_type, source, data.len());
            return Processed::Rejected;
        }

        let message = match NetMessage::decode(&data, self.roster.slots()) {
            Ok(message) => message,
            Err(e) if e.is_protocol_violation() => self.protocol_violation(source, &e),
            Err(e) if message_type == MessageType::Login => {
                log::warn!("Connected peer {} sent invalid login: {}", source, e);
                if self.is_host() {
                    self.kick_user(source);
                }
                return Processed::Rejected;
            }
            Err(e) => {
                log::warn!("Malformed {:?} from user {}: {}", message_type, source, e);
                return Processed::Rejected;
            }
        };

        log::trace!("{:?} from user {}", message_type, source);
        match message {
            NetMessage::Login { password, name } => self.handle_login(source, &password, &name),
            NetMessage::LoginReply { id } => {
                if self.role != Role::Client || source != SERVER_ID {
                    log::warn!("Unexpected login reply from user {}", source);
                    return Processed::Rejected;
                }
                self.my_id = Some(id);
                let name = self.local_name.clone();
                self.roster.set(id, UserProgress::LoggedIn, &name);
            }
            NetMessage::UserUpdate { id, progress, name } => {
                if self.role != Role::Client || source != SERVER_ID {
                    log::warn!("Unexpected user update from user {}", source);
                    return Processed::Rejected;
                }
                self.roster.set(id, progress, &name);
                if let Some(user) = self.roster.get(id) {
                    self.hooks.user_updated(user);
                }
            }
            NetMessage::Frame {
                peer, seq, payload, ..
            } => {
                if !self.accept_frame_from(source, peer) {
                    return Processed::Rejected;
                }
                if let Some(user) = self.roster.get_mut(peer) {
                    user.ack = seq;
                }
                if let Some(slot) = frames.and_then(|f| f.slot_mut(peer)) {
                    if slot.len() == payload.len() {
                        slot.copy_from_slice(&payload);
                    } else {
                        log::warn!(
                            "Frame of {} bytes from user {}, expected {}",
                            payload.len(),
                            peer,
                            slot.len()
                        );
                    }
                }
                self.relay(source, &data, false);
                return Processed::Frame { message_type, peer };
            }
            NetMessage::Gameplay { peer, seq, bundle } => {
                if !self.accept_frame_from(source, peer) {
                    return Processed::Rejected;
                }
                if let Some(user) = self.roster.get_mut(peer) {
                    user.ack = seq;
                }
                if let (Some(newest), Some(slot)) =
                    (bundle.newest(), frames.and_then(|f| f.slot_mut(peer)))
                {
                    if slot.len() == TurnPacket::SIZE {
                        slot.copy_from_slice(&newest.to_bytes());
                    }
                }
                let stored = unbundle(&bundle, peer, &mut self.store);
                log::trace!("Stored {} new packets of user {}", stored, peer);
                self.relay(source, &data, true);
                if peer == source {
                    return Processed::OwnGameplay;
                }
            }
            NetMessage::Pause { paused, delay_ms } => {
                log::debug!("Pause message: paused={} delay={}ms", paused, delay_ms);
                self.apply_pause(paused, delay_ms);
                self.relay(source, &data, false);
            }
            NetMessage::Chat { player, text } => {
                self.hooks.chat(player, &text);
                self.relay(source, &data, false);
            }
            // set aside before decoding
            NetMessage::ResyncDiagnostics { .. }
            | NetMessage::ResyncResume { .. }
            | NetMessage::TimeSyncRequest { .. }
            | NetMessage::TimeSyncReply { .. }
            | NetMessage::TimeSyncComplete { .. } => return Processed::Deferred,
        }
        Processed::Handled
    }

    fn apply_pause(&mut self, paused: bool, delay_ms: u32) {
        if paused || delay_ms == 0 {
            self.scheduled_unpause = None;
            self.hooks.pause_changed(paused);
        } else {
            self.scheduled_unpause = Some(Instant::now() + Duration::from_millis(delay_ms as u64));
        }
    }

    /// Clients may only send frames about themselves.
    fn accept_frame_from(&self, source: UserId, peer: UserId) -> bool {
        if self.role == Role::Host && peer != source {
            log::warn!("User {} sent a frame claiming to be user {}", source, peer);
            return false;
        }
        if Some(peer) == self.my_id {
            log::warn!("User {} echoed our own frame", source);
            return false;
        }
        true
    }

    /// The host forwards client frames and chat to every other client.
    fn relay(&mut self, source: UserId, data: &[u8], gameplay: bool) {
        if self.role == Role::Host {
            self.broadcast(data, Some(source), gameplay);
        }
    }

    fn handle_login(&mut self, source: UserId, password: &str, name: &str) {
        if self.role != Role::Host {
            log::warn!("Login message received by a client");
            return;
        }
        if self.roster.get(source).map(|u| u.progress) != Some(UserProgress::Connected) {
            log::info!("Peer {} was not in connected state", source);
            return;
        }
        if !self.password.is_empty() && password != self.password {
            log::info!("Peer {} chose wrong password", source);
            self.kick_user(source);
            return;
        }
        if !name.chars().next().is_some_and(|c| c.is_ascii_alphanumeric()) {
            log::info!("Connected peer {} sent invalid name {:?}", source, name);
            self.kick_user(source);
            return;
        }

        self.roster.set(source, UserProgress::LoggedIn, name);
        log::info!("User {} successfully logged in as {}", source, name);
        self.send_message(source, &NetMessage::LoginReply { id: source });

        // every known user to the newcomer, the newcomer to everyone else
        for user in self.roster.iter().filter(|u| u.is_active()).cloned().collect::<Vec<_>>() {
            self.send_message(
                source,
                &NetMessage::UserUpdate {
                    id: user.id,
                    progress: user.progress,
                    name: user.name.clone(),
                },
            );
            if Some(user.id) != self.my_id && user.id != source && user.is_logged_in() {
                self.send_message(
                    user.id,
                    &NetMessage::UserUpdate {
                        id: source,
                        progress: UserProgress::LoggedIn,
                        name: name.to_string(),
                    },
                );
            }
        }
        if let Some(user) = self.roster.get(source) {
            self.hooks.user_updated(user);
        }
    }

    /// Yields to the draw hook of the current phase.
    fn yield_draw(&mut self, kind: ExchangeKind) {
        match kind {
            ExchangeKind::Frontend => self.hooks.draw_frontend(),
            ExchangeKind::SmallData | ExchangeKind::Gameplay => self.hooks.draw_gameplay(),
        }
        self.last_draw = Instant::now();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.transport.exit();
    }
}
