use std::time::{Duration, Instant};

use super::{Role, Session};
use crate::desync::DesyncReport;
use crate::error::SessionError;
use crate::net::SERVER_ID;
use crate::protocol::{MessageType, NetMessage, ResyncError, resync};

const PROGRESS_STEPS: u32 = 6;
const POLL_SLICE: Duration = Duration::from_millis(100);

/// The simulation state a resync transfers.
pub trait SyncedGame {
    /// Size of the serialized state. Both sides must agree on it.
    fn state_size(&self) -> usize;

    fn save_state(&self) -> Vec<u8>;

    fn load_state(&mut self, state: &[u8]) -> Result<(), ResyncError>;

    /// Called before the transfer so player-local state (selection, camera
    /// context and the like) survives it.
    fn stash_local_state(&mut self) {}

    fn restore_local_state(&mut self) {}
}

impl Session {
    /// Transfers the host's state to every client, then runs the time sync
    /// barrier. On clients, returns the desync diagnosis if one was pending.
    pub fn resync_game(
        &mut self,
        game: &mut dyn SyncedGame,
    ) -> Result<Option<DesyncReport>, SessionError> {
        if self.role == Role::Idle {
            return Err(SessionError::NotRunning);
        }
        log::info!("Starting resync as {:?}", self.role);
        self.hooks.resync_progress(0, PROGRESS_STEPS);

        game.stash_local_state();
        let transfer = match self.role {
            Role::Host => self.send_resync(game),
            _ => self.receive_resync(game),
        };
        game.restore_local_state();
        transfer?;
        self.hooks.resync_progress(2, PROGRESS_STEPS);

        let step = if self.is_host() { 3 } else { 4 };
        self.hooks.resync_progress(step, PROGRESS_STEPS);
        let barrier = self.time_sync();

        self.store.clear();
        self.redundancy.clear();
        self.input_lag.reset();
        self.deferred.clear();
        self.scheduled_unpause = None;

        let report = if self.is_host() {
            None
        } else {
            self.desync.compare_with_host()
        };
        self.desync.clear_desync();
        barrier?;

        self.hooks.resync_progress(PROGRESS_STEPS, PROGRESS_STEPS);
        log::info!("Resync complete");
        Ok(report)
    }

    fn send_resync(&mut self, game: &mut dyn SyncedGame) -> Result<(), SessionError> {
        let targets = self.send_targets();

        match self.desync.pack_history() {
            Ok(history) => {
                let diagnostics = NetMessage::ResyncDiagnostics { history };
                for &id in &targets {
                    self.send_message(id, &diagnostics);
                }
            }
            Err(e) => log::warn!("Desync history unavailable: {}", e),
        }

        // the state goes out unpaused
        self.apply_pause(false, 0);
        let state = game.save_state();
        let message = resync::pack(&state)?;
        log::info!(
            "Sending {} byte state ({} compressed) to {} peers",
            state.len(),
            message.len(),
            targets.len()
        );
        for id in targets {
            self.send(id, &message);
        }
        Ok(())
    }

    fn receive_resync(&mut self, game: &mut dyn SyncedGame) -> Result<(), SessionError> {
        let expected = game.state_size();
        let deadline = Instant::now() + self.config.resync_timeout();
        loop {
            self.poll_transport();
            if self.role == Role::Idle {
                return Err(ResyncError::NotConnected.into());
            }
            let now = Instant::now();
            if now >= deadline {
                log::error!("No resync data within {:?}", self.config.resync_timeout());
                return Err(ResyncError::Timeout.into());
            }

            let Some(data) = self.next_message(SERVER_ID, (deadline - now).min(POLL_SLICE)) else {
                self.hooks.resync_progress(1, PROGRESS_STEPS);
                continue;
            };
            match MessageType::of(&data) {
                Ok(MessageType::ResyncData) => match resync::unpack(&data, expected) {
                    Ok(state) => {
                        game.load_state(&state)?;
                        log::info!("Received {} byte state", state.len());
                        return Ok(());
                    }
                    Err(e) if e.is_fatal() => {
                        log::error!("Resync failed: {}", e);
                        return Err(e.into());
                    }
                    Err(e) => log::warn!("Rejected resync message: {}", e),
                },
                Ok(MessageType::ResyncDiagnostics) => {
                    match NetMessage::decode(&data, self.roster.slots()) {
                        Ok(NetMessage::ResyncDiagnostics { history }) => {
                            if let Err(e) = self.desync.store_host_history(&history) {
                                log::warn!("Unreadable host desync history: {}", e);
                            }
                        }
                        other => log::warn!("Bad desync diagnostics: {:?}", other.err()),
                    }
                }
                Ok(message_type) if Self::is_deferred_type(message_type) => {
                    log::warn!("Discarding {:?} received before resync data", message_type);
                }
                _ => {
                    self.process_message(SERVER_ID, data, None);
                }
            }
        }
    }
}
