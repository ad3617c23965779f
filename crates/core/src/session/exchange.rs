use std::time::{Duration, Instant};

use super::{Processed, Role, Session};
use crate::error::{ExchangeError, SessionError};
use crate::net::UserId;
use crate::protocol::{FrameKind, MessageType, NetMessage, TurnPacket};
use crate::turn::FrameBuffer;

const MISSING_POLL_SLICE: Duration = Duration::from_millis(10);

/// Phase of the game an exchange belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Frontend,
    SmallData,
    Gameplay,
}

impl ExchangeKind {
    fn frame_kind(self) -> Option<FrameKind> {
        match self {
            ExchangeKind::Frontend => Some(FrameKind::Frontend),
            ExchangeKind::SmallData => Some(FrameKind::SmallData),
            ExchangeKind::Gameplay => None,
        }
    }

    fn matches(self, message_type: MessageType) -> bool {
        matches!(
            (self, message_type),
            (ExchangeKind::Frontend, MessageType::Frontend)
                | (ExchangeKind::SmallData, MessageType::SmallData)
                | (ExchangeKind::Gameplay, MessageType::Gameplay)
        )
    }
}

impl Session {
    /// Publishes the local frame and collects one from every peer.
    ///
    /// `local` is written into this peer's slot of `frames`; other slots are
    /// filled as frames arrive. Peers that miss the deadline keep their old
    /// contents. The sequence counter advances regardless.
    pub fn exchange(
        &mut self,
        kind: ExchangeKind,
        local: &[u8],
        frames: &mut FrameBuffer,
    ) -> Result<(), SessionError> {
        let me = self
            .my_id
            .filter(|&id| self.roster.contains(id))
            .ok_or(ExchangeError::NotConnected)?;
        if frames.frame_size() != local.len() {
            return Err(ExchangeError::FrameSize {
                expected: local.len(),
                actual: frames.frame_size(),
            }
            .into());
        }

        self.poll_transport();
        if self.role == Role::Idle {
            return Err(ExchangeError::NotConnected.into());
        }
        if let Some(slot) = frames.slot_mut(me) {
            slot.copy_from_slice(local);
        }

        let message = match kind.frame_kind() {
            Some(frame_kind) => NetMessage::Frame {
                kind: frame_kind,
                peer: me,
                seq: self.seq,
                payload: local.to_vec(),
            },
            None => {
                let packet = TurnPacket::from_bytes(local).map_err(ExchangeError::from)?;
                self.store.insert_if_absent(me, packet);
                NetMessage::Gameplay {
                    peer: me,
                    seq: self.seq,
                    bundle: self.redundancy.bundle(me, packet),
                }
            }
        };
        let data = message.encode().map_err(ExchangeError::from)?;
        self.broadcast(&data, None, kind == ExchangeKind::Gameplay);

        for id in self.listen_targets() {
            self.collect_from(id, kind, frames)?;
        }

        self.update_input_lag();
        self.seq = self.seq.wrapping_add(1);
        Ok(())
    }

    /// Gameplay exchange of one turn packet. `frames` must hold packet-sized
    /// slots.
    pub fn exchange_turn(
        &mut self,
        packet: &TurnPacket,
        frames: &mut FrameBuffer,
    ) -> Result<(), SessionError> {
        self.exchange(ExchangeKind::Gameplay, &packet.to_bytes(), frames)
    }

    fn collect_from(
        &mut self,
        id: UserId,
        kind: ExchangeKind,
        frames: &mut FrameBuffer,
    ) -> Result<(), SessionError> {
        let gameplay = kind == ExchangeKind::Gameplay;
        let timeout = if gameplay {
            self.config.turn_period()
        } else {
            self.config.lobby_exchange_timeout()
        };
        let pacing = match kind {
            ExchangeKind::Frontend => Duration::ZERO,
            _ => self.config.draw_interval(),
        };

        let start = Instant::now();
        let mut seen = false;
        loop {
            if self.role == Role::Idle {
                return Err(ExchangeError::NotConnected.into());
            }
            if !self.roster.get(id).is_some_and(|user| user.is_active()) {
                log::debug!("User {} left during exchange", id);
                break;
            }

            let now = Instant::now();
            let elapsed = now.duration_since(start);
            if elapsed >= timeout {
                log::debug!("Exchange with user {} timed out after {:?}", id, elapsed);
                break;
            }
            let mut wait = if seen { Duration::ZERO } else { timeout - elapsed };
            if !pacing.is_zero() {
                let draw_due = self.last_draw + pacing;
                wait = wait.min(draw_due.saturating_duration_since(now));
            }

            match self.next_message(id, wait) {
                Some(data) => match self.process_message(id, data, Some(&mut *frames)) {
                    Processed::OwnGameplay if gameplay => seen = true,
                    // relayed frames of other clients do not count
                    Processed::Frame { message_type, peer } if !gameplay => {
                        if kind.matches(message_type) && peer == id {
                            break;
                        }
                    }
                    _ => {}
                },
                None if seen => break,
                None => {
                    if !pacing.is_zero() && self.last_draw.elapsed() >= pacing {
                        self.yield_draw(kind);
                    }
                }
            }
        }
        Ok(())
    }

    /// Blocks until every logged-in player's packet for `turn` is stored or
    /// the missing packet timeout passes. A complete turn is copied into
    /// `frames`; returns whether the turn is complete.
    pub fn wait_for_missing_packets(
        &mut self,
        turn: u32,
        frames: &mut FrameBuffer,
    ) -> Result<bool, SessionError> {
        if self.input_lag.skip_initial_input_turns() > 0 {
            return Ok(true);
        }

        let deadline = Instant::now() + self.config.missing_packet_timeout();
        let pacing = self.config.draw_interval();
        loop {
            let players = self.roster.logged_in_ids();
            if let Some(packets) = self.store.complete(turn, &players) {
                for (id, packet) in packets {
                    if let Some(slot) = frames.slot_mut(id).filter(|s| s.len() == TurnPacket::SIZE) {
                        slot.copy_from_slice(&packet.to_bytes());
                    }
                }
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                log::warn!("Gave up waiting for packets of turn {}", turn);
                return Ok(false);
            }

            self.poll_transport();
            if self.role == Role::Idle {
                return Err(ExchangeError::NotConnected.into());
            }
            let slice = (deadline - now).min(MISSING_POLL_SLICE);
            for id in self.listen_targets() {
                if let Some(data) = self.next_message(id, slice) {
                    self.process_message(id, data, Some(&mut *frames));
                }
            }
            if self.last_draw.elapsed() >= pacing {
                self.yield_draw(ExchangeKind::Gameplay);
            }
        }
    }

    /// True while the first turns after a start or resync run without
    /// waiting for input. Consumes one such turn.
    pub fn consume_skip_turn(&mut self) -> bool {
        self.input_lag.take_skip_turn()
    }

    /// Sends a pause change now and applies it locally.
    pub fn send_pause_immediate(&mut self, paused: bool, delay_ms: u32) -> Result<(), SessionError> {
        if self.role == Role::Idle {
            return Err(SessionError::NotRunning);
        }
        let data = NetMessage::Pause { paused, delay_ms }
            .encode()
            .map_err(ExchangeError::from)?;
        self.broadcast(&data, None, false);
        self.apply_pause(paused, delay_ms);
        Ok(())
    }

    pub fn send_chat_immediate(&mut self, player: UserId, text: &str) -> Result<(), SessionError> {
        if self.role == Role::Idle {
            return Err(SessionError::NotRunning);
        }
        let data = NetMessage::Chat {
            player,
            text: text.to_string(),
        }
        .encode()
        .map_err(ExchangeError::from)?;
        self.broadcast(&data, None, false);
        Ok(())
    }

    fn update_input_lag(&mut self) {
        let me = self.my_id;
        for user in self.roster.iter().filter(|u| u.is_logged_in() && Some(u.id) != me) {
            let (Some(connected_at), Some(rtt)) = (user.connected_at, self.transport.latency(user.id))
            else {
                continue;
            };
            self.input_lag.observe(connected_at.elapsed(), rtt);
        }
        if let Some(lag) = self.input_lag.update(Instant::now()) {
            log::info!("Input lag is now {} turns", lag);
        }
    }
}
