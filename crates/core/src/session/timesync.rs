//! Clock offset negotiation so every peer resumes simulation together.

use std::time::{Duration, Instant};

use super::{Role, Session};
use crate::error::{SessionError, TimeSyncError};
use crate::net::{SERVER_ID, UserId};
use crate::protocol::{MessageType, NetMessage};

const MIN_RESUME_DELAY: Duration = Duration::from_millis(100);
const MAX_RESUME_DELAY: Duration = Duration::from_millis(1000);
const DEFAULT_RESUME_DELAY: Duration = Duration::from_millis(500);
const RTT_MULTIPLIER: u32 = 3;
const SETTLE_DELAY: Duration = Duration::from_millis(100);
const IDLE_SLEEP: Duration = Duration::from_millis(1);
const POLL_SLICE: Duration = Duration::from_millis(100);

/// Microsecond timestamps relative to the session's creation.
#[derive(Debug, Clone, Copy)]
pub struct NetClock {
    epoch: Instant,
}

impl Default for NetClock {
    fn default() -> Self {
        Self::new()
    }
}

impl NetClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    pub fn now_micros(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }
}

/// Result of the last time sync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeSyncState {
    pub rtt: Option<Duration>,
    /// Host clock minus local clock, in microseconds.
    pub offset_micros: i64,
    /// Local clock time the simulation resumed at.
    pub resume_at: Option<u64>,
}

pub fn round_trip(client_send: u64, client_receive: u64) -> u64 {
    client_receive.saturating_sub(client_send)
}

/// Offset of the host clock relative to the local one from the four
/// timestamps of a request/reply pair.
pub fn clock_offset(client_send: u64, host_receive: u64, host_send: u64, client_receive: u64) -> i64 {
    let outbound = host_receive as i64 - client_send as i64;
    let inbound = host_send as i64 - client_receive as i64;
    (outbound + inbound) / 2
}

/// Converts a host resume time into local clock time.
pub fn translate_resume(host_resume: u64, offset_micros: i64) -> u64 {
    let local = host_resume as i128 - offset_micros as i128;
    local.clamp(0, u64::MAX as i128) as u64
}

/// Delay before resuming: three round trips of the slowest peer, clamped.
pub fn resume_delay(worst_rtt: Option<Duration>) -> Duration {
    match worst_rtt {
        Some(rtt) if !rtt.is_zero() => {
            (rtt * RTT_MULTIPLIER).clamp(MIN_RESUME_DELAY, MAX_RESUME_DELAY)
        }
        _ => DEFAULT_RESUME_DELAY,
    }
}

/// Sleeps until `spin` before `deadline` then spins the rest.
pub fn wait_until(clock: &NetClock, deadline: u64, spin: Duration) {
    let spin_micros = spin.as_micros() as u64;
    let now = clock.now_micros();
    if deadline > now && deadline - now > spin_micros * 2 {
        std::thread::sleep(Duration::from_micros(deadline - now - spin_micros));
    }
    while clock.now_micros() < deadline {
        std::hint::spin_loop();
    }
}

impl Session {
    /// Runs the time sync barrier for the local role.
    pub fn time_sync(&mut self) -> Result<(), SessionError> {
        match self.role {
            Role::Host => {
                self.time_sync_host();
                Ok(())
            }
            Role::Client => self.time_sync_client(),
            Role::Idle => Err(SessionError::NotRunning),
        }
    }

    /// Answers every client's request, drops the ones that never finish and
    /// broadcasts the resume time.
    fn time_sync_host(&mut self) {
        let me = self.my_id;
        let mut pending: Vec<UserId> = self
            .roster
            .logged_in_ids()
            .into_iter()
            .filter(|&id| Some(id) != me)
            .collect();
        let mut synced: Vec<(UserId, Duration)> = Vec::new();
        log::info!("Time sync with {} peers", pending.len());

        let deadline = Instant::now() + self.config.timesync_timeout();
        while !pending.is_empty() && Instant::now() < deadline {
            self.poll_transport();
            pending.retain(|&id| self.roster.get(id).is_some_and(|u| u.is_logged_in()));

            let mut idle = true;
            for id in pending.clone() {
                while let Some(data) = self.next_message(id, Duration::ZERO) {
                    idle = false;
                    match MessageType::of(&data) {
                        Ok(MessageType::TimeSyncRequest) => self.answer_time_request(id, &data),
                        Ok(MessageType::TimeSyncComplete) => {
                            match NetMessage::decode(&data, self.roster.slots()) {
                                Ok(NetMessage::TimeSyncComplete { rtt }) => {
                                    let rtt = Duration::from_micros(rtt);
                                    log::debug!("User {} synced, rtt {:?}", id, rtt);
                                    synced.push((id, rtt));
                                    pending.retain(|&p| p != id);
                                    break;
                                }
                                other => log::warn!("Bad time sync report from user {}: {:?}", id, other),
                            }
                        }
                        Ok(message_type) if Self::is_deferred_type(message_type) => {
                            log::warn!("Discarding {:?} from user {} during time sync", message_type, id);
                        }
                        _ => {
                            self.process_message(id, data, None);
                        }
                    }
                }
            }
            if idle {
                std::thread::sleep(IDLE_SLEEP);
            }
        }

        std::thread::sleep(SETTLE_DELAY);
        for id in pending {
            log::warn!("User {} did not complete time sync, dropping", id);
            self.kick_user(id);
        }

        let worst = synced.iter().map(|(_, rtt)| *rtt).max();
        let delay = resume_delay(worst);
        let resume_at = self.clock.now_micros() + delay.as_micros() as u64;
        let resume = NetMessage::ResyncResume { resume_at };
        for (id, _) in &synced {
            self.send_message(*id, &resume);
        }
        log::info!("Resuming in {:?} (worst rtt {:?})", delay, worst);

        self.time_sync = TimeSyncState {
            rtt: worst,
            offset_micros: 0,
            resume_at: Some(resume_at),
        };
        wait_until(&self.clock, resume_at, self.config.spin_threshold());
    }

    fn answer_time_request(&mut self, id: UserId, data: &[u8]) {
        let host_receive = self.clock.now_micros();
        match NetMessage::decode(data, self.roster.slots()) {
            Ok(NetMessage::TimeSyncRequest { client_send }) => {
                let reply = NetMessage::TimeSyncReply {
                    client_send,
                    host_receive,
                    host_send: self.clock.now_micros(),
                };
                self.send_message(id, &reply);
            }
            other => log::warn!("Bad time sync request from user {}: {:?}", id, other),
        }
    }

    fn time_sync_client(&mut self) -> Result<(), SessionError> {
        let client_send = self.clock.now_micros();
        self.send_message(SERVER_ID, &NetMessage::TimeSyncRequest { client_send });

        let reply = self.wait_for_host(self.config.timesync_timeout(), MessageType::TimeSyncReply)?;
        let Some(NetMessage::TimeSyncReply {
            client_send,
            host_receive,
            host_send,
        }) = reply
        else {
            log::error!("No time sync reply from host");
            self.stop();
            return Err(TimeSyncError::ReplyTimeout.into());
        };
        let client_receive = self.clock.now_micros();
        let rtt = round_trip(client_send, client_receive);
        let offset = clock_offset(client_send, host_receive, host_send, client_receive);
        log::info!("Time sync: rtt {}us, host clock offset {}us", rtt, offset);
        self.time_sync = TimeSyncState {
            rtt: Some(Duration::from_micros(rtt)),
            offset_micros: offset,
            resume_at: None,
        };
        self.send_message(SERVER_ID, &NetMessage::TimeSyncComplete { rtt });

        let resume = self.wait_for_host(self.config.resume_timeout(), MessageType::ResyncResume)?;
        let Some(NetMessage::ResyncResume { resume_at }) = resume else {
            log::error!("No resume message from host");
            return Err(TimeSyncError::ResumeTimeout.into());
        };
        let local = translate_resume(resume_at, offset);
        self.time_sync.resume_at = Some(local);
        log::debug!("Host resumes at {}us, local {}us", resume_at, local);
        wait_until(&self.clock, local, self.config.spin_threshold());
        Ok(())
    }

    /// Waits for one message of `wanted` from the host. Anything else is
    /// processed normally. `None` on timeout.
    fn wait_for_host(
        &mut self,
        timeout: Duration,
        wanted: MessageType,
    ) -> Result<Option<NetMessage>, SessionError> {
        let deadline = Instant::now() + timeout;
        loop {
            self.poll_transport();
            if self.role == Role::Idle {
                return Err(TimeSyncError::Disconnected.into());
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let Some(data) = self.next_message(SERVER_ID, (deadline - now).min(POLL_SLICE)) else {
                continue;
            };
            match MessageType::of(&data) {
                Ok(message_type) if message_type == wanted => {
                    match NetMessage::decode(&data, self.roster.slots()) {
                        Ok(message) => return Ok(Some(message)),
                        Err(e) => log::warn!("Malformed {:?} from host: {}", wanted, e),
                    }
                }
                Ok(message_type) if Self::is_deferred_type(message_type) => {
                    log::warn!("Discarding {:?} from host during time sync", message_type);
                }
                _ => {
                    self.process_message(SERVER_ID, data, None);
                }
            }
        }
    }
}
