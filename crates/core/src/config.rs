use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::net::MAX_USERS;

/// Tunables for one lockstep session.
///
/// Durations are stored as milliseconds so the struct can be embedded in a
/// host application's own config files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    pub max_players: usize,
    pub turns_per_second: u32,
    pub draw_fps: u32,
    pub lobby_exchange_timeout_ms: u64,
    pub join_timeout_ms: u64,
    pub missing_packet_timeout_ms: u64,
    pub resync_timeout_ms: u64,
    pub timesync_timeout_ms: u64,
    pub resume_timeout_ms: u64,
    pub spin_threshold_ms: u64,
    pub desync_history_len: usize,
    pub packet_window: usize,
    pub input_lag: InputLagConfig,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            max_players: 4,
            turns_per_second: 20,
            draw_fps: 60,
            lobby_exchange_timeout_ms: 2000,
            join_timeout_ms: 10_000,
            missing_packet_timeout_ms: 2000,
            resync_timeout_ms: 30_000,
            timesync_timeout_ms: 15_000,
            resume_timeout_ms: 10_000,
            spin_threshold_ms: 5,
            desync_history_len: 15,
            packet_window: 32,
            input_lag: InputLagConfig::default(),
        }
    }
}

impl NetConfig {
    pub fn player_slots(&self) -> usize {
        self.max_players.clamp(1, MAX_USERS)
    }

    pub fn turn_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.turns_per_second.max(1) as f64)
    }

    /// Zero disables render pacing.
    pub fn draw_interval(&self) -> Duration {
        if self.draw_fps == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(1_000_000_000 / self.draw_fps as u64)
        }
    }

    pub fn lobby_exchange_timeout(&self) -> Duration {
        Duration::from_millis(self.lobby_exchange_timeout_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn missing_packet_timeout(&self) -> Duration {
        Duration::from_millis(self.missing_packet_timeout_ms)
    }

    pub fn resync_timeout(&self) -> Duration {
        Duration::from_millis(self.resync_timeout_ms)
    }

    pub fn timesync_timeout(&self) -> Duration {
        Duration::from_millis(self.timesync_timeout_ms)
    }

    pub fn resume_timeout(&self) -> Duration {
        Duration::from_millis(self.resume_timeout_ms)
    }

    pub fn spin_threshold(&self) -> Duration {
        Duration::from_millis(self.spin_threshold_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputLagConfig {
    pub initial_turns: u32,
    pub min_turns: u32,
    pub max_turns: u32,
    pub warmup_ms: u64,
    pub sample_period_ms: u64,
}

impl Default for InputLagConfig {
    fn default() -> Self {
        Self {
            initial_turns: 2,
            min_turns: 1,
            max_turns: 8,
            warmup_ms: 3000,
            sample_period_ms: 2000,
        }
    }
}
