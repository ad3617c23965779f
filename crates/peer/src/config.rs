use turnlock::{LinkConditions, NetConfig};

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub service: String,
    pub endpoint: String,
    pub hosting: bool,
    pub name: String,
    pub password: String,
    /// Players the host waits for before starting.
    pub players: usize,
    pub turns: u32,
    /// Corrupts the local world once this turn is simulated.
    pub desync_at: Option<u32>,
    pub net: NetConfig,
    pub conditions: LinkConditions,
}
