mod config;
mod game;
mod world;

use anyhow::Result;
use clap::Parser;
use turnlock::{InputLagConfig, LinkConditions, NetConfig};

use config::PeerConfig;

#[derive(Parser)]
#[command(name = "turnlock-peer")]
#[command(about = "Lockstep peer running a small synchronized dungeon")]
struct Args {
    #[arg(short, long, default_value = "udp", help = "Network service: udp or memory")]
    service: String,

    #[arg(short, long, help = "Host endpoint to join; hosts when omitted")]
    join: Option<String>,

    #[arg(short, long, default_value = "0.0.0.0:5556")]
    bind: String,

    #[arg(short, long, default_value = "Keeper")]
    name: String,

    #[arg(long, default_value = "")]
    password: String,

    #[arg(short, long, default_value_t = 2, help = "Players the host waits for")]
    players: usize,

    #[arg(short, long, default_value_t = 4)]
    max_players: usize,

    #[arg(short, long, default_value_t = 20)]
    turns_per_second: u32,

    #[arg(long, default_value_t = 200)]
    turns: u32,

    #[arg(long, default_value_t = 2, help = "Fixed input lag in turns")]
    input_lag: u32,

    #[arg(long, help = "Corrupt a client's state after this turn")]
    desync_at: Option<u32>,

    #[arg(long, help = "Enable packet loss simulation")]
    simulate_packet_loss: bool,

    #[arg(long, default_value_t = 0.0, help = "Packet loss percentage (0-100)")]
    loss_percent: f32,

    #[arg(long, default_value_t = 0, help = "Minimum latency in ms")]
    min_latency: u32,

    #[arg(long, default_value_t = 0, help = "Maximum latency in ms")]
    max_latency: u32,

    #[arg(long, default_value_t = 0, help = "Jitter in ms")]
    jitter: u32,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    // every peer must simulate with the same delay
    let input_lag = InputLagConfig {
        initial_turns: args.input_lag,
        min_turns: args.input_lag,
        max_turns: args.input_lag,
        ..Default::default()
    };
    let net = NetConfig {
        max_players: args.max_players,
        turns_per_second: args.turns_per_second,
        input_lag,
        ..Default::default()
    };
    let conditions = if args.simulate_packet_loss {
        LinkConditions {
            enabled: true,
            loss_percent: args.loss_percent,
            min_latency_ms: args.min_latency,
            max_latency_ms: args.max_latency,
            jitter_ms: args.jitter,
            ..Default::default()
        }
    } else {
        LinkConditions::default()
    };

    let config = PeerConfig {
        service: args.service,
        hosting: args.join.is_none(),
        endpoint: args.join.unwrap_or(args.bind),
        name: args.name,
        password: args.password,
        players: args.players.max(1),
        turns: args.turns,
        desync_at: args.desync_at,
        net,
        conditions,
    };

    game::run(config)
}
