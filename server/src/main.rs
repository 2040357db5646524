use clap::Parser;
use log::info;
use server::config::{tick_duration_for, ServerConfig, SyncMode};
use server::network::Server;
use shared::TransformLimits;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server IP address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Server port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Broadcast ticks per second
    #[arg(short, long, default_value = "20")]
    tick_rate: u32,

    /// Maximum number of concurrent clients
    #[arg(short, long, default_value = "64")]
    max_clients: usize,

    /// Broadcast only changed players (delta) or everyone (snapshot) each tick
    #[arg(long, value_enum, default_value = "delta")]
    sync_mode: SyncMode,

    /// Include each client's own state in its state updates
    #[arg(long)]
    echo_self: bool,

    /// Close connections silent for this many seconds (0 disables)
    #[arg(long, default_value = "0")]
    idle_timeout: u64,

    /// Per-client outbound queue length
    #[arg(long, default_value = "256")]
    outbound_queue: usize,

    /// Maximum absolute value of any position component
    #[arg(long, default_value = "10000")]
    world_bound: f32,

    /// Random horizontal spread around the spawn point
    #[arg(long, default_value = "0")]
    spawn_radius: f32,

    /// Malformed events tolerated per window before disconnecting (0 disables)
    #[arg(long, default_value = "10")]
    max_malformed: u32,

    /// Length of the malformed-event window in seconds
    #[arg(long, default_value = "5")]
    malformed_window: u64,
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        ServerConfig {
            bind_address: format!("{}:{}", args.host, args.port),
            tick_duration: tick_duration_for(args.tick_rate),
            max_clients: args.max_clients,
            sync_mode: args.sync_mode,
            echo_self: args.echo_self,
            idle_timeout: (args.idle_timeout > 0).then(|| Duration::from_secs(args.idle_timeout)),
            outbound_queue: args.outbound_queue,
            limits: TransformLimits {
                world_bound: args.world_bound,
            },
            spawn_radius: args.spawn_radius,
            max_malformed: args.max_malformed,
            malformed_window: Duration::from_secs(args.malformed_window),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    info!("Starting server on {}:{}", args.host, args.port);
    info!("Tick rate: {}Hz ({:?} sync)", args.tick_rate, args.sync_mode);
    info!("Max clients: {}", args.max_clients);

    let server = Server::new(args.into()).await?;
    server
        .run_until(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl+C, shutting down gracefully...");
            }
        })
        .await?;

    Ok(())
}
