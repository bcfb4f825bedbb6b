//! Standalone relay server binary.

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tether_relay::{RelayConfig, RelayServer};

#[derive(Parser, Debug)]
#[command(name = "tether-relayd", about = "Topic pub/sub relay for tether pairings")]
struct Args {
    /// Host to bind.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind (0 picks a free port).
    #[arg(long, default_value_t = 3000)]
    port: u16,

    /// Seconds an idle topic survives before eviction.
    #[arg(long, default_value_t = 60)]
    idle_secs: u64,

    /// Seconds between eviction sweeps.
    #[arg(long, default_value_t = 10)]
    sweep_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config = RelayConfig {
        host: args.host,
        port: args.port,
        idle_secs: args.idle_secs,
        sweep_secs: args.sweep_secs,
        ..RelayConfig::default()
    };

    let server = RelayServer::new(config);
    let (addr, handle) = server.listen().await?;
    info!(%addr, "relay up");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    server.shutdown().graceful_shutdown(vec![handle], None).await;
    Ok(())
}
