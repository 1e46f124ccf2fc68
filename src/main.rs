use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use room_signaling::config::RelayConfig;
use room_signaling::room::RelayServer;

#[derive(Parser)]
#[command(name = "room-relay")]
#[command(about = "Rendezvous relay pairing two peers per room", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Address to listen on, overriding the configuration file
    #[arg(short, long)]
    listen: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut config = RelayConfig::load_or_default(cli.config.as_ref()).context("loading relay configuration")?;
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }

    let server = RelayServer::bind(config).await.context("binding relay listener")?;

    tokio::select! {
        result = server.run() => result.context("relay stopped")?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }
    Ok(())
}
