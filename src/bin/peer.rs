use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn};
use tokio::sync::mpsc;

use room_signaling::config::PeerConfig;
use room_signaling::controller::{Command, ControllerEvent, SessionController};
use room_signaling::peer_connection::WebRtcBackend;
use room_signaling::signaling::SignalingClient;

#[derive(Parser)]
#[command(name = "room-peer")]
#[command(about = "Headless peer that joins a room and negotiates a call", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Relay URL, overriding the configuration file
    #[arg(short, long)]
    server: Option<String>,
    /// Room to join
    #[arg(short, long)]
    room: String,
    /// Display token announced to the other member
    #[arg(short, long)]
    display: Option<String>,
    /// Call the other member as soon as one is present
    #[arg(long)]
    call: bool,
    /// Send local media once a call is up, even when answering
    #[arg(long)]
    send_media: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut config = PeerConfig::load_or_default(cli.config.as_ref()).context("loading peer configuration")?;
    if let Some(server) = cli.server {
        config.server_url = server;
    }
    let display_token = cli
        .display
        .or_else(|| config.display_token.clone())
        .unwrap_or_else(|| format!("peer-{}", rand::random::<u32>()));

    let client = SignalingClient::connect(&config.server_url)
        .await
        .with_context(|| format!("connecting to {}", config.server_url))?;
    let (outbound, incoming) = client.into_parts();

    let renegotiation_timeout = Duration::from_millis(config.renegotiation_timeout_ms);
    let backend = WebRtcBackend::new(config).context("initialising WebRTC")?;
    let (mut controller, mut events) = SessionController::new(backend, outbound);
    controller.set_renegotiation_timeout(renegotiation_timeout);
    let mut status = controller.monitor().subscribe();

    let (commands, commands_rx) = mpsc::channel(16);
    let controller_task = tokio::spawn(controller.run(incoming, commands_rx));

    commands
        .send(Command::Join {
            room_id: cli.room.clone(),
            display_token: Some(display_token),
        })
        .await
        .context("controller stopped before joining")?;

    let mut last_error: Option<String> = None;
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    ControllerEvent::Joined { room_id } => info!("In room '{}'", room_id),
                    ControllerEvent::RoomFull { room_id } => {
                        error!("Room '{}' is full", room_id);
                        break;
                    }
                    ControllerEvent::MemberJoined { connection_id, display_token } => {
                        info!("{} joined as {}", display_token.as_deref().unwrap_or("someone"), connection_id);
                        if cli.call {
                            let _ = commands.send(Command::Call).await;
                        }
                    }
                    ControllerEvent::MemberLeft { connection_id } => info!("Member {} left", connection_id),
                    ControllerEvent::CallEstablished { remote } => {
                        info!("Connected to {}", remote);
                        if cli.send_media {
                            let _ = commands.send(Command::SendMedia).await;
                        }
                    }
                    ControllerEvent::RemoteTrack { from, track } => {
                        info!("Receiving {} track from {}", track.kind(), from);
                    }
                    ControllerEvent::RemoteTrackCleared { from } => info!("Track from {} cleared", from),
                    ControllerEvent::MediaAcquisitionFailed { reason } => warn!("Cannot capture media: {}", reason),
                }
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().last_error.clone();
                if current.is_some() && current != last_error {
                    warn!("Last error: {}", current.as_deref().unwrap_or_default());
                    last_error = current;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    let _ = commands.send(Command::Shutdown).await;
    let _ = controller_task.await;
    Ok(())
}
