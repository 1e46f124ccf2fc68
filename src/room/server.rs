//! WebSocket front end of the relay.
//!
//! Each accepted socket gets a connection id, a writer task draining its
//! outbound queue and a read loop feeding parsed frames into the relay.
//! Frames from one socket reach the relay in the order they were read.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;

use crate::config::RelayConfig;
use crate::error::Result;
use crate::signaling::{ClientMessage, ServerMessage};

use super::relay::{Relay, RelayHandle};
use super::ConnectionId;

pub struct RelayServer {
    listener: TcpListener,
    config: RelayConfig,
    next_connection_id: AtomicU64,
}

impl RelayServer {
    pub async fn bind(config: RelayConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.listen_addr).await?;
        Ok(Self {
            listener,
            config,
            next_connection_id: AtomicU64::new(1),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections until the listener fails.
    pub async fn run(self) -> Result<()> {
        let (relay, _relay_task) = Relay::new().spawn();
        info!("Relay listening on ws://{}", self.local_addr()?);

        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(self.config.max_message_size);

        loop {
            let (stream, addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Accept error: {}", e);
                    return Err(e.into());
                }
            };

            let id = self.next_connection_id.fetch_add(1, Ordering::SeqCst);
            let relay = relay.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, id, relay, ws_config).await {
                    warn!("Connection {} error: {}", id, e);
                }
            });
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    id: ConnectionId,
    relay: RelayHandle,
    ws_config: WebSocketConfig,
) -> Result<()> {
    let ws_stream = tokio_tungstenite::accept_async_with_config(stream, Some(ws_config)).await?;
    debug!("Connection {} upgraded from {}", id, addr);

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    if !relay.connect(id, tx) {
        return Ok(());
    }

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(json) => json,
                Err(e) => {
                    warn!("Failed to encode message for connection {}: {}", id, e);
                    continue;
                }
            };
            if ws_sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg_result) = ws_receiver.next().await {
        match msg_result {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(message) => {
                    if !relay.message(id, message) {
                        break;
                    }
                }
                Err(e) => warn!("Connection {} sent malformed frame: {}", id, e),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Connection {} receive error: {}", id, e);
                break;
            }
        }
    }

    relay.disconnect(id);
    send_task.abort();
    Ok(())
}
