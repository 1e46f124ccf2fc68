use futures_util::{SinkExt, StreamExt};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::error::{Error, Result};
use crate::room::ConnectionId;

/// Messages a client sends to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    JoinRoom {
        #[serde(rename = "roomId")]
        room_id: String,
        #[serde(rename = "displayToken", default, skip_serializing_if = "Option::is_none")]
        display_token: Option<String>,
    },
    LeaveRoom,
    CallOffer {
        to: ConnectionId,
        offer: Value,
    },
    CallAnswer {
        to: ConnectionId,
        answer: Value,
    },
    RenegotiationOffer {
        to: ConnectionId,
        offer: Value,
    },
    RenegotiationAnswer {
        to: ConnectionId,
        answer: Value,
    },
}

/// Messages the relay sends to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    Joined {
        #[serde(rename = "roomId")]
        room_id: String,
    },
    JoinRejected {
        #[serde(rename = "roomId")]
        room_id: String,
        reason: String,
    },
    MemberJoined {
        #[serde(rename = "connectionId")]
        connection_id: ConnectionId,
        #[serde(rename = "displayToken", default, skip_serializing_if = "Option::is_none")]
        display_token: Option<String>,
    },
    MemberLeft {
        #[serde(rename = "connectionId")]
        connection_id: ConnectionId,
    },
    CallOffer {
        from: ConnectionId,
        offer: Value,
    },
    CallAnswer {
        from: ConnectionId,
        answer: Value,
    },
    RenegotiationOffer {
        from: ConnectionId,
        offer: Value,
    },
    RenegotiationAnswer {
        from: ConnectionId,
        answer: Value,
    },
}

/// The four negotiation message types the relay forwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    CallOffer,
    CallAnswer,
    RenegotiationOffer,
    RenegotiationAnswer,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::CallOffer => "call-offer",
            SignalKind::CallAnswer => "call-answer",
            SignalKind::RenegotiationOffer => "renegotiation-offer",
            SignalKind::RenegotiationAnswer => "renegotiation-answer",
        }
    }
}

/// A negotiation message reduced to its envelope. The payload is never inspected.
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    pub kind: SignalKind,
    pub payload: Value,
}

impl Signal {
    pub fn new(kind: SignalKind, payload: Value) -> Self {
        Self { kind, payload }
    }

    /// Client-side envelope addressed to `to`.
    pub fn addressed_to(self, to: ConnectionId) -> ClientMessage {
        match self.kind {
            SignalKind::CallOffer => ClientMessage::CallOffer { to, offer: self.payload },
            SignalKind::CallAnswer => ClientMessage::CallAnswer { to, answer: self.payload },
            SignalKind::RenegotiationOffer => ClientMessage::RenegotiationOffer { to, offer: self.payload },
            SignalKind::RenegotiationAnswer => ClientMessage::RenegotiationAnswer { to, answer: self.payload },
        }
    }

    /// Relay-side envelope stamped with the sender's real identity.
    pub fn sent_by(self, from: ConnectionId) -> ServerMessage {
        match self.kind {
            SignalKind::CallOffer => ServerMessage::CallOffer { from, offer: self.payload },
            SignalKind::CallAnswer => ServerMessage::CallAnswer { from, answer: self.payload },
            SignalKind::RenegotiationOffer => ServerMessage::RenegotiationOffer { from, offer: self.payload },
            SignalKind::RenegotiationAnswer => ServerMessage::RenegotiationAnswer { from, answer: self.payload },
        }
    }
}

impl ClientMessage {
    /// Splits a negotiation message into its target and signal; room control yields `None`.
    pub fn into_signal(self) -> Option<(ConnectionId, Signal)> {
        match self {
            ClientMessage::CallOffer { to, offer } => Some((to, Signal::new(SignalKind::CallOffer, offer))),
            ClientMessage::CallAnswer { to, answer } => Some((to, Signal::new(SignalKind::CallAnswer, answer))),
            ClientMessage::RenegotiationOffer { to, offer } => {
                Some((to, Signal::new(SignalKind::RenegotiationOffer, offer)))
            }
            ClientMessage::RenegotiationAnswer { to, answer } => {
                Some((to, Signal::new(SignalKind::RenegotiationAnswer, answer)))
            }
            ClientMessage::JoinRoom { .. } | ClientMessage::LeaveRoom => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Session description in the browser's `RTCSessionDescription` JSON shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpKind::Offer, sdp: sdp.into() }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpKind::Answer, sdp: sdp.into() }
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }
}

/// Peer-side WebSocket connection to the relay.
pub struct SignalingClient {
    tx: mpsc::Sender<ClientMessage>,
    rx: mpsc::Receiver<ServerMessage>,
}

impl SignalingClient {
    pub async fn connect(url: &str) -> Result<Self> {
        let (ws_stream, _) = connect_async(url).await?;
        let (mut write, mut read) = ws_stream.split();

        let (tx, rx) = mpsc::channel(100);
        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<ClientMessage>(100);

        // Handle outgoing messages
        tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                match serde_json::to_string(&msg) {
                    Ok(json) => {
                        if write.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Failed to encode signaling message: {}", e),
                }
            }
            let _ = write.close().await;
        });

        // Handle incoming messages
        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(signal) => {
                        if tx.send(signal).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => debug!("Ignoring unparseable relay message: {}", e),
                }
            }
        });

        Ok(Self { tx: outgoing_tx, rx })
    }

    pub async fn send(&mut self, msg: ClientMessage) -> Result<()> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| Error::ChannelClosed("signaling outbound"))
    }

    pub async fn receive(&mut self) -> Option<ServerMessage> {
        self.rx.recv().await
    }

    /// Hands both halves to a long-running consumer such as the session controller.
    pub fn into_parts(self) -> (mpsc::Sender<ClientMessage>, mpsc::Receiver<ServerMessage>) {
        (self.tx, self.rx)
    }
}
