use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;
use webrtc::Error as WebRTCError;

use crate::room::ConnectionId;

/// Rejections produced by the relay's membership table.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error("room '{room_id}' is full")]
    RoomFull { room_id: String },
    #[error("connection {to} is not in the same room as {from}")]
    UnknownPeer { from: ConnectionId, to: ConnectionId },
}

/// Failure of a media-engine capability call.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("WebRTC error: {0}")]
    WebRTC(#[from] WebRTCError),
    #[error("no local description after negotiation")]
    MissingLocalDescription,
    #[error("unsupported session description type '{0}'")]
    UnsupportedDescription(String),
    #[error("media engine closed")]
    Closed,
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, Error)]
#[error("media acquisition failed: {0}")]
pub struct MediaAcquisitionError(pub String);

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: crate::negotiation::NegotiationState,
    },
    #[error("stale negotiation message ignored")]
    Stale,
    #[error(transparent)]
    Engine(#[from] EngineError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error(transparent)]
    Media(#[from] MediaAcquisitionError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("no remote member to call")]
    NoRemoteMember,
    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
