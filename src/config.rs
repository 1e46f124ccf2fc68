//! Configuration for the relay and peer binaries.
//!
//! Both are plain TOML files. Missing files and missing keys fall back to
//! defaults, so every binary runs without any configuration at all.

use std::fs;
use std::net::SocketAddr;
use std::path::Path;

use log::info;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_server::RTCIceServer;

use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    /// Largest accepted WebSocket message in bytes
    pub max_message_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            max_message_size: 64 << 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

impl IceServerConfig {
    pub fn stun(url: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: None,
            credential: None,
        }
    }
}

impl From<&IceServerConfig> for RTCIceServer {
    fn from(server: &IceServerConfig) -> Self {
        RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    pub server_url: String,
    pub display_token: Option<String>,
    pub ice_servers: Vec<IceServerConfig>,
    /// Upper bound on waiting for ICE gathering before a description is sent
    pub ice_gathering_timeout_ms: u64,
    /// How long an unanswered renegotiation blocks new ones
    pub renegotiation_timeout_ms: u64,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:8000".to_string(),
            display_token: None,
            ice_servers: vec![
                IceServerConfig::stun("stun:stun.l.google.com:19302"),
                IceServerConfig::stun("stun:global.stun.twilio.com:3478"),
            ],
            ice_gathering_timeout_ms: 2000,
            renegotiation_timeout_ms: 10_000,
        }
    }
}

fn load_toml<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let contents = fs::read_to_string(path)?;
    let config = toml::from_str(&contents)?;
    info!("Loaded configuration from {:?}", path);
    Ok(config)
}

impl RelayConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        load_toml(path.as_ref())
    }

    /// Defaults when no path is given; a given path must load.
    pub fn load_or_default<P: AsRef<Path>>(path: Option<P>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load_from_file(path),
            None => Ok(Self::default()),
        }
    }
}

impl PeerConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        load_toml(path.as_ref())
    }

    pub fn load_or_default<P: AsRef<Path>>(path: Option<P>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load_from_file(path),
            None => Ok(Self::default()),
        }
    }

    pub fn rtc_ice_servers(&self) -> Vec<RTCIceServer> {
        self.ice_servers.iter().map(RTCIceServer::from).collect()
    }
}
