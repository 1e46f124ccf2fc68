//! The media-engine capability a peer negotiates through.
//!
//! The engine owns the actual peer connection. Callers only see description
//! exchange, track attachment and two notifications delivered through an
//! [`EngineEvents`] subscription.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{EngineError, MediaAcquisitionError};
use crate::signaling::SessionDescription;

#[derive(Debug)]
pub enum EngineEvent<T> {
    /// Local tracks changed and the session must be renegotiated.
    NegotiationNeeded,
    /// The remote side started sending a track.
    Track(T),
}

/// Subscription to one engine's notifications. Dropping it unsubscribes.
#[derive(Debug)]
pub struct EngineEvents<T> {
    rx: mpsc::UnboundedReceiver<EngineEvent<T>>,
}

impl<T> EngineEvents<T> {
    pub fn channel() -> (mpsc::UnboundedSender<EngineEvent<T>>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }

    pub async fn recv(&mut self) -> Option<EngineEvent<T>> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<EngineEvent<T>> {
        self.rx.try_recv().ok()
    }
}

#[async_trait]
pub trait MediaEngine: Send + Sync + 'static {
    type LocalTrack: Clone + Send + Sync + 'static;
    type RemoteTrack: Send + Sync + 'static;

    async fn create_offer(&self) -> Result<SessionDescription, EngineError>;

    /// Answers the remote offer already applied with `set_remote_description`.
    async fn create_answer(&self) -> Result<SessionDescription, EngineError>;

    /// Applies `desc` and returns the description to transmit, which may carry
    /// gathered candidates the input lacked.
    async fn set_local_description(&self, desc: SessionDescription) -> Result<SessionDescription, EngineError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError>;

    async fn add_track(&self, track: Self::LocalTrack) -> Result<(), EngineError>;

    /// Takes the notification stream. Only the first call returns a subscription.
    fn subscribe(&self) -> Option<EngineEvents<Self::RemoteTrack>>;

    async fn close(&self) -> Result<(), EngineError>;
}

/// Builds engines and acquires local media for a peer.
#[async_trait]
pub trait PeerBackend: Send + Sync + 'static {
    type Engine: MediaEngine;

    async fn new_engine(&self) -> Result<Self::Engine, EngineError>;

    async fn acquire_media(&self) -> Result<Vec<<Self::Engine as MediaEngine>::LocalTrack>, MediaAcquisitionError>;
}

pub type LocalTrackOf<B> = <<B as PeerBackend>::Engine as MediaEngine>::LocalTrack;
pub type RemoteTrackOf<B> = <<B as PeerBackend>::Engine as MediaEngine>::RemoteTrack;
