use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine as RtcMediaEngine, MIME_TYPE_OPUS};
use webrtc::api::{APIBuilder, API};
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::config::PeerConfig;
use crate::engine::{EngineEvent, EngineEvents, MediaEngine, PeerBackend};
use crate::error::{EngineError, MediaAcquisitionError};
use crate::signaling::{SdpKind, SessionDescription};

pub type LocalTrack = Arc<dyn TrackLocal + Send + Sync>;

/// `MediaEngine` over a webrtc-rs `RTCPeerConnection`.
pub struct WebRtcEngine {
    peer_connection: Arc<RTCPeerConnection>,
    events: Mutex<Option<EngineEvents<Arc<TrackRemote>>>>,
    gathering_timeout: Duration,
}

impl WebRtcEngine {
    pub async fn new(api: &API, config: &PeerConfig) -> Result<Self, EngineError> {
        let rtc_config = RTCConfiguration {
            ice_servers: config.rtc_ice_servers(),
            ..Default::default()
        };
        let peer_connection = Arc::new(api.new_peer_connection(rtc_config).await?);

        let (tx, events) = EngineEvents::channel();

        let negotiation_tx = tx.clone();
        peer_connection.on_negotiation_needed(Box::new(move || {
            let _ = negotiation_tx.send(EngineEvent::NegotiationNeeded);
            Box::pin(async {})
        }));

        peer_connection.on_track(Box::new(
            move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
                debug!("Remote track {} ({})", track.id(), track.kind());
                let _ = tx.send(EngineEvent::Track(track));
                Box::pin(async {})
            },
        ));

        peer_connection.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            info!("Peer connection state has changed: {}", s);
            Box::pin(async {})
        }));

        peer_connection.on_signaling_state_change(Box::new(move |s: RTCSignalingState| {
            debug!("Signaling state has changed: {}", s);
            Box::pin(async {})
        }));

        Ok(Self {
            peer_connection,
            events: Mutex::new(Some(events)),
            gathering_timeout: Duration::from_millis(config.ice_gathering_timeout_ms),
        })
    }

    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.peer_connection
    }
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, EngineError> {
    match desc.kind {
        SdpKind::Offer => Ok(RTCSessionDescription::offer(desc.sdp)?),
        SdpKind::Answer => Ok(RTCSessionDescription::answer(desc.sdp)?),
        SdpKind::Pranswer => Err(EngineError::UnsupportedDescription("pranswer".to_string())),
        SdpKind::Rollback => Err(EngineError::UnsupportedDescription("rollback".to_string())),
    }
}

fn from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription, EngineError> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp)),
        other => Err(EngineError::UnsupportedDescription(other.to_string())),
    }
}

#[async_trait]
impl MediaEngine for WebRtcEngine {
    type LocalTrack = LocalTrack;
    type RemoteTrack = Arc<TrackRemote>;

    async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
        from_rtc(self.peer_connection.create_offer(None).await?)
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        from_rtc(self.peer_connection.create_answer(None).await?)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<SessionDescription, EngineError> {
        let mut gather_complete = self.peer_connection.gathering_complete_promise().await;
        self.peer_connection.set_local_description(to_rtc(desc)?).await?;

        // Candidates travel inside the description, so wait for gathering.
        if tokio::time::timeout(self.gathering_timeout, gather_complete.recv())
            .await
            .is_err()
        {
            debug!("ICE gathering timed out, sending candidates gathered so far");
        }

        let local = self
            .peer_connection
            .local_description()
            .await
            .ok_or(EngineError::MissingLocalDescription)?;
        from_rtc(local)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        self.peer_connection.set_remote_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn add_track(&self, track: LocalTrack) -> Result<(), EngineError> {
        self.peer_connection.add_track(track).await?;
        Ok(())
    }

    fn subscribe(&self) -> Option<EngineEvents<Arc<TrackRemote>>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.peer_connection.close().await?;
        Ok(())
    }
}

/// Builds webrtc-rs engines sharing one API instance.
pub struct WebRtcBackend {
    api: API,
    config: PeerConfig,
}

impl WebRtcBackend {
    pub fn new(config: PeerConfig) -> Result<Self, EngineError> {
        let mut media_engine = RtcMediaEngine::default();
        media_engine.register_default_codecs()?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self { api, config })
    }
}

#[async_trait]
impl PeerBackend for WebRtcBackend {
    type Engine = WebRtcEngine;

    async fn new_engine(&self) -> Result<WebRtcEngine, EngineError> {
        WebRtcEngine::new(&self.api, &self.config).await
    }

    /// One Opus audio track; samples are written by whoever owns the capture device.
    async fn acquire_media(&self) -> Result<Vec<LocalTrack>, MediaAcquisitionError> {
        let audio_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                ..Default::default()
            },
            "audio".to_owned(),
            "room-signaling".to_owned(),
        ));
        Ok(vec![audio_track as LocalTrack])
    }
}
