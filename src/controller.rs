//! Peer-side driver of the negotiation protocol.
//!
//! The controller owns at most one [`NegotiationSession`] (rooms hold two
//! members) together with its engine subscription. Everything runs on one
//! task: relay messages, local commands and engine notifications are handled
//! one at a time, and tearing a session down drops its subscription so
//! nothing queued for it is observed afterwards. While a step waits on the
//! engine, input that ends the session (the remote leaving, `Leave`,
//! `Shutdown`) cancels the step; other input is queued behind it.

use std::collections::VecDeque;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::mpsc;

use crate::connection::CallMonitor;
use crate::engine::{EngineEvent, EngineEvents, LocalTrackOf, MediaEngine, PeerBackend, RemoteTrackOf};
use crate::error::{Error, NegotiationError, Result};
use crate::negotiation::{NegotiationSession, NegotiationState, DEFAULT_RENEGOTIATION_TIMEOUT};
use crate::room::ConnectionId;
use crate::signaling::{ClientMessage, ServerMessage, SessionDescription, Signal, SignalKind};

/// Local user actions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Join {
        room_id: String,
        display_token: Option<String>,
    },
    Call,
    SendMedia,
    Leave,
    Shutdown,
}

/// Notifications for whatever renders the call.
#[derive(Debug)]
pub enum ControllerEvent<T> {
    Joined { room_id: String },
    RoomFull { room_id: String },
    MemberJoined { connection_id: ConnectionId, display_token: Option<String> },
    MemberLeft { connection_id: ConnectionId },
    CallEstablished { remote: ConnectionId },
    RemoteTrack { from: ConnectionId, track: T },
    RemoteTrackCleared { from: ConnectionId },
    MediaAcquisitionFailed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RemoteMember {
    id: ConnectionId,
    display_token: Option<String>,
}

struct PeerSession<E: MediaEngine> {
    negotiation: NegotiationSession<E>,
    events: Option<EngineEvents<E::RemoteTrack>>,
    media_attached: bool,
    showing_remote_track: bool,
}

enum Input<T> {
    Server(ServerMessage),
    Command(Command),
    Engine(EngineEvent<T>),
    Closed,
}

impl<T> Input<T> {
    /// Whether this input discards a session with `remote` immediately.
    fn ends_session(&self, remote: Option<ConnectionId>) -> bool {
        match self {
            Input::Closed | Input::Command(Command::Leave | Command::Shutdown) => true,
            // A room has one other member, so any departure can be ours.
            Input::Server(ServerMessage::MemberLeft { connection_id }) => remote.map_or(true, |r| r == *connection_id),
            _ => false,
        }
    }
}

pub struct SessionController<B: PeerBackend> {
    backend: B,
    outbound: mpsc::Sender<ClientMessage>,
    events: mpsc::UnboundedSender<ControllerEvent<RemoteTrackOf<B>>>,
    monitor: CallMonitor,
    remote: Option<RemoteMember>,
    session: Option<PeerSession<B::Engine>>,
    local_media: Option<Vec<LocalTrackOf<B>>>,
    renegotiation_timeout: Duration,
}

impl<B: PeerBackend> SessionController<B> {
    pub fn new(
        backend: B,
        outbound: mpsc::Sender<ClientMessage>,
    ) -> (Self, mpsc::UnboundedReceiver<ControllerEvent<RemoteTrackOf<B>>>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let controller = Self {
            backend,
            outbound,
            events,
            monitor: CallMonitor::new(),
            remote: None,
            session: None,
            local_media: None,
            renegotiation_timeout: DEFAULT_RENEGOTIATION_TIMEOUT,
        };
        (controller, events_rx)
    }

    /// Applies to sessions created afterwards.
    pub fn set_renegotiation_timeout(&mut self, timeout: Duration) {
        self.renegotiation_timeout = timeout;
    }

    pub fn monitor(&self) -> &CallMonitor {
        &self.monitor
    }

    pub fn remote_member(&self) -> Option<ConnectionId> {
        self.remote.as_ref().map(|r| r.id)
    }

    pub fn negotiation_state(&self) -> Option<NegotiationState> {
        self.session.as_ref().map(|s| s.negotiation.state())
    }

    pub fn is_renegotiating(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.negotiation.is_renegotiating())
    }

    pub fn session_engine(&self) -> Option<&B::Engine> {
        self.session.as_ref().map(|s| s.negotiation.engine())
    }

    /// Runs until the relay connection closes or `Command::Shutdown` arrives.
    pub async fn run(mut self, mut incoming: mpsc::Receiver<ServerMessage>, mut commands: mpsc::Receiver<Command>) {
        let mut backlog = VecDeque::new();
        loop {
            let input = match backlog.pop_front() {
                Some(input) => input,
                None => tokio::select! {
                    msg = incoming.recv() => msg.map_or(Input::Closed, Input::Server),
                    cmd = commands.recv() => cmd.map_or(Input::Closed, Input::Command),
                    Some(event) = next_engine_event(&mut self.session) => Input::Engine(event),
                },
            };
            match input {
                Input::Closed => {
                    info!("Relay connection or command channel closed");
                    break;
                }
                Input::Command(Command::Shutdown) => break,
                _ => {}
            }

            let remote = self.remote_member();
            let result = {
                let step = self.dispatch(input);
                tokio::pin!(step);
                loop {
                    let arrived = tokio::select! {
                        biased;
                        result = &mut step => break Some(result),
                        msg = incoming.recv() => msg.map_or(Input::Closed, Input::Server),
                        cmd = commands.recv() => cmd.map_or(Input::Closed, Input::Command),
                    };
                    if arrived.ends_session(remote) {
                        backlog.push_front(arrived);
                        break None;
                    }
                    backlog.push_back(arrived);
                }
            };

            match result {
                Some(Err(e)) => {
                    warn!("Signaling step failed: {}", e);
                    self.monitor.set_error(e.to_string());
                }
                Some(Ok(())) => {}
                None => debug!("In-flight step discarded"),
            }
        }
        self.teardown_session().await;
    }

    async fn dispatch(&mut self, input: Input<RemoteTrackOf<B>>) -> Result<()> {
        match input {
            Input::Server(msg) => self.handle_server_message(msg).await,
            Input::Command(cmd) => self.handle_command(cmd).await,
            Input::Engine(event) => self.handle_engine_event(event).await,
            Input::Closed => Ok(()),
        }
    }

    pub async fn handle_command(&mut self, cmd: Command) -> Result<()> {
        match cmd {
            Command::Join { room_id, display_token } => {
                self.send(ClientMessage::JoinRoom { room_id, display_token }).await
            }
            Command::Call => self.call().await,
            Command::SendMedia => self.attach_media().await,
            Command::Leave => {
                self.send(ClientMessage::LeaveRoom).await?;
                self.end_call().await;
                self.monitor.set_room(None);
                Ok(())
            }
            Command::Shutdown => {
                self.teardown_session().await;
                Ok(())
            }
        }
    }

    pub async fn handle_server_message(&mut self, msg: ServerMessage) -> Result<()> {
        match msg {
            ServerMessage::Joined { room_id } => {
                // The relay has already removed us from any previous room.
                if let Some(previous) = self.monitor.current().room_id.filter(|r| *r != room_id) {
                    info!("Left room '{}'", previous);
                    self.end_call().await;
                }
                info!("Joined room '{}'", room_id);
                self.monitor.set_room(Some(room_id.clone()));
                self.emit(ControllerEvent::Joined { room_id });
                Ok(())
            }
            ServerMessage::JoinRejected { room_id, reason } => {
                warn!("Join of room '{}' rejected: {}", room_id, reason);
                self.monitor.set_error(format!("room '{}' rejected join: {}", room_id, reason));
                self.emit(ControllerEvent::RoomFull { room_id });
                Ok(())
            }
            ServerMessage::MemberJoined { connection_id, display_token } => {
                info!("Member {} joined", connection_id);
                self.set_remote(connection_id, display_token.clone());
                self.emit(ControllerEvent::MemberJoined { connection_id, display_token });
                Ok(())
            }
            ServerMessage::MemberLeft { connection_id } => {
                if self.remote_member() != Some(connection_id) {
                    debug!("Ignoring departure of unknown member {}", connection_id);
                    return Ok(());
                }
                info!("Member {} left", connection_id);
                self.end_call().await;
                self.emit(ControllerEvent::MemberLeft { connection_id });
                Ok(())
            }
            ServerMessage::CallOffer { from, offer } => self.on_call_offer(from, SessionDescription::from_value(offer)?).await,
            ServerMessage::CallAnswer { from, answer } => {
                self.on_call_answer(from, SessionDescription::from_value(answer)?).await
            }
            ServerMessage::RenegotiationOffer { from, offer } => {
                self.on_renegotiation_offer(from, SessionDescription::from_value(offer)?).await
            }
            ServerMessage::RenegotiationAnswer { from, answer } => {
                self.on_renegotiation_answer(from, SessionDescription::from_value(answer)?).await
            }
        }
    }

    pub async fn handle_engine_event(&mut self, event: EngineEvent<RemoteTrackOf<B>>) -> Result<()> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        let remote = session.negotiation.remote();

        match event {
            EngineEvent::NegotiationNeeded => {
                let offer = session.negotiation.on_renegotiation_needed().await;
                self.sync_status();
                if let Some(offer) = offer? {
                    self.send_signal(remote, SignalKind::RenegotiationOffer, &offer).await?;
                }
            }
            EngineEvent::Track(track) => {
                session.showing_remote_track = true;
                self.emit(ControllerEvent::RemoteTrack { from: remote, track });
            }
        }
        Ok(())
    }

    /// Handles every engine notification already queued, returning how many ran.
    pub async fn drain_engine_events(&mut self) -> Result<usize> {
        let mut handled = 0;
        loop {
            let event = self
                .session
                .as_mut()
                .and_then(|s| s.events.as_mut())
                .and_then(EngineEvents::try_recv);
            let Some(event) = event else {
                return Ok(handled);
            };
            self.handle_engine_event(event).await?;
            handled += 1;
        }
    }

    async fn call(&mut self) -> Result<()> {
        let remote = self.remote_member().ok_or(Error::NoRemoteMember)?;
        if !self.ensure_local_media().await {
            return Ok(());
        }
        self.ensure_session(remote).await?;

        let offer = match self.session.as_mut() {
            Some(session) => session.negotiation.start_call().await,
            None => return Ok(()),
        };
        self.sync_status();
        let offer = offer?;
        self.send_signal(remote, SignalKind::CallOffer, &offer).await
    }

    async fn on_call_offer(&mut self, from: ConnectionId, offer: SessionDescription) -> Result<()> {
        if self.remote_member() != Some(from) {
            self.set_remote(from, None);
        }
        if !self.ensure_local_media().await {
            return Ok(());
        }
        self.ensure_session(from).await?;

        let answer = match self.session.as_mut() {
            Some(session) => session.negotiation.accept_offer(offer).await,
            None => return Ok(()),
        };
        self.sync_status();
        let answer = answer?;
        self.send_signal(from, SignalKind::CallAnswer, &answer).await?;
        self.mark_established(from);
        Ok(())
    }

    async fn on_call_answer(&mut self, from: ConnectionId, answer: SessionDescription) -> Result<()> {
        let Some(session) = self.session_for(from) else {
            debug!("Dropping call answer from {} without a session", from);
            return Ok(());
        };
        let result = session.negotiation.accept_answer(answer).await;
        self.sync_status();
        match result {
            Ok(()) => {}
            Err(NegotiationError::Stale) => {
                debug!("Dropping stale call answer from {}", from);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        self.mark_established(from);
        self.attach_media().await
    }

    async fn on_renegotiation_offer(&mut self, from: ConnectionId, offer: SessionDescription) -> Result<()> {
        let Some(session) = self.session_for(from) else {
            debug!("Dropping renegotiation offer from {} without a session", from);
            return Ok(());
        };
        let answer = session.negotiation.accept_renegotiation_offer(offer).await;
        self.sync_status();
        let answer = answer?;
        self.send_signal(from, SignalKind::RenegotiationAnswer, &answer).await
    }

    async fn on_renegotiation_answer(&mut self, from: ConnectionId, answer: SessionDescription) -> Result<()> {
        let Some(session) = self.session_for(from) else {
            debug!("Dropping renegotiation answer from {} without a session", from);
            return Ok(());
        };
        let result = session.negotiation.accept_renegotiation_answer(answer).await;
        self.sync_status();
        match result {
            Err(NegotiationError::Stale) => {
                debug!("Dropping stale renegotiation answer from {}", from);
                Ok(())
            }
            other => other.map_err(Into::into),
        }
    }

    /// Sends captured tracks into the engine once per session.
    async fn attach_media(&mut self) -> Result<()> {
        let Some(tracks) = self.local_media.clone() else {
            debug!("No local media to send");
            return Ok(());
        };
        let Some(session) = self.session.as_mut() else {
            debug!("No session to send media into");
            return Ok(());
        };
        if session.media_attached {
            return Ok(());
        }
        session.media_attached = true;

        for track in tracks {
            session.negotiation.engine().add_track(track).await?;
        }
        Ok(())
    }

    /// Holds local media, acquiring it on first use. Failure is reported to the
    /// user and aborts the current call step.
    async fn ensure_local_media(&mut self) -> bool {
        if self.local_media.is_some() {
            return true;
        }
        match self.backend.acquire_media().await {
            Ok(tracks) => {
                self.local_media = Some(tracks);
                true
            }
            Err(e) => {
                warn!("{}", e);
                self.monitor.set_error(e.to_string());
                self.emit(ControllerEvent::MediaAcquisitionFailed { reason: e.0 });
                false
            }
        }
    }

    async fn ensure_session(&mut self, remote: ConnectionId) -> Result<()> {
        if self.session.as_ref().is_some_and(|s| s.negotiation.remote() != remote) {
            self.teardown_session().await;
        }
        if self.session.is_none() {
            let engine = self.backend.new_engine().await?;
            let events = engine.subscribe();
            self.session = Some(PeerSession {
                negotiation: NegotiationSession::new(remote, engine)
                    .with_renegotiation_timeout(self.renegotiation_timeout),
                events,
                media_attached: false,
                showing_remote_track: false,
            });
            debug!("Negotiation session with {} created", remote);
            self.sync_status();
        }
        Ok(())
    }

    async fn teardown_session(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        let remote = session.negotiation.remote();
        if session.showing_remote_track {
            self.emit(ControllerEvent::RemoteTrackCleared { from: remote });
        }
        drop(session.events);
        if let Err(e) = session.negotiation.close().await {
            debug!("Closing engine for {} failed: {}", remote, e);
        }
        self.monitor.set_connected(false);
        self.sync_status();
    }

    /// Forgets the remote member along with its session.
    async fn end_call(&mut self) {
        self.teardown_session().await;
        self.remote = None;
        self.monitor.clear_session();
    }

    fn session_for(&mut self, from: ConnectionId) -> Option<&mut PeerSession<B::Engine>> {
        self.session.as_mut().filter(|s| s.negotiation.remote() == from)
    }

    fn set_remote(&mut self, id: ConnectionId, display_token: Option<String>) {
        self.monitor.set_remote(Some(id), display_token.clone());
        self.remote = Some(RemoteMember { id, display_token });
    }

    fn mark_established(&mut self, remote: ConnectionId) {
        if !self.monitor.current().connected {
            info!("Call with {} established", remote);
            self.monitor.set_connected(true);
            self.emit(ControllerEvent::CallEstablished { remote });
        }
    }

    fn sync_status(&self) {
        self.monitor.update_negotiation(self.negotiation_state());
    }

    async fn send_signal(&self, to: ConnectionId, kind: SignalKind, desc: &SessionDescription) -> Result<()> {
        debug!("Sending {} to {}", kind.as_str(), to);
        self.send(Signal::new(kind, desc.to_value()?).addressed_to(to)).await
    }

    async fn send(&self, msg: ClientMessage) -> Result<()> {
        self.outbound
            .send(msg)
            .await
            .map_err(|_| Error::ChannelClosed("relay outbound"))
    }

    fn emit(&self, event: ControllerEvent<RemoteTrackOf<B>>) {
        let _ = self.events.send(event);
    }
}

async fn next_engine_event<E: MediaEngine>(
    session: &mut Option<PeerSession<E>>,
) -> Option<EngineEvent<E::RemoteTrack>> {
    match session.as_mut().and_then(|s| s.events.as_mut()) {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}
