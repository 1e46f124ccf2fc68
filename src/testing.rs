//! In-memory media engine and backend for exercising the signaling flow
//! without a network stack.
//!
//! `FakeEngine` produces deterministic descriptions (`<label>-offer-<n>`),
//! records every capability call and can be told to fail the next call of a
//! given name. Adding a track raises a negotiation-needed notification the way
//! a browser engine does. A call can also be held open until released, to
//! stand in for slow ICE gathering.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};

use crate::engine::{EngineEvent, EngineEvents, MediaEngine, PeerBackend};
use crate::error::{EngineError, MediaAcquisitionError};
use crate::signaling::SessionDescription;

struct FakeState {
    offers: u32,
    answers: u32,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    tracks: Vec<String>,
    calls: Vec<&'static str>,
    fail_next: Option<&'static str>,
    held: Option<(&'static str, Arc<Notify>)>,
    closed: bool,
    events_tx: Option<mpsc::UnboundedSender<EngineEvent<String>>>,
    events: Option<EngineEvents<String>>,
}

#[derive(Clone)]
pub struct FakeEngine {
    label: Arc<str>,
    state: Arc<Mutex<FakeState>>,
}

impl FakeEngine {
    pub fn new(label: &str) -> Self {
        let (tx, events) = EngineEvents::channel();
        Self {
            label: Arc::from(label),
            state: Arc::new(Mutex::new(FakeState {
                offers: 0,
                answers: 0,
                local: None,
                remote: None,
                tracks: Vec::new(),
                calls: Vec::new(),
                fail_next: None,
                held: None,
                closed: false,
                events_tx: Some(tx),
                events: Some(events),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enter(&self, op: &'static str) -> Result<MutexGuard<'_, FakeState>, EngineError> {
        let mut state = self.lock();
        if state.closed {
            return Err(EngineError::Closed);
        }
        state.calls.push(op);
        if state.fail_next == Some(op) {
            state.fail_next = None;
            return Err(EngineError::Other(format!("{} failed", op)));
        }
        Ok(state)
    }

    /// Waits for the gate when `op` is the held call.
    async fn pass(&self, op: &'static str) {
        let gate = {
            let mut state = self.lock();
            if matches!(&state.held, Some((held, _)) if *held == op) {
                state.held.take().map(|(_, gate)| gate)
            } else {
                None
            }
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }
    }

    fn emit(&self, event: EngineEvent<String>) {
        if let Some(tx) = &self.lock().events_tx {
            let _ = tx.send(event);
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Makes the next call to `op` fail.
    pub fn fail_next(&self, op: &'static str) {
        self.lock().fail_next = Some(op);
    }

    /// Blocks the next call to `op` until the returned gate is notified.
    pub fn hold_next(&self, op: &'static str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.lock().held = Some((op, gate.clone()));
        gate
    }

    pub fn fire_negotiation_needed(&self) {
        self.emit(EngineEvent::NegotiationNeeded);
    }

    pub fn fire_track(&self, track: &str) {
        self.emit(EngineEvent::Track(track.to_string()));
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.lock().local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.lock().remote.clone()
    }

    pub fn tracks(&self) -> Vec<String> {
        self.lock().tracks.clone()
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.lock().calls.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

#[async_trait]
impl MediaEngine for FakeEngine {
    type LocalTrack = String;
    type RemoteTrack = String;

    async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
        self.pass("create_offer").await;
        let mut state = self.enter("create_offer")?;
        state.offers += 1;
        Ok(SessionDescription::offer(format!("{}-offer-{}", self.label, state.offers)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        self.pass("create_answer").await;
        let mut state = self.enter("create_answer")?;
        if state.remote.is_none() {
            return Err(EngineError::Other("no remote offer".to_string()));
        }
        state.answers += 1;
        Ok(SessionDescription::answer(format!("{}-answer-{}", self.label, state.answers)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<SessionDescription, EngineError> {
        self.pass("set_local_description").await;
        let mut state = self.enter("set_local_description")?;
        state.local = Some(desc.clone());
        Ok(desc)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        self.pass("set_remote_description").await;
        let mut state = self.enter("set_remote_description")?;
        state.remote = Some(desc);
        Ok(())
    }

    async fn add_track(&self, track: String) -> Result<(), EngineError> {
        self.pass("add_track").await;
        self.enter("add_track")?.tracks.push(track);
        self.fire_negotiation_needed();
        Ok(())
    }

    fn subscribe(&self) -> Option<EngineEvents<String>> {
        self.lock().events.take()
    }

    async fn close(&self) -> Result<(), EngineError> {
        let mut state = self.lock();
        state.closed = true;
        state.events_tx = None;
        Ok(())
    }
}

struct BackendState {
    label: String,
    tracks: Vec<String>,
    media_error: Option<String>,
    held: Option<(&'static str, Arc<Notify>)>,
    acquisitions: usize,
    engines: Vec<FakeEngine>,
}

/// Backend handing out [`FakeEngine`]s and a fixed set of local tracks.
#[derive(Clone)]
pub struct FakeBackend {
    state: Arc<Mutex<BackendState>>,
}

impl FakeBackend {
    pub fn new(label: &str) -> Self {
        Self {
            state: Arc::new(Mutex::new(BackendState {
                label: label.to_string(),
                tracks: vec![format!("{}-audio", label), format!("{}-video", label)],
                media_error: None,
                held: None,
                acquisitions: 0,
                engines: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BackendState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes every following media acquisition fail with `reason`.
    pub fn deny_media(&self, reason: &str) {
        self.lock().media_error = Some(reason.to_string());
    }

    /// Holds `op` on the next engine this backend creates.
    pub fn hold_next(&self, op: &'static str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.lock().held = Some((op, gate.clone()));
        gate
    }

    pub fn acquisitions(&self) -> usize {
        self.lock().acquisitions
    }

    pub fn engines(&self) -> Vec<FakeEngine> {
        self.lock().engines.clone()
    }

    pub fn last_engine(&self) -> Option<FakeEngine> {
        self.lock().engines.last().cloned()
    }
}

#[async_trait]
impl PeerBackend for FakeBackend {
    type Engine = FakeEngine;

    async fn new_engine(&self) -> Result<FakeEngine, EngineError> {
        let mut state = self.lock();
        let engine = FakeEngine::new(&format!("{}{}", state.label, state.engines.len() + 1));
        if let Some(held) = state.held.take() {
            engine.lock().held = Some(held);
        }
        state.engines.push(engine.clone());
        Ok(engine)
    }

    async fn acquire_media(&self) -> Result<Vec<String>, MediaAcquisitionError> {
        let mut state = self.lock();
        state.acquisitions += 1;
        match &state.media_error {
            Some(reason) => Err(MediaAcquisitionError(reason.clone())),
            None => Ok(state.tracks.clone()),
        }
    }
}
