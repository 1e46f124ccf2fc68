use std::fmt;
use std::time::Duration;

use log::{debug, warn};
use tokio::time::Instant;

use crate::engine::MediaEngine;
use crate::error::{EngineError, NegotiationError};
use crate::room::ConnectionId;
use crate::signaling::SessionDescription;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    OfferPending,
    AnswerPending,
    Stable,
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NegotiationState::Idle => write!(f, "idle"),
            NegotiationState::OfferPending => write!(f, "offer-pending"),
            NegotiationState::AnswerPending => write!(f, "answer-pending"),
            NegotiationState::Stable => write!(f, "stable"),
        }
    }
}

/// How long a local renegotiation waits for its answer before a new trigger
/// may replace it.
pub const DEFAULT_RENEGOTIATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Offer/answer state for the one remote member this peer talks to.
///
/// Operations take `&mut self`, so at most one is in flight per session. A
/// local renegotiation additionally spans the wait for the remote's answer;
/// triggers raised meanwhile are dropped until the answer lands or the
/// renegotiation times out.
pub struct NegotiationSession<E: MediaEngine> {
    remote: ConnectionId,
    engine: E,
    state: NegotiationState,
    renegotiating_since: Option<Instant>,
    renegotiation_timeout: Duration,
}

impl<E: MediaEngine> NegotiationSession<E> {
    pub fn new(remote: ConnectionId, engine: E) -> Self {
        Self {
            remote,
            engine,
            state: NegotiationState::Idle,
            renegotiating_since: None,
            renegotiation_timeout: DEFAULT_RENEGOTIATION_TIMEOUT,
        }
    }

    pub fn with_renegotiation_timeout(mut self, timeout: Duration) -> Self {
        self.renegotiation_timeout = timeout;
        self
    }

    pub fn remote(&self) -> ConnectionId {
        self.remote
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn is_renegotiating(&self) -> bool {
        self.renegotiating_since.is_some()
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    fn transition(&mut self, next: NegotiationState) {
        if self.state != next {
            debug!("Negotiation with {}: {} -> {}", self.remote, self.state, next);
            self.state = next;
        }
    }

    async fn make_offer(&self) -> Result<SessionDescription, EngineError> {
        let offer = self.engine.create_offer().await?;
        self.engine.set_local_description(offer).await
    }

    async fn make_answer(&self, offer: SessionDescription) -> Result<SessionDescription, EngineError> {
        self.engine.set_remote_description(offer).await?;
        let answer = self.engine.create_answer().await?;
        self.engine.set_local_description(answer).await
    }

    pub async fn start_call(&mut self) -> Result<SessionDescription, NegotiationError> {
        if self.state != NegotiationState::Idle {
            return Err(NegotiationError::InvalidState {
                operation: "start a call",
                state: self.state,
            });
        }
        let offer = self.make_offer().await?;
        self.transition(NegotiationState::OfferPending);
        Ok(offer)
    }

    /// Answers an incoming call. An offer arriving mid-negotiation restarts the
    /// flow: the newest offer wins over whatever was in progress.
    pub async fn accept_offer(&mut self, offer: SessionDescription) -> Result<SessionDescription, NegotiationError> {
        if self.state != NegotiationState::Idle {
            warn!("Call offer from {} while {}, restarting negotiation", self.remote, self.state);
        }
        self.renegotiating_since = None;
        self.transition(NegotiationState::AnswerPending);

        match self.make_answer(offer).await {
            Ok(answer) => {
                self.transition(NegotiationState::Stable);
                Ok(answer)
            }
            Err(e) => {
                self.transition(NegotiationState::Idle);
                Err(e.into())
            }
        }
    }

    /// Completes an outgoing call. Answers outside `offer-pending` are stale.
    pub async fn accept_answer(&mut self, answer: SessionDescription) -> Result<(), NegotiationError> {
        if self.state != NegotiationState::OfferPending || self.is_renegotiating() {
            return Err(NegotiationError::Stale);
        }
        match self.engine.set_remote_description(answer).await {
            Ok(()) => {
                self.transition(NegotiationState::Stable);
                Ok(())
            }
            Err(e) => {
                self.transition(NegotiationState::Idle);
                Err(e.into())
            }
        }
    }

    /// Produces a renegotiation offer, or `None` when one is already being
    /// serviced or the session has not stabilized yet. A renegotiation left
    /// unanswered past the timeout is abandoned and replaced.
    pub async fn on_renegotiation_needed(&mut self) -> Result<Option<SessionDescription>, NegotiationError> {
        if let Some(since) = self.renegotiating_since {
            if since.elapsed() < self.renegotiation_timeout {
                debug!("Renegotiation with {} already in flight, trigger dropped", self.remote);
                return Ok(None);
            }
            warn!(
                "Renegotiation with {} unanswered after {:?}, starting over",
                self.remote, self.renegotiation_timeout
            );
            self.renegotiating_since = None;
            self.transition(NegotiationState::Stable);
        }
        if self.state != NegotiationState::Stable {
            debug!("Renegotiation with {} ignored while {}", self.remote, self.state);
            return Ok(None);
        }

        self.renegotiating_since = Some(Instant::now());
        match self.make_offer().await {
            Ok(offer) => {
                self.transition(NegotiationState::OfferPending);
                Ok(Some(offer))
            }
            Err(e) => {
                self.renegotiating_since = None;
                Err(e.into())
            }
        }
    }

    pub async fn accept_renegotiation_offer(
        &mut self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, NegotiationError> {
        let restore = if self.renegotiating_since.take().is_some() {
            debug!("Remote renegotiation from {} supersedes local one", self.remote);
            NegotiationState::Stable
        } else {
            self.state
        };
        self.transition(NegotiationState::AnswerPending);

        match self.make_answer(offer).await {
            Ok(answer) => {
                self.transition(NegotiationState::Stable);
                Ok(answer)
            }
            Err(e) => {
                self.transition(restore);
                Err(e.into())
            }
        }
    }

    pub async fn accept_renegotiation_answer(&mut self, answer: SessionDescription) -> Result<(), NegotiationError> {
        if self.state != NegotiationState::OfferPending || !self.is_renegotiating() {
            return Err(NegotiationError::Stale);
        }
        let result = self.engine.set_remote_description(answer).await;
        self.renegotiating_since = None;
        self.transition(NegotiationState::Stable);
        result.map_err(Into::into)
    }

    /// Closes the underlying engine, discarding whatever was in flight.
    pub async fn close(self) -> Result<(), EngineError> {
        debug!("Closing negotiation with {} ({})", self.remote, self.state);
        self.engine.close().await
    }
}
