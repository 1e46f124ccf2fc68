use std::sync::Arc;

use tokio::sync::watch;

use crate::negotiation::NegotiationState;
use crate::room::ConnectionId;

/// What a peer UI renders: the room, the other member and whether the call is up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallStatus {
    pub room_id: Option<String>,
    pub remote_member: Option<ConnectionId>,
    pub remote_display: Option<String>,
    /// Set once the initial offer/answer completes; renegotiation never touches it.
    pub connected: bool,
    pub negotiation: Option<NegotiationState>,
    pub last_error: Option<String>,
}

#[derive(Clone)]
pub struct CallMonitor {
    status: Arc<watch::Sender<CallStatus>>,
    receiver: watch::Receiver<CallStatus>,
}

impl Default for CallMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl CallMonitor {
    pub fn new() -> Self {
        let (status, receiver) = watch::channel(CallStatus::default());
        Self {
            status: Arc::new(status),
            receiver,
        }
    }

    pub fn current(&self) -> CallStatus {
        self.receiver.borrow().clone()
    }

    pub fn set_room(&self, room_id: Option<String>) {
        self.status.send_modify(|status| {
            status.room_id = room_id;
        });
    }

    pub fn set_remote(&self, remote: Option<ConnectionId>, display: Option<String>) {
        self.status.send_modify(|status| {
            status.remote_member = remote;
            status.remote_display = display;
        });
    }

    pub fn set_connected(&self, connected: bool) {
        self.status.send_modify(|status| {
            status.connected = connected;
        });
    }

    pub fn update_negotiation(&self, state: Option<NegotiationState>) {
        self.status.send_if_modified(|status| {
            let changed = status.negotiation != state;
            status.negotiation = state;
            changed
        });
    }

    pub fn set_error(&self, error: String) {
        self.status.send_modify(|status| {
            status.last_error = Some(error);
        });
    }

    /// Resets everything tied to the remote member.
    pub fn clear_session(&self) {
        self.status.send_modify(|status| {
            status.remote_member = None;
            status.remote_display = None;
            status.connected = false;
            status.negotiation = None;
        });
    }

    pub fn subscribe(&self) -> watch::Receiver<CallStatus> {
        self.receiver.clone()
    }
}
