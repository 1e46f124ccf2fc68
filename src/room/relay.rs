use std::collections::HashMap;

use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::RelayError;
use crate::signaling::{ClientMessage, ServerMessage};

use super::state::{Delivery, RoomTable};
use super::ConnectionId;

/// Outbound queue of a single transport connection.
pub type ConnectionSender = mpsc::UnboundedSender<ServerMessage>;

/// Transport-level input to the relay.
#[derive(Debug)]
pub enum RelayEvent {
    Connected {
        id: ConnectionId,
        outbound: ConnectionSender,
    },
    Message {
        id: ConnectionId,
        message: ClientMessage,
    },
    Disconnected {
        id: ConnectionId,
    },
}

/// Owns the room tables and processes one event to completion before the next.
#[derive(Debug, Default)]
pub struct Relay {
    rooms: RoomTable,
    connections: HashMap<ConnectionId, ConnectionSender>,
}

impl Relay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rooms(&self) -> &RoomTable {
        &self.rooms
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Starts the relay on its own task and returns the handle that feeds it.
    pub fn spawn(self) -> (RelayHandle, JoinHandle<Relay>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(self.run(rx));
        (RelayHandle { tx }, task)
    }

    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<RelayEvent>) -> Relay {
        while let Some(event) = events.recv().await {
            self.handle(event);
        }
        debug!("Relay event channel closed");
        self
    }

    pub fn handle(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::Connected { id, outbound } => {
                info!("Connection {} opened", id);
                self.connections.insert(id, outbound);
            }
            RelayEvent::Message { id, message } => self.handle_message(id, message),
            RelayEvent::Disconnected { id } => {
                let deliveries = self.rooms.leave(id);
                self.dispatch(deliveries);
                self.connections.remove(&id);
                info!("Connection {} closed", id);
            }
        }
    }

    fn handle_message(&mut self, id: ConnectionId, message: ClientMessage) {
        match message {
            ClientMessage::JoinRoom { room_id, display_token } => {
                match self.rooms.join(id, &room_id, display_token) {
                    Ok(deliveries) => self.dispatch(deliveries),
                    Err(e @ RelayError::RoomFull { .. }) => {
                        warn!("Connection {} rejected: {}", id, e);
                        self.deliver(Delivery {
                            to: id,
                            message: ServerMessage::JoinRejected {
                                room_id,
                                reason: "room-full".to_string(),
                            },
                        });
                    }
                    Err(e) => warn!("Connection {} join failed: {}", id, e),
                }
            }
            ClientMessage::LeaveRoom => {
                let deliveries = self.rooms.leave(id);
                self.dispatch(deliveries);
            }
            other => {
                let Some((to, signal)) = other.into_signal() else {
                    return;
                };
                let kind = signal.kind;
                match self.rooms.relay(id, to, signal) {
                    Ok(delivery) => self.deliver(delivery),
                    Err(e) => warn!("Dropping {}: {}", kind.as_str(), e),
                }
            }
        }
    }

    fn dispatch(&self, deliveries: Vec<Delivery>) {
        for delivery in deliveries {
            self.deliver(delivery);
        }
    }

    fn deliver(&self, delivery: Delivery) {
        match self.connections.get(&delivery.to) {
            Some(outbound) => {
                if outbound.send(delivery.message).is_err() {
                    debug!("Connection {} outbound closed, message dropped", delivery.to);
                }
            }
            None => debug!("Connection {} not registered, message dropped", delivery.to),
        }
    }
}

/// Cloneable entry point into a running [`Relay`].
#[derive(Debug, Clone)]
pub struct RelayHandle {
    tx: mpsc::UnboundedSender<RelayEvent>,
}

impl RelayHandle {
    pub fn connect(&self, id: ConnectionId, outbound: ConnectionSender) -> bool {
        self.tx.send(RelayEvent::Connected { id, outbound }).is_ok()
    }

    pub fn message(&self, id: ConnectionId, message: ClientMessage) -> bool {
        self.tx.send(RelayEvent::Message { id, message }).is_ok()
    }

    pub fn disconnect(&self, id: ConnectionId) -> bool {
        self.tx.send(RelayEvent::Disconnected { id }).is_ok()
    }
}
