#![allow(dead_code)]

use room_signaling::controller::{Command, ControllerEvent, SessionController};
use room_signaling::room::{ConnectionId, Relay, RelayEvent};
use room_signaling::signaling::{ClientMessage, ServerMessage};
use room_signaling::testing::{FakeBackend, FakeEngine};
use tokio::sync::mpsc;

pub struct TestPeer {
    pub id: ConnectionId,
    pub backend: FakeBackend,
    pub controller: SessionController<FakeBackend>,
    pub sent: Vec<ClientMessage>,
    pub received: Vec<ServerMessage>,
    pub errors: Vec<String>,
    events: mpsc::UnboundedReceiver<ControllerEvent<String>>,
    outbound: mpsc::Receiver<ClientMessage>,
    inbound: mpsc::UnboundedReceiver<ServerMessage>,
}

impl TestPeer {
    pub fn engine(&self) -> FakeEngine {
        self.backend.last_engine().expect("peer has no engine yet")
    }

    pub fn take_events(&mut self) -> Vec<ControllerEvent<String>> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    pub fn sent_of(&self, kind: &str) -> Vec<&ClientMessage> {
        self.sent.iter().filter(|m| message_type(m) == kind).collect()
    }

    pub fn received_of(&self, kind: &str) -> Vec<&ServerMessage> {
        self.received.iter().filter(|m| message_type(m) == kind).collect()
    }
}

pub fn message_type<T: serde::Serialize>(msg: &T) -> String {
    serde_json::to_value(msg).unwrap()["type"].as_str().unwrap().to_string()
}

/// Peers wired to one in-process relay; messages move only when pumped.
pub struct Harness {
    pub relay: Relay,
    pub peers: Vec<TestPeer>,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            relay: Relay::new(),
            peers: Vec::new(),
        }
    }

    /// Connects a peer; its connection id is its index plus one.
    pub fn add_peer(&mut self, label: &str) -> usize {
        let index = self.peers.len();
        let id = index as ConnectionId + 1;

        let backend = FakeBackend::new(label);
        let (outbound_tx, outbound) = mpsc::channel(64);
        let (controller, events) = SessionController::new(backend.clone(), outbound_tx);
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        self.relay.handle(RelayEvent::Connected { id, outbound: inbound_tx });

        self.peers.push(TestPeer {
            id,
            backend,
            controller,
            sent: Vec::new(),
            received: Vec::new(),
            errors: Vec::new(),
            events,
            outbound,
            inbound,
        });
        index
    }

    pub fn peer(&mut self, index: usize) -> &mut TestPeer {
        &mut self.peers[index]
    }

    pub async fn command(&mut self, index: usize, cmd: Command) -> room_signaling::Result<()> {
        self.peers[index].controller.handle_command(cmd).await
    }

    pub async fn join(&mut self, index: usize, room: &str) {
        let display = format!("{}@example.com", index);
        self.command(
            index,
            Command::Join {
                room_id: room.to_string(),
                display_token: Some(display),
            },
        )
        .await
        .unwrap();
        self.settle().await;
    }

    pub fn disconnect(&mut self, index: usize) {
        let id = self.peers[index].id;
        self.relay.handle(RelayEvent::Disconnected { id });
    }

    /// Moves everything `index` has queued for the relay into the relay.
    pub fn flush(&mut self, index: usize) -> usize {
        let peer = &mut self.peers[index];
        let mut moved = 0;
        while let Ok(message) = peer.outbound.try_recv() {
            peer.sent.push(message.clone());
            self.relay.handle(RelayEvent::Message { id: peer.id, message });
            moved += 1;
        }
        moved
    }

    /// Hands everything the relay queued for `index` to its controller.
    pub async fn receive(&mut self, index: usize) -> usize {
        let peer = &mut self.peers[index];
        let mut moved = 0;
        while let Ok(message) = peer.inbound.try_recv() {
            peer.received.push(message.clone());
            if let Err(e) = peer.controller.handle_server_message(message).await {
                peer.errors.push(e.to_string());
            }
            moved += 1;
        }
        moved
    }

    pub async fn pump_engine(&mut self, index: usize) -> usize {
        let peer = &mut self.peers[index];
        match peer.controller.drain_engine_events().await {
            Ok(handled) => handled,
            Err(e) => {
                peer.errors.push(e.to_string());
                1
            }
        }
    }

    /// Pumps every peer until no message or engine event is left anywhere.
    pub async fn settle(&mut self) {
        loop {
            let mut moved = 0;
            for index in 0..self.peers.len() {
                moved += self.flush(index);
                moved += self.receive(index).await;
                moved += self.pump_engine(index).await;
            }
            if moved == 0 {
                break;
            }
        }
    }
}
