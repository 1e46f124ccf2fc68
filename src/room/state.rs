use std::collections::HashMap;

use log::{debug, info};

use crate::error::RelayError;
use crate::signaling::{ServerMessage, Signal};

use super::{ConnectionId, RoomId};

/// Rooms are strictly one-to-one.
pub const ROOM_CAPACITY: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub id: ConnectionId,
    /// Carried for UI purposes only; never used for identity checks.
    pub display_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Room {
    pub id: RoomId,
    members: Vec<Member>,
}

impl Room {
    pub fn new(id: RoomId) -> Self {
        Self {
            id,
            members: Vec::with_capacity(ROOM_CAPACITY),
        }
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.members.iter().any(|m| m.id == id)
    }

    pub fn is_full(&self) -> bool {
        self.members.len() >= ROOM_CAPACITY
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    fn add_member(&mut self, member: Member) -> Result<(), RelayError> {
        if self.is_full() {
            return Err(RelayError::RoomFull { room_id: self.id.clone() });
        }
        self.members.push(member);
        Ok(())
    }

    fn remove_member(&mut self, id: ConnectionId) {
        self.members.retain(|m| m.id != id);
    }

    fn others(&self, id: ConnectionId) -> impl Iterator<Item = &Member> {
        self.members.iter().filter(move |m| m.id != id)
    }
}

/// A message the relay must hand to one connection.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub to: ConnectionId,
    pub message: ServerMessage,
}

impl Delivery {
    fn new(to: ConnectionId, message: ServerMessage) -> Self {
        Self { to, message }
    }
}

/// Room membership plus the reverse connection index, owned by exactly one relay.
#[derive(Debug, Default)]
pub struct RoomTable {
    rooms: HashMap<RoomId, Room>,
    memberships: HashMap<ConnectionId, RoomId>,
}

impl RoomTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn room(&self, room_id: &str) -> Option<&Room> {
        self.rooms.get(room_id)
    }

    pub fn room_of(&self, id: ConnectionId) -> Option<&RoomId> {
        self.memberships.get(&id)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn member_count(&self) -> usize {
        self.memberships.len()
    }

    /// Adds `id` to `room_id`, leaving any other room first.
    ///
    /// On success the caller receives `joined` and every other member receives
    /// `member-joined`. Re-joining the current room only repeats the acknowledgment.
    pub fn join(
        &mut self,
        id: ConnectionId,
        room_id: &str,
        display_token: Option<String>,
    ) -> Result<Vec<Delivery>, RelayError> {
        let joined = Delivery::new(id, ServerMessage::Joined { room_id: room_id.to_string() });

        let mut deliveries = Vec::new();
        match self.memberships.get(&id) {
            Some(current) if current == room_id => return Ok(vec![joined]),
            Some(_) => {
                if self.rooms.get(room_id).is_some_and(Room::is_full) {
                    return Err(RelayError::RoomFull { room_id: room_id.to_string() });
                }
                deliveries.extend(self.leave(id));
            }
            None => {}
        }

        let room = self.rooms.entry(room_id.to_string()).or_insert_with(|| {
            info!("Room '{}' created", room_id);
            Room::new(room_id.to_string())
        });
        room.add_member(Member { id, display_token: display_token.clone() })?;

        deliveries.extend(room.others(id).map(|other| {
            Delivery::new(
                other.id,
                ServerMessage::MemberJoined {
                    connection_id: id,
                    display_token: display_token.clone(),
                },
            )
        }));
        deliveries.push(joined);
        self.memberships.insert(id, room_id.to_string());

        info!("Connection {} joined room '{}' ({} member(s))", id, room_id, room.members().len());
        Ok(deliveries)
    }

    /// Removes `id` from its room, destroying the room when it empties.
    pub fn leave(&mut self, id: ConnectionId) -> Vec<Delivery> {
        let Some(room_id) = self.memberships.remove(&id) else {
            return Vec::new();
        };
        let Some(room) = self.rooms.get_mut(&room_id) else {
            return Vec::new();
        };

        room.remove_member(id);
        info!("Connection {} left room '{}'", id, room_id);

        if room.is_empty() {
            self.rooms.remove(&room_id);
            info!("Room '{}' destroyed (empty)", room_id);
            return Vec::new();
        }

        room.members()
            .iter()
            .map(|m| Delivery::new(m.id, ServerMessage::MemberLeft { connection_id: id }))
            .collect()
    }

    /// Routes `signal` from `from` to `to` when both share a room.
    pub fn relay(&self, from: ConnectionId, to: ConnectionId, signal: Signal) -> Result<Delivery, RelayError> {
        let unknown = || RelayError::UnknownPeer { from, to };

        if from == to {
            return Err(unknown());
        }
        let room_id = self.memberships.get(&from).ok_or_else(unknown)?;
        let room = self.rooms.get(room_id).ok_or_else(unknown)?;
        if !room.contains(to) {
            return Err(unknown());
        }

        debug!("Relaying {} from {} to {} in room '{}'", signal.kind.as_str(), from, to, room_id);
        Ok(Delivery::new(to, signal.sent_by(from)))
    }
}
