pub mod relay;
pub mod server;
pub mod state;

/// Transport-assigned connection identifier, never reused within a relay's lifetime.
pub type ConnectionId = u64;

pub type RoomId = String;

pub use relay::{Relay, RelayEvent, RelayHandle};
pub use server::RelayServer;
pub use state::{Delivery, Member, Room, RoomTable, ROOM_CAPACITY};
