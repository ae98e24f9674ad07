//! Room membership and fan-out.
//!
//! A room exists only while it has members. Each member is represented by
//! the sending half of its connection's outbound channel, so fan-out never
//! blocks the sender: a frame is pushed onto each recipient's queue and the
//! recipient's own task writes it to the socket in order.
//!
//! The table itself is not synchronized; the [`Relay`](crate::relay::Relay)
//! wraps it in one mutex together with the store mutations that must happen
//! atomically with a join, leave or broadcast.

use std::collections::HashMap;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::Frame;

/// Identity of one open connection.
pub type ConnectionId = Uuid;

/// Sending half of a connection's outbound queue.
pub type Outbox = mpsc::UnboundedSender<Frame>;

/// Members of one room.
#[derive(Debug, Default)]
pub struct Room {
    members: HashMap<ConnectionId, Outbox>,
}

impl Room {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_member(&mut self, conn_id: ConnectionId, outbox: Outbox) {
        self.members.insert(conn_id, outbox);
    }

    pub fn remove_member(&mut self, conn_id: &ConnectionId) -> bool {
        self.members.remove(conn_id).is_some()
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn has_member(&self, conn_id: &ConnectionId) -> bool {
        self.members.contains_key(conn_id)
    }

    /// Queue `frame` for every member except `from`.
    ///
    /// Members whose receiver is gone are skipped. Returns the outcome so the
    /// caller can record one interaction per delivery.
    pub fn fan_out(&self, from: Option<&ConnectionId>, frame: &Frame) -> FanOut {
        let mut outcome = FanOut::default();
        for (conn_id, outbox) in &self.members {
            if Some(conn_id) == from {
                continue;
            }
            match outbox.send(frame.clone()) {
                Ok(()) => outcome.delivered += 1,
                Err(_) => outcome.skipped += 1,
            }
        }
        outcome
    }
}

/// Result of a single fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanOut {
    pub delivered: usize,
    pub skipped: usize,
}

/// Result of removing a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Departure {
    /// The connection was a member.
    pub removed: bool,
    /// The room emptied and was deleted.
    pub room_closed: bool,
}

/// Room id → members. Empty rooms are never kept.
#[derive(Debug, Default)]
pub struct RoomTable {
    rooms: HashMap<String, Room>,
}

impl RoomTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a member, creating the room if needed. Returns `true` when the
    /// room was created by this call.
    pub fn join(&mut self, room_id: &str, conn_id: ConnectionId, outbox: Outbox) -> bool {
        let created = !self.rooms.contains_key(room_id);
        self.rooms
            .entry(room_id.to_string())
            .or_default()
            .add_member(conn_id, outbox);
        if created {
            log::debug!("Room {room_id} created");
        }
        created
    }

    /// Remove a member and drop the room if it is now empty.
    pub fn leave(&mut self, room_id: &str, conn_id: &ConnectionId) -> Departure {
        let Some(room) = self.rooms.get_mut(room_id) else {
            return Departure {
                removed: false,
                room_closed: false,
            };
        };

        let removed = room.remove_member(conn_id);
        let room_closed = room.is_empty();
        if room_closed {
            self.rooms.remove(room_id);
            log::info!("Room {room_id} removed (empty)");
        }
        Departure { removed, room_closed }
    }

    /// Fan out within one room. Unknown rooms deliver nothing.
    pub fn fan_out(&self, room_id: &str, from: Option<&ConnectionId>, frame: &Frame) -> FanOut {
        self.rooms
            .get(room_id)
            .map(|room| room.fan_out(from, frame))
            .unwrap_or_default()
    }

    pub fn room(&self, room_id: &str) -> Option<&Room> {
        self.rooms.get(room_id)
    }

    pub fn member_count(&self, room_id: &str) -> usize {
        self.rooms.get(room_id).map_or(0, Room::member_count)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn connection_count(&self) -> usize {
        self.rooms.values().map(Room::member_count).sum()
    }

    /// Ids of all rooms with at least one member.
    pub fn active_rooms(&self) -> Vec<String> {
        self.rooms.keys().cloned().collect()
    }
}
