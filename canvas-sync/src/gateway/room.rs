//! Process-local rooms: the connections viewing one canvas.
//!
//! Rooms hold connection ids only; `ConnectionTable` resolves them. A room
//! exists while it has members and is removed with its last one.

use std::collections::{BTreeSet, HashMap};

use crate::connection::ConnectionId;
use crate::protocol::now_millis;

#[derive(Debug, Clone)]
pub struct Room {
    canvas_id: String,
    /// connection → user
    members: HashMap<ConnectionId, String>,
    created_at: u64,
}

impl Room {
    pub fn new(canvas_id: impl Into<String>) -> Self {
        Self {
            canvas_id: canvas_id.into(),
            members: HashMap::new(),
            created_at: now_millis(),
        }
    }

    pub fn canvas_id(&self) -> &str {
        &self.canvas_id
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn add(&mut self, conn: ConnectionId, user_id: impl Into<String>) {
        self.members.insert(conn, user_id.into());
    }

    /// Remove a member, returning its user id.
    pub fn remove(&mut self, conn: ConnectionId) -> Option<String> {
        self.members.remove(&conn)
    }

    pub fn has_user(&self, user_id: &str) -> bool {
        self.members.values().any(|u| u == user_id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn connections(&self) -> Vec<ConnectionId> {
        self.members.keys().copied().collect()
    }

    /// Every member except `conn`.
    pub fn others(&self, conn: ConnectionId) -> Vec<ConnectionId> {
        self.members.keys().copied().filter(|c| *c != conn).collect()
    }

    /// Distinct user ids, sorted.
    pub fn user_ids(&self) -> Vec<String> {
        let users: BTreeSet<&String> = self.members.values().collect();
        users.into_iter().cloned().collect()
    }
}

/// What removing a member left behind.
#[derive(Debug, Clone, PartialEq)]
pub struct Departure {
    pub user_id: String,
    /// Members still in the room
    pub remaining: Vec<ConnectionId>,
    /// The user still has another connection in the room
    pub user_still_present: bool,
    pub room_deleted: bool,
}

/// All rooms of one gateway, keyed by canvas id.
#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: HashMap<String, Room>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&mut self, canvas_id: &str) -> &mut Room {
        self.rooms.entry(canvas_id.to_string()).or_insert_with(|| {
            log::info!("Created room for canvas {canvas_id}");
            Room::new(canvas_id)
        })
    }

    pub fn get(&self, canvas_id: &str) -> Option<&Room> {
        self.rooms.get(canvas_id)
    }

    /// Remove `conn` from a room, deleting the room if it is now empty.
    pub fn leave(&mut self, canvas_id: &str, conn: ConnectionId) -> Option<Departure> {
        let room = self.rooms.get_mut(canvas_id)?;
        let user_id = room.remove(conn)?;
        let departure = Departure {
            user_still_present: room.has_user(&user_id),
            remaining: room.connections(),
            room_deleted: room.is_empty(),
            user_id,
        };
        if departure.room_deleted {
            self.rooms.remove(canvas_id);
            log::info!("Removed empty room for canvas {canvas_id}");
        }
        Some(departure)
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Room> {
        self.rooms.values()
    }
}
