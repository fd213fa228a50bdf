//! Ephemeral presence: who is connected, where their cursor is, what they
//! have selected.
//!
//! One entry per authenticated connection, process-wide. Colors are handed
//! out from a fixed palette and remembered per user, so a user keeps the
//! same color across reconnects on this process.

use serde::Serialize;
use std::collections::HashMap;

use crate::connection::ConnectionId;
use crate::protocol::{now_millis, Position};

/// Cursor colors, visually distinct on light and dark canvases.
pub const PRESENCE_COLORS: [&str; 10] = [
    "#E91E63", "#9C27B0", "#3F51B5", "#03A9F4", "#009688", "#8BC34A", "#FFC107", "#FF5722",
    "#795548", "#607D8B",
];

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub user_id: String,
    pub username: String,
    pub color: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Position>,
    pub selected_ids: Vec<String>,
    /// Epoch milliseconds of the last presence-bearing message.
    pub last_seen: u64,
}

impl PresenceEntry {
    pub fn new(
        user_id: impl Into<String>,
        username: impl Into<String>,
        color: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            username: username.into(),
            color: color.into(),
            cursor: None,
            selected_ids: Vec::new(),
            last_seen: now_millis(),
        }
    }

    /// Forget cursor and selection (they belong to the room being left).
    pub fn clear_activity(&mut self) {
        self.cursor = None;
        self.selected_ids.clear();
        self.last_seen = now_millis();
    }
}

/// Presence entries of every authenticated connection.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    entries: HashMap<ConnectionId, PresenceEntry>,
    colors: HashMap<String, String>,
    next_color: usize,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Color of `user_id`, assigned on first sight.
    pub fn color_for(&mut self, user_id: &str) -> String {
        if let Some(color) = self.colors.get(user_id) {
            return color.clone();
        }
        let color = PRESENCE_COLORS[self.next_color % PRESENCE_COLORS.len()].to_string();
        self.next_color += 1;
        self.colors.insert(user_id.to_string(), color.clone());
        color
    }

    /// Install the entry of a freshly authenticated connection.
    pub fn register(&mut self, conn: ConnectionId, user_id: &str, username: &str) -> &PresenceEntry {
        let color = self.color_for(user_id);
        self.entries.insert(conn, PresenceEntry::new(user_id, username, color));
        &self.entries[&conn]
    }

    pub fn get(&self, conn: ConnectionId) -> Option<&PresenceEntry> {
        self.entries.get(&conn)
    }

    pub fn get_mut(&mut self, conn: ConnectionId) -> Option<&mut PresenceEntry> {
        self.entries.get_mut(&conn)
    }

    pub fn update_cursor(&mut self, conn: ConnectionId, position: Position) -> Option<&PresenceEntry> {
        let entry = self.entries.get_mut(&conn)?;
        entry.cursor = Some(position);
        entry.last_seen = now_millis();
        Some(entry)
    }

    pub fn update_selection(
        &mut self,
        conn: ConnectionId,
        selected_ids: Vec<String>,
    ) -> Option<&PresenceEntry> {
        let entry = self.entries.get_mut(&conn)?;
        entry.selected_ids = selected_ids;
        entry.last_seen = now_millis();
        Some(entry)
    }

    pub fn remove(&mut self, conn: ConnectionId) -> Option<PresenceEntry> {
        self.entries.remove(&conn)
    }

    /// Entries of `conns`, skipping connections without one.
    pub fn entries_of<'a, I>(&self, conns: I) -> Vec<PresenceEntry>
    where
        I: IntoIterator<Item = &'a ConnectionId>,
    {
        conns
            .into_iter()
            .filter_map(|conn| self.entries.get(conn).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
