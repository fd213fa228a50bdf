//! Connection table: id → handle.
//!
//! Rooms, sessions and presence refer to connections by `ConnectionId` only;
//! this table is the single place that resolves an id to the channel feeding
//! the socket writer. A connection that is no longer in the table is closed.

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::sync::session::ConnectionProbe;

/// Process-unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", &self.0.simple().to_string()[..8])
    }
}

/// What the socket writer task should do next.
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    /// Pre-encoded text frame (shared across broadcast recipients)
    Frame(Arc<str>),
    Ping,
    Close,
}

/// Writer side of one connection plus its heartbeat flag.
pub struct ConnectionHandle {
    sender: mpsc::UnboundedSender<Outgoing>,
    alive: AtomicBool,
}

impl ConnectionHandle {
    /// Queue an item for the writer. Returns false when the writer is gone.
    pub fn send(&self, item: Outgoing) -> bool {
        self.sender.send(item).is_ok()
    }

    pub fn mark_alive(&self) {
        self.alive.store(true, Ordering::SeqCst);
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

/// All open connections of one gateway.
#[derive(Default)]
pub struct ConnectionTable {
    connections: RwLock<HashMap<ConnectionId, Arc<ConnectionHandle>>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection and return the receiver its writer drains.
    pub async fn register(&self, id: ConnectionId) -> mpsc::UnboundedReceiver<Outgoing> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let handle = Arc::new(ConnectionHandle {
            sender,
            alive: AtomicBool::new(true),
        });
        self.connections.write().await.insert(id, handle);
        receiver
    }

    pub async fn remove(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.connections.write().await.remove(&id)
    }

    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.connections.read().await.contains_key(&id)
    }

    pub async fn get(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.connections.read().await.get(&id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    pub async fn ids(&self) -> HashSet<ConnectionId> {
        self.connections.read().await.keys().copied().collect()
    }

    /// Send one frame to one connection. Unknown ids are ignored.
    pub async fn send(&self, id: ConnectionId, frame: Arc<str>) {
        if let Some(handle) = self.connections.read().await.get(&id) {
            if !handle.send(Outgoing::Frame(frame)) {
                log::debug!("Writer of {id} is gone, frame dropped");
            }
        }
    }

    /// Send one pre-encoded frame to many connections.
    pub async fn send_many<'a, I>(&self, ids: I, frame: Arc<str>) -> usize
    where
        I: IntoIterator<Item = &'a ConnectionId>,
    {
        let connections = self.connections.read().await;
        let mut delivered = 0;
        for id in ids {
            if let Some(handle) = connections.get(id) {
                if handle.send(Outgoing::Frame(frame.clone())) {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    pub async fn mark_alive(&self, id: ConnectionId) {
        if let Some(handle) = self.connections.read().await.get(&id) {
            handle.mark_alive();
        }
    }

    /// One heartbeat round.
    ///
    /// Connections that answered since the previous round are pinged and
    /// marked not-alive; the ones that did not are returned as dead.
    pub async fn heartbeat_round(&self) -> Vec<ConnectionId> {
        let connections = self.connections.read().await;
        let mut dead = Vec::new();
        for (id, handle) in connections.iter() {
            if handle.alive.swap(false, Ordering::SeqCst) {
                handle.send(Outgoing::Ping);
            } else {
                dead.push(*id);
            }
        }
        dead
    }
}

impl ConnectionProbe for ConnectionTable {
    fn live_connections(&self) -> BoxFuture<'_, HashSet<ConnectionId>> {
        Box::pin(self.ids())
    }
}
