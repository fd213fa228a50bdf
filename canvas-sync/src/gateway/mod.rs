//! Connection gateway: authentication, rooms, dispatch, rate limiting,
//! heartbeat, presence and broadcast.
//!
//! ## Per-connection state machine
//!
//! ```text
//!                auth ok                 join ok
//! UNAUTHENTICATED ──────► AUTHENTICATED ◄────────► IN_ROOM
//!        │                      │          leave          │
//!        └──────────────────────┴──── disconnect ─────────┴──► CLOSED
//! ```
//!
//! ## Broadcast path
//!
//! ```text
//! mutation ──► validate ──► record_operation ──► local room (minus sender)
//!                                   │
//!                                   └──► pubsub "canvas:{id}" ──► sibling gateways
//!                                                                   └─► their local room only
//! ```
//!
//! The gateway is transport-agnostic: `connect` hands out a receiver of
//! `Outgoing` items, `handle_text` feeds one inbound frame. The WebSocket
//! server (`crate::server`) is a thin pump between a socket and these two.
//!
//! All room, presence and client state sits behind one mutex. Frames
//! produced by a message are queued to their recipients before that mutex
//! is released, so every member of a room observes operations in version
//! order. Token verification and access checks run without the lock.

mod handlers;
pub mod presence;
pub mod rate_limit;
pub mod room;

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::auth::{AccessAuthorizer, AllowAllAuthorizer, TokenVerifier, VerifiedUser};
use crate::config::GatewayConfig;
use crate::connection::{ConnectionId, ConnectionTable, Outgoing};
use crate::error::TransportError;
use crate::protocol::Outbound;
use crate::pubsub::{canvas_from_channel, LocalPubSub, MessageHandler, PubSubAdapter, PubSubMessage};
use crate::sync::session::{CleanupTask, ConnectionProbe, SyncSessionManager, SyncStats};
use crate::sync::vector_clock::VectorClock;
use crate::validation::{MessageValidator, SchemaValidator};

use self::handlers::Reply;
use self::presence::{PresenceEntry, PresenceTracker};
use self::rate_limit::RateLimiter;
use self::room::RoomRegistry;

/// Per-connection protocol state.
#[derive(Debug, Clone, Default)]
struct ClientState {
    /// Set once authenticated
    identity: Option<VerifiedUser>,
    /// Canvas of the joined room
    room: Option<String>,
}

/// Everything guarded by the gateway mutex.
struct GatewayState {
    clients: HashMap<ConnectionId, ClientState>,
    rooms: RoomRegistry,
    presence: PresenceTracker,
    limiter: RateLimiter,
}

/// Construction options.
///
/// The fanout adapter is injected; without one the gateway runs
/// single-instance with [`LocalPubSub`].
pub struct GatewayOptions {
    pub config: GatewayConfig,
    /// Process identity for self-echo suppression (random when None)
    pub server_id: Option<String>,
    pub pubsub: Option<Arc<dyn PubSubAdapter>>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub authorizer: Arc<dyn AccessAuthorizer>,
    pub validator: Arc<dyn MessageValidator>,
}

impl GatewayOptions {
    pub fn new(verifier: Arc<dyn TokenVerifier>) -> Self {
        Self {
            config: GatewayConfig::default(),
            server_id: None,
            pubsub: None,
            verifier,
            authorizer: Arc::new(AllowAllAuthorizer),
            validator: Arc::new(SchemaValidator::new()),
        }
    }

    pub fn with_config(mut self, config: GatewayConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_server_id(mut self, server_id: impl Into<String>) -> Self {
        self.server_id = Some(server_id.into());
        self
    }

    pub fn with_pubsub(mut self, pubsub: Arc<dyn PubSubAdapter>) -> Self {
        self.pubsub = Some(pubsub);
        self
    }

    pub fn with_authorizer(mut self, authorizer: Arc<dyn AccessAuthorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn MessageValidator>) -> Self {
        self.validator = validator;
        self
    }
}

/// Snapshot of one room.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomInfo {
    pub canvas_id: String,
    /// Distinct users
    pub user_count: usize,
    pub users: Vec<String>,
    pub connections: usize,
    pub version: u64,
    /// Epoch milliseconds.
    pub created_at: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayStats {
    pub server_id: String,
    pub connections: usize,
    pub rooms: usize,
    /// Authenticated connections with a presence entry
    pub presence_entries: usize,
    pub pubsub_adapter: String,
    pub sync_stats: SyncStats,
}

/// Timers and subscriptions started by [`Gateway::start_background`].
pub struct BackgroundTasks {
    fanout: JoinHandle<()>,
    heartbeat: JoinHandle<()>,
    cleanup: CleanupTask,
}

impl BackgroundTasks {
    pub fn stop(&self) {
        self.fanout.abort();
        self.heartbeat.abort();
        self.cleanup.stop();
    }
}

impl Drop for BackgroundTasks {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One gateway per listener. Owns rooms and presence; shares the sync
/// session manager and connection table with its background tasks.
pub struct Gateway {
    server_id: String,
    config: GatewayConfig,
    connections: Arc<ConnectionTable>,
    sync: Arc<SyncSessionManager>,
    pubsub: Arc<dyn PubSubAdapter>,
    verifier: Arc<dyn TokenVerifier>,
    authorizer: Arc<dyn AccessAuthorizer>,
    validator: Arc<dyn MessageValidator>,
    state: Mutex<GatewayState>,
}

impl Gateway {
    pub fn new(options: GatewayOptions) -> Self {
        let GatewayOptions {
            config,
            server_id,
            pubsub,
            verifier,
            authorizer,
            validator,
        } = options;

        let server_id =
            server_id.unwrap_or_else(|| format!("server-{}", uuid::Uuid::new_v4().simple()));
        let pubsub = pubsub.unwrap_or_else(|| Arc::new(LocalPubSub::new()) as Arc<dyn PubSubAdapter>);
        let sync = Arc::new(SyncSessionManager::new(server_id.clone(), config.sync.clone()));
        let state = GatewayState {
            clients: HashMap::new(),
            rooms: RoomRegistry::new(),
            presence: PresenceTracker::new(),
            limiter: RateLimiter::new(config.rate_limit_window, config.rate_limit_max),
        };

        log::info!(
            "Gateway {server_id} created (fanout: {}, heartbeat: {:?})",
            pubsub.name(),
            config.heartbeat_interval
        );

        Self {
            server_id,
            config,
            connections: Arc::new(ConnectionTable::new()),
            sync,
            pubsub,
            verifier,
            authorizer,
            validator,
            state: Mutex::new(state),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn sync(&self) -> &Arc<SyncSessionManager> {
        &self.sync
    }

    pub fn connections(&self) -> &Arc<ConnectionTable> {
        &self.connections
    }

    /// Open a connection. The receiver yields everything to write to it.
    pub async fn connect(&self) -> (ConnectionId, mpsc::UnboundedReceiver<Outgoing>) {
        let conn = ConnectionId::new();
        let receiver = self.connections.register(conn).await;
        self.state
            .lock()
            .await
            .clients
            .insert(conn, ClientState::default());
        log::info!("Connection opened: {conn}");
        (conn, receiver)
    }

    /// Close a connection: leave its room, drop presence and session.
    /// Idempotent.
    pub async fn disconnect(&self, conn: ConnectionId) {
        self.connections.remove(conn).await;

        let mut state = self.state.lock().await;
        let Some(client) = state.clients.remove(&conn) else {
            return;
        };

        let mut reply = Reply::default();
        if let Some(canvas_id) = client.room {
            self.depart(&mut state, conn, &canvas_id, &mut reply).await;
        }
        state.presence.remove(conn);

        self.deliver(reply.deliveries).await;
        drop(state);

        self.sync.remove_session(conn).await;
        log::info!("Connection closed: {conn}");
    }

    /// Record a pong.
    pub async fn mark_alive(&self, conn: ConnectionId) {
        self.connections.mark_alive(conn).await;
    }

    /// One heartbeat round: ping live connections, close the silent ones.
    /// Returns how many were closed.
    pub async fn heartbeat_tick(&self) -> usize {
        let dead = self.connections.heartbeat_round().await;
        for conn in &dead {
            log::info!("Heartbeat timeout, closing {conn}");
            if let Some(handle) = self.connections.get(*conn).await {
                handle.send(Outgoing::Close);
            }
            self.disconnect(*conn).await;
        }
        dead.len()
    }

    /// Deliver a message received from a sibling process to the local room.
    ///
    /// Messages published by this process are dropped; received messages
    /// are never republished.
    pub async fn handle_fanout(&self, message: PubSubMessage) {
        if message.sender_id == self.server_id {
            log::trace!("Ignoring own fanout on {}", message.channel);
            return;
        }
        let Some(canvas_id) = canvas_from_channel(&self.config.channel_prefix, &message.channel)
        else {
            log::warn!("Fanout on unexpected channel {}", message.channel);
            return;
        };
        let body = match serde_json::from_str::<serde_json::Value>(&message.data) {
            Ok(serde_json::Value::Object(body)) => body,
            _ => {
                log::warn!("Dropping malformed fanout frame from {}", message.sender_id);
                return;
            }
        };

        if let Some(clock) = body
            .get("vectorClock")
            .and_then(|v| serde_json::from_value::<VectorClock>(v.clone()).ok())
        {
            self.sync.observe_remote_clock(canvas_id, &clock).await;
        }

        let state = self.state.lock().await;
        let Some(room) = state.rooms.get(canvas_id) else {
            log::trace!("No local room for canvas {canvas_id}, fanout dropped");
            return;
        };
        let mut reply = Reply::default();
        reply.broadcast(room.connections(), Outbound::Relay(body));
        self.deliver(reply.deliveries).await;
        log::debug!(
            "Relayed fanout from {} to room {canvas_id}",
            message.sender_id
        );
    }

    /// Subscribe to canvas fanout and start the heartbeat and session sweep.
    pub async fn start_background(self: &Arc<Self>) -> Result<BackgroundTasks, TransportError> {
        // Handlers run on the adapter's task; hop onto one consumer so
        // fanout messages are applied in arrival order.
        let (tx, mut rx) = mpsc::unbounded_channel::<PubSubMessage>();
        let handler: MessageHandler = Arc::new(move |message| {
            let _ = tx.send(message);
        });
        self.pubsub
            .pattern_subscribe(&self.config.channel_prefix, handler)
            .await?;

        let weak: Weak<Self> = Arc::downgrade(self);
        let fanout = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let Some(gateway) = weak.upgrade() else { break };
                gateway.handle_fanout(message).await;
            }
        });

        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.config.heartbeat_interval;
        let heartbeat = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(gateway) = weak.upgrade() else { break };
                gateway.heartbeat_tick().await;
            }
        });

        let probe: Arc<dyn ConnectionProbe> = self.connections.clone();
        let cleanup = self.sync.start_cleanup(probe);

        log::info!(
            "Gateway {} subscribed to {}* via {}",
            self.server_id,
            self.config.channel_prefix,
            self.pubsub.name()
        );
        Ok(BackgroundTasks {
            fanout,
            heartbeat,
            cleanup,
        })
    }

    /// Close every connection and the fanout adapter.
    pub async fn shutdown(&self) {
        for conn in self.connections.ids().await {
            if let Some(handle) = self.connections.get(conn).await {
                handle.send(Outgoing::Close);
            }
            self.disconnect(conn).await;
        }
        if let Err(e) = self.pubsub.close().await {
            log::warn!("Closing fanout adapter failed: {e}");
        }
        log::info!("Gateway {} shut down", self.server_id);
    }

    pub async fn room_info(&self, canvas_id: &str) -> Option<RoomInfo> {
        let (users, connections, created_at) = {
            let state = self.state.lock().await;
            let room = state.rooms.get(canvas_id)?;
            (room.user_ids(), room.len(), room.created_at())
        };
        Some(RoomInfo {
            canvas_id: canvas_id.to_string(),
            user_count: users.len(),
            users,
            connections,
            version: self.sync.get_version(canvas_id).await,
            created_at,
        })
    }

    pub async fn all_rooms_info(&self) -> Vec<RoomInfo> {
        let canvases: Vec<String> = {
            let state = self.state.lock().await;
            state.rooms.iter().map(|r| r.canvas_id().to_string()).collect()
        };
        let mut infos = Vec::with_capacity(canvases.len());
        for canvas_id in canvases {
            if let Some(info) = self.room_info(&canvas_id).await {
                infos.push(info);
            }
        }
        infos.sort_by(|a, b| a.canvas_id.cmp(&b.canvas_id));
        infos
    }

    /// Presence entries of a room.
    pub async fn presence(&self, canvas_id: &str) -> Vec<PresenceEntry> {
        let state = self.state.lock().await;
        match state.rooms.get(canvas_id) {
            Some(room) => state.presence.entries_of(room.connections().iter()),
            None => Vec::new(),
        }
    }

    pub async fn stats(&self) -> GatewayStats {
        let (rooms, presence_entries) = {
            let state = self.state.lock().await;
            (state.rooms.len(), state.presence.len())
        };
        GatewayStats {
            server_id: self.server_id.clone(),
            connections: self.connections.len().await,
            rooms,
            presence_entries,
            pubsub_adapter: self.pubsub.name().to_string(),
            sync_stats: self.sync.stats().await,
        }
    }
}
