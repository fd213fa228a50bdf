//! Sync session manager: one operation log per canvas, one session per
//! connection, reconnection deltas and a periodic stale-session sweep.
//!
//! ```text
//! join(lastVersion?) ──► create_session ──► OperationLog(canvas).delta_since
//!                              │                     │
//!                              ▼                     ▼
//!                        sessions[conn]        Some(delta) | None
//!
//! every cleanup_interval: sessions whose connection is gone are dropped
//! ```

use futures_util::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::config::SyncConfig;
use crate::connection::ConnectionId;
use crate::protocol::now_millis;
use crate::sync::operation_log::{DeltaResult, Operation, OperationLog, OperationType, TargetType};
use crate::sync::vector_clock::{ClockOrdering, VectorClock};

/// One connection's membership of a canvas.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSession {
    pub user_id: String,
    pub canvas_id: String,
    pub connection_id: ConnectionId,
    pub server_id: String,
    /// Epoch milliseconds.
    pub created_at: u64,
    /// Clock the client reported on reconnect, kept for conflict detection.
    pub client_clock: Option<VectorClock>,
}

/// Result of `create_session`.
///
/// `delta` is `None` on a fresh join, and always `Some` when the client
/// supplied a last known version, even if it missed nothing.
#[derive(Debug, Clone)]
pub struct SessionJoin {
    pub session: SyncSession,
    pub delta: Option<DeltaResult>,
}

/// Session and log counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStats {
    pub total_sessions: usize,
    pub unique_users: usize,
    pub unique_canvases: usize,
    pub operation_logs: usize,
}

/// Source of the set of connections that still exist.
pub trait ConnectionProbe: Send + Sync {
    fn live_connections(&self) -> BoxFuture<'_, HashSet<ConnectionId>>;
}

/// Handle of the periodic sweep. Stopping (or dropping) it cancels the timer.
pub struct CleanupTask {
    handle: JoinHandle<()>,
}

impl CleanupTask {
    pub fn stop(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for CleanupTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Owns every canvas operation log and every sync session of one process.
pub struct SyncSessionManager {
    server_id: String,
    config: SyncConfig,
    sessions: RwLock<HashMap<ConnectionId, SyncSession>>,
    logs: RwLock<HashMap<String, Arc<Mutex<OperationLog>>>>,
}

impl SyncSessionManager {
    pub fn new(server_id: impl Into<String>, config: SyncConfig) -> Self {
        Self {
            server_id: server_id.into(),
            config,
            sessions: RwLock::new(HashMap::new()),
            logs: RwLock::new(HashMap::new()),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Get or lazily create the log for a canvas.
    pub async fn get_or_create_operation_log(&self, canvas_id: &str) -> Arc<Mutex<OperationLog>> {
        // Fast path: read lock
        {
            let logs = self.logs.read().await;
            if let Some(log) = logs.get(canvas_id) {
                return log.clone();
            }
        }

        let mut logs = self.logs.write().await;
        logs.entry(canvas_id.to_string())
            .or_insert_with(|| {
                log::debug!("Created operation log for canvas {canvas_id}");
                Arc::new(Mutex::new(OperationLog::new(
                    canvas_id,
                    self.server_id.clone(),
                    self.config.max_operations,
                    self.config.max_operation_age,
                )))
            })
            .clone()
    }

    async fn existing_log(&self, canvas_id: &str) -> Option<Arc<Mutex<OperationLog>>> {
        self.logs.read().await.get(canvas_id).cloned()
    }

    /// Record an operation in the canvas log.
    pub async fn record_operation(
        &self,
        canvas_id: &str,
        op_type: OperationType,
        target_id: &str,
        target_type: TargetType,
        payload: Value,
        actor_id: &str,
    ) -> Operation {
        let log = self.get_or_create_operation_log(canvas_id).await;
        let mut log = log.lock().await;
        log.record(op_type, target_id, target_type, payload, actor_id)
    }

    /// Operations after `from_version`, or a resync signal.
    pub async fn get_delta(&self, canvas_id: &str, from_version: u64) -> DeltaResult {
        let log = self.get_or_create_operation_log(canvas_id).await;
        let mut log = log.lock().await;
        log.delta_since(from_version)
    }

    /// Current version of a canvas (0 when nothing was recorded).
    pub async fn get_version(&self, canvas_id: &str) -> u64 {
        match self.existing_log(canvas_id).await {
            Some(log) => log.lock().await.version(),
            None => 0,
        }
    }

    /// Fold a sibling's clock into an existing log. Unknown canvases are ignored.
    pub async fn observe_remote_clock(&self, canvas_id: &str, clock: &VectorClock) {
        if let Some(log) = self.existing_log(canvas_id).await {
            log.lock().await.observe_remote_clock(clock);
        }
    }

    /// Create (or replace) the session of `connection_id`.
    ///
    /// When `last_version` is given the reconnection delta is computed
    /// against that canvas's log and returned with the session.
    pub async fn create_session(
        &self,
        user_id: &str,
        canvas_id: &str,
        connection_id: ConnectionId,
        last_version: Option<u64>,
        last_vector_clock: Option<VectorClock>,
    ) -> SessionJoin {
        let session = SyncSession {
            user_id: user_id.to_string(),
            canvas_id: canvas_id.to_string(),
            connection_id,
            server_id: self.server_id.clone(),
            created_at: now_millis(),
            client_clock: last_vector_clock,
        };

        let replaced = self
            .sessions
            .write()
            .await
            .insert(connection_id, session.clone());
        if let Some(previous) = replaced {
            log::debug!(
                "Session of {connection_id} moved from canvas {} to {canvas_id}",
                previous.canvas_id
            );
        }

        let delta = match last_version {
            Some(from) => {
                let delta = self.get_delta(canvas_id, from).await;
                if let (Some(client), DeltaResult::Delta { vector_clock, .. }) =
                    (&session.client_clock, &delta)
                {
                    if client.compare(vector_clock) == ClockOrdering::Concurrent {
                        log::debug!(
                            "Client clock of {user_id} is concurrent with canvas {canvas_id}"
                        );
                    }
                }
                Some(delta)
            }
            None => None,
        };

        log::info!(
            "Session created: user {user_id} on canvas {canvas_id} ({connection_id}){}",
            if delta.is_some() { " [reconnect]" } else { "" }
        );

        SessionJoin { session, delta }
    }

    /// Remove the session of a connection. Unknown ids are a no-op.
    pub async fn remove_session(&self, connection_id: ConnectionId) -> Option<SyncSession> {
        let removed = self.sessions.write().await.remove(&connection_id);
        if let Some(ref session) = removed {
            log::debug!(
                "Session removed: user {} left canvas {} ({connection_id})",
                session.user_id,
                session.canvas_id
            );
        }
        removed
    }

    pub async fn session(&self, connection_id: ConnectionId) -> Option<SyncSession> {
        self.sessions.read().await.get(&connection_id).cloned()
    }

    /// Drop sessions whose connection is not in `live`. Returns how many.
    pub async fn sweep_stale_sessions(&self, live: &HashSet<ConnectionId>) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|id, _| live.contains(id));
        let removed = before - sessions.len();
        if removed > 0 {
            log::info!("Session sweep removed {removed} stale sessions");
        }
        removed
    }

    /// Run `sweep_stale_sessions` every `cleanup_interval` until stopped.
    pub fn start_cleanup(self: &Arc<Self>, probe: Arc<dyn ConnectionProbe>) -> CleanupTask {
        let manager: Weak<Self> = Arc::downgrade(self);
        let period = self.config.cleanup_interval;

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(strong) = manager.upgrade() else { break };
                let live = probe.live_connections().await;
                strong.sweep_stale_sessions(&live).await;
            }
        });

        CleanupTask { handle }
    }

    /// Counters for observability.
    pub async fn stats(&self) -> SyncStats {
        let sessions = self.sessions.read().await;
        let users: HashSet<&str> = sessions.values().map(|s| s.user_id.as_str()).collect();
        let canvases: HashSet<&str> = sessions.values().map(|s| s.canvas_id.as_str()).collect();
        SyncStats {
            total_sessions: sessions.len(),
            unique_users: users.len(),
            unique_canvases: canvases.len(),
            operation_logs: self.logs.read().await.len(),
        }
    }
}
