//! Bounded, versioned replay buffer of recent canvas operations.
//!
//! Architecture:
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │              OperationLog (canvas)            │
//! │                                              │
//! │  dropped ◄── v7 ── v8 ── v9 ── v10 (version) │
//! │              ▲                               │
//! │              └─ oldest retained              │
//! │                                              │
//! │  delta(from=8) → [v9, v10]                   │
//! │  delta(from=5) → ResyncRequired              │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Versions are gapless per (canvas, process): the buffer always holds the
//! suffix `floor+1 ..= version`, so the retained window is a single subtraction.
//! The log is not a system of record. A client whose version fell out of the
//! window reloads full state from persistence instead.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::time::Duration;

use crate::protocol::now_millis;
use crate::sync::vector_clock::VectorClock;

/// Kind of state change an operation records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Create,
    Update,
    Delete,
    Move,
    Resize,
    StateChange,
}

/// Whether the operation targets the canvas itself or one of its widgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    Canvas,
    Widget,
}

/// One recorded state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub version: u64,
    pub vector_clock: VectorClock,
    #[serde(rename = "type")]
    pub op_type: OperationType,
    pub target_id: String,
    pub target_type: TargetType,
    pub payload: Value,
    pub actor_id: String,
    /// Epoch milliseconds.
    pub recorded_at: u64,
}

/// Operations a client missed, or a signal that it must reload state.
#[derive(Debug, Clone, PartialEq)]
pub enum DeltaResult {
    Delta {
        operations: Vec<Operation>,
        current_version: u64,
        vector_clock: VectorClock,
    },
    /// `fromVersion` is outside the retained window.
    ResyncRequired {
        current_version: u64,
        vector_clock: VectorClock,
    },
}

impl DeltaResult {
    pub fn current_version(&self) -> u64 {
        match self {
            DeltaResult::Delta { current_version, .. }
            | DeltaResult::ResyncRequired { current_version, .. } => *current_version,
        }
    }

    pub fn is_resync_required(&self) -> bool {
        matches!(self, DeltaResult::ResyncRequired { .. })
    }

    /// Missed operations (empty when a resync is required).
    pub fn operations(&self) -> &[Operation] {
        match self {
            DeltaResult::Delta { operations, .. } => operations,
            DeltaResult::ResyncRequired { .. } => &[],
        }
    }
}

/// Per-canvas operation log.
pub struct OperationLog {
    canvas_id: String,
    server_id: String,
    version: u64,
    vector_clock: VectorClock,
    operations: VecDeque<Operation>,
    max_operations: usize,
    max_age: Option<Duration>,
}

impl OperationLog {
    /// Create an empty log (version 0).
    ///
    /// `max_operations` caps the buffer length; `max_age` additionally
    /// evicts operations older than the given age.
    pub fn new(
        canvas_id: impl Into<String>,
        server_id: impl Into<String>,
        max_operations: usize,
        max_age: Option<Duration>,
    ) -> Self {
        Self {
            canvas_id: canvas_id.into(),
            server_id: server_id.into(),
            version: 0,
            vector_clock: VectorClock::new(),
            operations: VecDeque::with_capacity(max_operations.min(1024)),
            max_operations: max_operations.max(1),
            max_age,
        }
    }

    /// Record an operation: next version, local clock entry +1, append.
    ///
    /// The oldest operation is dropped when the buffer is full.
    pub fn record(
        &mut self,
        op_type: OperationType,
        target_id: impl Into<String>,
        target_type: TargetType,
        payload: Value,
        actor_id: impl Into<String>,
    ) -> Operation {
        let now = now_millis();
        self.evict_expired(now);

        self.version += 1;
        self.vector_clock.increment(&self.server_id);

        let operation = Operation {
            version: self.version,
            vector_clock: self.vector_clock.clone(),
            op_type,
            target_id: target_id.into(),
            target_type,
            payload,
            actor_id: actor_id.into(),
            recorded_at: now,
        };

        if self.operations.len() >= self.max_operations {
            self.operations.pop_front();
        }
        self.operations.push_back(operation.clone());

        log::trace!(
            "Recorded {:?} on {:?} {} at version {} (canvas {})",
            op_type,
            operation.target_type,
            operation.target_id,
            self.version,
            self.canvas_id
        );
        operation
    }

    /// Operations with version strictly greater than `from_version`.
    pub fn delta_since(&mut self, from_version: u64) -> DeltaResult {
        self.evict_expired(now_millis());

        let floor = self.retained_floor();
        if from_version < floor || from_version > self.version {
            log::debug!(
                "Resync required for canvas {}: from={} window={}..={}",
                self.canvas_id,
                from_version,
                floor,
                self.version
            );
            return DeltaResult::ResyncRequired {
                current_version: self.version,
                vector_clock: self.vector_clock.clone(),
            };
        }

        // Gapless buffer: operation with version v sits at index v - floor - 1.
        let skip = (from_version - floor) as usize;
        let operations = self.operations.iter().skip(skip).cloned().collect();

        DeltaResult::Delta {
            operations,
            current_version: self.version,
            vector_clock: self.vector_clock.clone(),
        }
    }

    /// Fold a sibling process's clock into ours.
    pub fn observe_remote_clock(&mut self, remote: &VectorClock) {
        self.vector_clock.merge(remote);
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn vector_clock(&self) -> &VectorClock {
        &self.vector_clock
    }

    pub fn canvas_id(&self) -> &str {
        &self.canvas_id
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Oldest version still retained, if any.
    pub fn oldest_version(&self) -> Option<u64> {
        self.operations.front().map(|op| op.version)
    }

    /// Highest version no longer (or never) held in the buffer.
    fn retained_floor(&self) -> u64 {
        self.version - self.operations.len() as u64
    }

    fn evict_expired(&mut self, now: u64) {
        let Some(max_age) = self.max_age else { return };
        let max_age_ms = max_age.as_millis() as u64;
        while let Some(front) = self.operations.front() {
            if now.saturating_sub(front.recorded_at) > max_age_ms {
                self.operations.pop_front();
            } else {
                break;
            }
        }
    }
}
