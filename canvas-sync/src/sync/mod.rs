//! Per-canvas operation logs, vector clocks and sync sessions.

pub mod operation_log;
pub mod session;
pub mod vector_clock;

pub use operation_log::{DeltaResult, Operation, OperationLog, OperationType, TargetType};
pub use session::{
    CleanupTask, ConnectionProbe, SessionJoin, SyncSession, SyncSessionManager, SyncStats,
};
pub use vector_clock::{ClockOrdering, VectorClock};
