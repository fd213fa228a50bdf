//! # canvas-sync — Real-time synchronization layer for shared canvases
//!
//! Keeps many editors of one canvas in step, across a fleet of stateless
//! server processes.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐  WebSocket/JSON  ┌───────────────────────────────┐
//! │ Editor A │ ◄──────────────► │ Gateway (process 1)           │
//! └──────────┘                  │  rooms · presence · dispatch  │
//! ┌──────────┐                  │            │                  │
//! │ Editor B │ ◄──────────────► │  SyncSessionManager           │
//! └──────────┘                  │   └─ OperationLog per canvas  │
//!                               └────────────┬──────────────────┘
//!                                            │ publish "canvas:{id}"
//!                                     ┌──────▼──────┐
//!                                     │ PubSub      │ (memory / Redis)
//!                                     └──────┬──────┘
//!                                            │ pattern "canvas:"
//!                               ┌────────────▼──────────────────┐
//!                               │ Gateway (process 2)           │
//!                               │  local room rebroadcast only  │
//!                               └───────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`sync`] — operation log, vector clocks, session manager
//! - [`pubsub`] — fanout adapters (local, in-memory broker, Redis)
//! - [`gateway`] — per-connection state machine, rooms, presence, rate limits
//! - [`server`] — WebSocket listener driving a gateway
//! - [`protocol`] — JSON wire frames
//! - [`auth`] / [`validation`] — consumed collaborator contracts and defaults

pub mod auth;
pub mod config;
pub mod connection;
pub mod error;
pub mod gateway;
pub mod protocol;
pub mod pubsub;
pub mod server;
pub mod sync;
pub mod validation;

// Re-exports for convenience
pub use auth::{
    AccessAuthorizer, AccessDecision, AllowAllAuthorizer, StaticTokenVerifier, TokenVerifier,
    VerifiedUser,
};
pub use config::{GatewayConfig, SyncConfig};
pub use connection::{ConnectionId, ConnectionTable, Outgoing};
pub use error::{
    AuthError, ConfigError, ErrorCode, GatewayError, ProtocolError, ServerError, TransportError,
    ValidationError,
};
pub use gateway::{BackgroundTasks, Gateway, GatewayOptions, GatewayStats, RoomInfo};
pub use protocol::{MessageKind, Outbound, ServerMessage};
pub use pubsub::{
    LocalPubSub, MemoryBroker, MemoryPubSub, MessageHandler, PubSubAdapter, PubSubMessage,
    RedisPubSub,
};
pub use server::SyncServer;
pub use sync::{
    DeltaResult, Operation, OperationLog, OperationType, SyncSessionManager, SyncStats,
    TargetType, VectorClock,
};
pub use validation::{MessageValidator, SchemaValidator};
