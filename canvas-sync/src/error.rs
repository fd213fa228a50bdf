//! Error taxonomy.
//!
//! Per-message failures (`GatewayError`) never close a connection: the
//! dispatcher turns each into an `error` frame for the sender only.
//! Fanout failures (`TransportError`) are logged and swallowed by the gateway.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error codes carried by outbound `error` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ParseError,
    Unauthorized,
    AuthFailed,
    AccessDenied,
    NotInRoom,
    ValidationError,
    RateLimited,
    UnknownMessage,
}

/// A rejected inbound message.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GatewayError {
    /// Malformed frame (not JSON, not an object, no type).
    #[error("Malformed message: {0}")]
    Protocol(String),
    /// Anything but `auth` before authentication.
    #[error("Authentication required")]
    Unauthorized,
    #[error("Authentication failed: {0}")]
    AuthFailed(#[from] AuthError),
    #[error("Access denied: {0}")]
    AccessDenied(String),
    /// Operating on a canvas other than the joined room.
    #[error("Not in room for canvas {0}")]
    NotInRoom(String),
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),
    #[error("Rate limit exceeded")]
    RateLimited,
    #[error("Unknown message type: {0}")]
    UnknownMessage(String),
}

impl GatewayError {
    pub fn code(&self) -> ErrorCode {
        match self {
            GatewayError::Protocol(_) => ErrorCode::ParseError,
            GatewayError::Unauthorized => ErrorCode::Unauthorized,
            GatewayError::AuthFailed(_) => ErrorCode::AuthFailed,
            GatewayError::AccessDenied(_) => ErrorCode::AccessDenied,
            GatewayError::NotInRoom(_) => ErrorCode::NotInRoom,
            GatewayError::Validation(_) => ErrorCode::ValidationError,
            GatewayError::RateLimited => ErrorCode::RateLimited,
            GatewayError::UnknownMessage(_) => ErrorCode::UnknownMessage,
        }
    }
}

/// Missing, invalid or expired credential.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{0}")]
pub struct AuthError(pub String);

/// Payload schema violation.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{0}")]
pub struct ValidationError(pub String);

/// Frame encode/decode failure.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Fanout publish/subscribe failure.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Broker error: {0}")]
    Broker(#[from] redis::RedisError),
    #[error("Envelope encoding failed: {0}")]
    Encode(String),
    #[error("Envelope decoding failed: {0}")]
    Decode(String),
    #[error("Adapter is closed")]
    Closed,
}

/// Invalid configuration value.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Server startup failure.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Fanout setup failed: {0}")]
    Transport(#[from] TransportError),
}
