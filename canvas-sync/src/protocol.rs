//! JSON wire protocol.
//!
//! Every frame is a JSON object with a `type` tag:
//! ```text
//! ┌──────────┬────────┬────────────┬──────────────────┬───────────┐
//! │ type     │ id?    │ canvasId?  │ type-specific …  │ timestamp │
//! │ string   │ string │ string     │                  │ ms epoch  │
//! └──────────┴────────┴────────────┴──────────────────┴───────────┘
//! ```
//!
//! Inbound frames are kept as JSON maps until the validator has sanitized
//! them, then decoded into typed requests. Outbound frames are typed
//! (`ServerMessage`) except re-emitted operations, which carry the sanitized
//! client payload through unchanged (`Outbound::Relay`). The server stamps
//! `timestamp` on every outbound frame at encode time.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{ErrorCode, GatewayError, ProtocolError, ValidationError};
use crate::gateway::presence::PresenceEntry;
use crate::sync::operation_log::{Operation, OperationType, TargetType};
use crate::sync::vector_clock::VectorClock;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Inbound message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Auth,
    Join,
    Leave,
    CanvasUpdate,
    WidgetCreate,
    WidgetUpdate,
    WidgetDelete,
    WidgetMove,
    WidgetResize,
    WidgetState,
    WidgetBatch,
    CursorMove,
    SelectionChange,
    SyncRequest,
}

impl MessageKind {
    pub const ALL: [MessageKind; 14] = [
        MessageKind::Auth,
        MessageKind::Join,
        MessageKind::Leave,
        MessageKind::CanvasUpdate,
        MessageKind::WidgetCreate,
        MessageKind::WidgetUpdate,
        MessageKind::WidgetDelete,
        MessageKind::WidgetMove,
        MessageKind::WidgetResize,
        MessageKind::WidgetState,
        MessageKind::WidgetBatch,
        MessageKind::CursorMove,
        MessageKind::SelectionChange,
        MessageKind::SyncRequest,
    ];

    pub fn from_wire(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == s)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Auth => "auth",
            MessageKind::Join => "join",
            MessageKind::Leave => "leave",
            MessageKind::CanvasUpdate => "canvas:update",
            MessageKind::WidgetCreate => "widget:create",
            MessageKind::WidgetUpdate => "widget:update",
            MessageKind::WidgetDelete => "widget:delete",
            MessageKind::WidgetMove => "widget:move",
            MessageKind::WidgetResize => "widget:resize",
            MessageKind::WidgetState => "widget:state",
            MessageKind::WidgetBatch => "widget:batch",
            MessageKind::CursorMove => "cursor:move",
            MessageKind::SelectionChange => "selection:change",
            MessageKind::SyncRequest => "sync:request",
        }
    }

    /// Canvas/widget mutations that are recorded in the operation log.
    pub fn is_mutation(&self) -> bool {
        self.operation().is_some()
    }

    /// High-frequency presence messages.
    pub fn is_presence(&self) -> bool {
        matches!(self, MessageKind::CursorMove | MessageKind::SelectionChange)
    }

    /// How a mutation is recorded in the log.
    pub fn operation(&self) -> Option<(OperationType, TargetType)> {
        let recorded = match self {
            MessageKind::CanvasUpdate => (OperationType::Update, TargetType::Canvas),
            MessageKind::WidgetCreate => (OperationType::Create, TargetType::Widget),
            MessageKind::WidgetUpdate => (OperationType::Update, TargetType::Widget),
            MessageKind::WidgetDelete => (OperationType::Delete, TargetType::Widget),
            MessageKind::WidgetMove => (OperationType::Move, TargetType::Widget),
            MessageKind::WidgetResize => (OperationType::Resize, TargetType::Widget),
            MessageKind::WidgetState => (OperationType::StateChange, TargetType::Widget),
            // A batch is one operation against the canvas as a whole.
            MessageKind::WidgetBatch => (OperationType::Update, TargetType::Canvas),
            _ => return None,
        };
        Some(recorded)
    }
}

/// A parsed but not yet validated inbound frame.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub id: Option<String>,
    /// Raw `type` tag (None when absent or not a string)
    pub kind: Option<String>,
    pub body: Map<String, Value>,
}

impl InboundFrame {
    /// Parse a text frame. Fails only when it is not a JSON object.
    pub fn parse(text: &str) -> Result<Self, GatewayError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| GatewayError::Protocol(e.to_string()))?;
        let Value::Object(body) = value else {
            return Err(GatewayError::Protocol("expected a JSON object".into()));
        };

        let id = body.get("id").and_then(|id| match id {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        });
        let kind = body.get("type").and_then(Value::as_str).map(str::to_string);

        Ok(Self { id, kind, body })
    }

    /// `canvasId` field, if present and a string.
    pub fn canvas_id(&self) -> Option<&str> {
        self.body.get("canvasId").and_then(Value::as_str)
    }
}

/// Decode a sanitized frame into a typed request.
pub fn decode_body<T: DeserializeOwned>(value: Value) -> Result<T, ValidationError> {
    serde_json::from_value(value).map_err(|e| ValidationError(e.to_string()))
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthRequest {
    pub token: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub canvas_id: String,
    pub last_version: Option<u64>,
    pub last_vector_clock: Option<VectorClock>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveRequest {
    pub canvas_id: String,
}

/// Canvas coordinates of a cursor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorMoveRequest {
    pub canvas_id: String,
    pub position: Position,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionChangeRequest {
    pub canvas_id: String,
    pub selected_ids: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub from_version: u64,
}

// ───────────────────────────────────────────────────────────────────
// Outbound
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Ack {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_message_id: Option<String>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorFrame {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_message_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncDeltaFrame {
    pub canvas_id: String,
    pub operations: Vec<Operation>,
    pub current_version: u64,
    pub vector_clock: VectorClock,
    /// The requested version fell out of the retained window; reload state.
    pub resync_required: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceJoinFrame {
    pub canvas_id: String,
    #[serde(flatten)]
    pub user: PresenceEntry,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceLeaveFrame {
    pub canvas_id: String,
    pub user_id: String,
}

/// Presence snapshot: the joiner's view of the room, or one user's update.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUpdateFrame {
    pub canvas_id: String,
    pub users: Vec<PresenceEntry>,
}

/// Typed server → client messages.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "ack")]
    Ack(Ack),
    #[serde(rename = "error")]
    Error(ErrorFrame),
    #[serde(rename = "sync:delta")]
    SyncDelta(SyncDeltaFrame),
    #[serde(rename = "presence:join")]
    PresenceJoin(PresenceJoinFrame),
    #[serde(rename = "presence:leave")]
    PresenceLeave(PresenceLeaveFrame),
    #[serde(rename = "presence:update")]
    PresenceUpdate(PresenceUpdateFrame),
}

impl ServerMessage {
    pub fn ack(original_message_id: Option<String>) -> Self {
        ServerMessage::Ack(Ack {
            original_message_id,
            success: true,
            version: None,
            server_id: None,
        })
    }

    pub fn versioned_ack(
        original_message_id: Option<String>,
        version: u64,
        server_id: impl Into<String>,
    ) -> Self {
        ServerMessage::Ack(Ack {
            original_message_id,
            success: true,
            version: Some(version),
            server_id: Some(server_id.into()),
        })
    }

    pub fn error(err: &GatewayError, original_message_id: Option<String>) -> Self {
        ServerMessage::Error(ErrorFrame {
            code: err.code(),
            message: err.to_string(),
            original_message_id,
        })
    }
}

/// Anything the gateway sends to a client.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Message(ServerMessage),
    /// Sanitized client frame re-emitted to other room members.
    Relay(Map<String, Value>),
}

impl From<ServerMessage> for Outbound {
    fn from(msg: ServerMessage) -> Self {
        Outbound::Message(msg)
    }
}

impl Outbound {
    /// JSON value with a fresh server `timestamp`.
    pub fn to_value(&self) -> Result<Value, ProtocolError> {
        let mut value = match self {
            Outbound::Message(msg) => serde_json::to_value(msg)
                .map_err(|e| ProtocolError::Serialization(e.to_string()))?,
            Outbound::Relay(map) => Value::Object(map.clone()),
        };
        if let Value::Object(map) = &mut value {
            map.insert("timestamp".to_string(), Value::from(now_millis()));
        }
        Ok(value)
    }

    /// Serialize to a text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let value = self.to_value()?;
        serde_json::to_string(&value).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

/// Annotate a sanitized mutation with its recorded version and author.
pub fn relay_operation(
    mut sanitized: Map<String, Value>,
    operation: &Operation,
    user_id: &str,
    server_id: &str,
) -> Map<String, Value> {
    sanitized.insert("version".to_string(), Value::from(operation.version));
    sanitized.insert("userId".to_string(), Value::from(user_id));
    sanitized.insert("serverId".to_string(), Value::from(server_id));
    if let Ok(clock) = serde_json::to_value(&operation.vector_clock) {
        sanitized.insert("vectorClock".to_string(), clock);
    }
    sanitized
}
