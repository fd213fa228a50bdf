//! Message schema validation and sanitization.
//!
//! A validated message is returned as a new JSON object with every
//! server-authoritative field removed, so clients cannot forge authorship,
//! versions or clocks. Relayed and recorded payloads are always built from
//! the sanitized copy.

use serde_json::{Map, Value};

use crate::error::ValidationError;
use crate::protocol::MessageKind;

/// Fields only the server may set.
pub const SERVER_AUTHORITATIVE_FIELDS: [&str; 9] = [
    "version",
    "userId",
    "serverId",
    "timestamp",
    "vectorClock",
    "actorId",
    "createdBy",
    "updatedBy",
    "recordedAt",
];

/// Validates and sanitizes inbound messages.
pub trait MessageValidator: Send + Sync {
    fn validate(&self, kind: MessageKind, message: &Value) -> Result<Value, ValidationError>;
}

/// Built-in structural checks per message type.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchemaValidator;

impl SchemaValidator {
    pub fn new() -> Self {
        Self
    }
}

impl MessageValidator for SchemaValidator {
    fn validate(&self, kind: MessageKind, message: &Value) -> Result<Value, ValidationError> {
        let Value::Object(fields) = message else {
            return Err(ValidationError("message must be an object".into()));
        };

        match kind {
            MessageKind::Auth => {
                require_string(fields, "token")?;
            }
            MessageKind::Join => {
                require_string(fields, "canvasId")?;
                optional_version(fields, "lastVersion")?;
                if let Some(clock) = fields.get("lastVectorClock") {
                    require_clock(clock)?;
                }
            }
            MessageKind::Leave | MessageKind::CanvasUpdate => {
                require_string(fields, "canvasId")?;
            }
            MessageKind::WidgetCreate => {
                require_string(fields, "canvasId")?;
                if !fields.get("widget").is_some_and(Value::is_object) {
                    return Err(ValidationError("widget must be an object".into()));
                }
                require_widget_id(fields)?;
            }
            MessageKind::WidgetUpdate
            | MessageKind::WidgetDelete
            | MessageKind::WidgetMove
            | MessageKind::WidgetResize
            | MessageKind::WidgetState => {
                require_string(fields, "canvasId")?;
                require_widget_id(fields)?;
            }
            MessageKind::WidgetBatch => {
                require_string(fields, "canvasId")?;
                if !fields.get("operations").is_some_and(Value::is_array) {
                    return Err(ValidationError("operations must be an array".into()));
                }
            }
            MessageKind::CursorMove => {
                require_string(fields, "canvasId")?;
                let position = fields
                    .get("position")
                    .and_then(Value::as_object)
                    .ok_or_else(|| ValidationError("position must be an object".into()))?;
                for axis in ["x", "y"] {
                    if !position.get(axis).is_some_and(Value::is_number) {
                        return Err(ValidationError(format!("position.{axis} must be a number")));
                    }
                }
            }
            MessageKind::SelectionChange => {
                require_string(fields, "canvasId")?;
                let all_strings = fields
                    .get("selectedIds")
                    .and_then(Value::as_array)
                    .is_some_and(|ids| ids.iter().all(Value::is_string));
                if !all_strings {
                    return Err(ValidationError("selectedIds must be an array of strings".into()));
                }
            }
            MessageKind::SyncRequest => {
                if fields.get("fromVersion").and_then(Value::as_u64).is_none() {
                    return Err(ValidationError(
                        "fromVersion must be a non-negative integer".into(),
                    ));
                }
            }
        }

        Ok(Value::Object(sanitize(fields)))
    }
}

/// Copy of `fields` without server-authoritative fields, also removed from a
/// nested `widget` object and from batch entries.
pub fn sanitize(fields: &Map<String, Value>) -> Map<String, Value> {
    let mut clean = strip(fields);
    if let Some(Value::Object(widget)) = clean.get("widget") {
        let widget = strip(widget);
        clean.insert("widget".to_string(), Value::Object(widget));
    }
    if let Some(Value::Array(operations)) = clean.get_mut("operations") {
        for entry in operations.iter_mut() {
            if let Value::Object(op) = entry {
                *op = strip(op);
            }
        }
    }
    clean
}

fn strip(fields: &Map<String, Value>) -> Map<String, Value> {
    fields
        .iter()
        .filter(|(key, _)| !SERVER_AUTHORITATIVE_FIELDS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Target of a widget operation: `widgetId`, else `widget.id`.
pub fn widget_id(fields: &Map<String, Value>) -> Option<&str> {
    fields
        .get("widgetId")
        .and_then(Value::as_str)
        .or_else(|| fields.get("widget")?.get("id")?.as_str())
        .filter(|id| !id.is_empty())
}

fn require_string<'a>(fields: &'a Map<String, Value>, key: &str) -> Result<&'a str, ValidationError> {
    fields
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ValidationError(format!("{key} must be a non-empty string")))
}

fn require_widget_id(fields: &Map<String, Value>) -> Result<(), ValidationError> {
    widget_id(fields)
        .map(|_| ())
        .ok_or_else(|| ValidationError("widgetId or widget.id is required".into()))
}

fn optional_version(fields: &Map<String, Value>, key: &str) -> Result<(), ValidationError> {
    match fields.get(key) {
        None | Some(Value::Null) => Ok(()),
        Some(v) if v.as_u64().is_some() => Ok(()),
        Some(_) => Err(ValidationError(format!("{key} must be a non-negative integer"))),
    }
}

fn require_clock(clock: &Value) -> Result<(), ValidationError> {
    match clock {
        Value::Null => Ok(()),
        Value::Object(entries) if entries.values().all(|v| v.as_u64().is_some()) => Ok(()),
        _ => Err(ValidationError(
            "lastVectorClock must map server ids to counters".into(),
        )),
    }
}
