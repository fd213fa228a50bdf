//! Inbound dispatch: one handler per message type.
//!
//! Handlers mutate `GatewayState` and collect outbound frames in a `Reply`.
//! The dispatcher queues those frames while still holding the state lock,
//! then publishes the fanout copy (if any) after releasing it. A handler
//! error becomes an `error` frame for the sender only.

use serde_json::Value;
use std::sync::Arc;

use super::{Gateway, GatewayState};
use crate::auth::VerifiedUser;
use crate::connection::ConnectionId;
use crate::error::{AuthError, GatewayError, ValidationError};
use crate::protocol::{
    decode_body, relay_operation, Ack, AuthRequest, CursorMoveRequest, InboundFrame, JoinRequest,
    LeaveRequest, MessageKind, Outbound, PresenceJoinFrame, PresenceLeaveFrame,
    PresenceUpdateFrame, SelectionChangeRequest, ServerMessage, SyncDeltaFrame, SyncRequest,
};
use crate::pubsub::canvas_channel;
use crate::sync::operation_log::{DeltaResult, TargetType};
use crate::validation::widget_id;

/// One frame for a set of connections.
pub(super) struct Delivery {
    recipients: Vec<ConnectionId>,
    frame: Outbound,
}

/// Encoded frame for sibling processes.
pub(super) struct Publication {
    channel: String,
    data: String,
}

/// Everything a handled message produces.
#[derive(Default)]
pub(super) struct Reply {
    pub(super) deliveries: Vec<Delivery>,
    pub(super) publication: Option<Publication>,
}

impl Reply {
    pub(super) fn send(&mut self, conn: ConnectionId, frame: impl Into<Outbound>) {
        self.deliveries.push(Delivery {
            recipients: vec![conn],
            frame: frame.into(),
        });
    }

    pub(super) fn broadcast(&mut self, recipients: Vec<ConnectionId>, frame: impl Into<Outbound>) {
        if !recipients.is_empty() {
            self.deliveries.push(Delivery {
                recipients,
                frame: frame.into(),
            });
        }
    }
}

fn joined_room(state: &GatewayState, conn: ConnectionId) -> Option<String> {
    state.clients.get(&conn).and_then(|c| c.room.clone())
}

fn not_in_room(canvas_id: Option<&str>) -> GatewayError {
    GatewayError::NotInRoom(canvas_id.unwrap_or("<none>").to_string())
}

fn delta_message(canvas_id: &str, delta: DeltaResult) -> ServerMessage {
    let frame = match delta {
        DeltaResult::Delta {
            operations,
            current_version,
            vector_clock,
        } => SyncDeltaFrame {
            canvas_id: canvas_id.to_string(),
            operations,
            current_version,
            vector_clock,
            resync_required: false,
        },
        DeltaResult::ResyncRequired {
            current_version,
            vector_clock,
        } => SyncDeltaFrame {
            canvas_id: canvas_id.to_string(),
            operations: Vec::new(),
            current_version,
            vector_clock,
            resync_required: true,
        },
    };
    ServerMessage::SyncDelta(frame)
}

impl Gateway {
    /// Handle one inbound text frame from `conn`.
    ///
    /// Callers must feed the frames of one connection sequentially.
    pub async fn handle_text(&self, conn: ConnectionId, text: &str) {
        let frame = match InboundFrame::parse(text) {
            Ok(frame) => frame,
            Err(err) => {
                self.reject(conn, &err, None).await;
                return;
            }
        };
        let message_id = frame.id.clone();
        if let Err(err) = self.dispatch(conn, frame).await {
            self.reject(conn, &err, message_id).await;
        }
    }

    /// Handle one inbound binary frame. Only UTF-8 JSON is accepted.
    pub async fn handle_binary(&self, conn: ConnectionId, data: &[u8]) {
        match std::str::from_utf8(data) {
            Ok(text) => self.handle_text(conn, text).await,
            Err(e) => {
                let err = GatewayError::Protocol(format!("binary frame is not UTF-8: {e}"));
                self.reject(conn, &err, None).await;
            }
        }
    }

    async fn reject(&self, conn: ConnectionId, err: &GatewayError, message_id: Option<String>) {
        log::debug!("Rejected message from {conn}: {err}");
        let mut reply = Reply::default();
        reply.send(conn, ServerMessage::error(err, message_id));
        self.deliver(reply.deliveries).await;
    }

    async fn dispatch(&self, conn: ConnectionId, frame: InboundFrame) -> Result<(), GatewayError> {
        let tag = frame
            .kind
            .clone()
            .ok_or_else(|| GatewayError::Protocol("missing message type".into()))?;
        let kind = MessageKind::from_wire(&tag);
        if kind == Some(MessageKind::Auth) {
            return self.handle_auth(conn, frame).await;
        }

        let mut state = self.state.lock().await;
        let identity = state
            .clients
            .get(&conn)
            .and_then(|c| c.identity.clone())
            .ok_or(GatewayError::Unauthorized)?;
        if !state.limiter.check(&identity.user_id) {
            log::debug!("Rate limit exceeded by {} on {conn}", identity.user_id);
            return Err(GatewayError::RateLimited);
        }
        let kind = kind.ok_or(GatewayError::UnknownMessage(tag))?;

        let mut reply = Reply::default();
        match kind {
            MessageKind::Join => {
                drop(state);
                return self.handle_join(conn, identity, frame).await;
            }
            MessageKind::Leave => self.handle_leave(&mut state, conn, frame, &mut reply).await?,
            MessageKind::SyncRequest => {
                self.handle_sync_request(&state, conn, frame, &mut reply)
                    .await?
            }
            kind if kind.is_presence() => {
                self.handle_presence(&mut state, conn, kind, frame, &mut reply)?
            }
            kind if kind.is_mutation() => {
                self.handle_mutation(&mut state, conn, &identity, kind, frame, &mut reply)
                    .await?
            }
            kind => return Err(GatewayError::UnknownMessage(kind.as_str().to_string())),
        }

        self.deliver(reply.deliveries).await;
        drop(state);
        self.publish(reply.publication).await;
        Ok(())
    }

    async fn handle_auth(&self, conn: ConnectionId, frame: InboundFrame) -> Result<(), GatewayError> {
        let message_id = frame.id.clone();
        let body = self
            .validator
            .validate(MessageKind::Auth, &Value::Object(frame.body))
            .map_err(|e| AuthError(e.0))?;
        let request: AuthRequest = decode_body(body).map_err(|e| AuthError(e.0))?;
        let user = self.verifier.verify(&request.token).await?;

        let mut state = self.state.lock().await;
        let Some(client) = state.clients.get(&conn) else {
            log::debug!("{conn} closed during authentication");
            return Ok(());
        };

        let mut reply = Reply::default();
        if let Some(previous) = client.room.clone() {
            self.depart(&mut state, conn, &previous, &mut reply).await;
        }
        state.presence.register(conn, &user.user_id, &user.username);
        if let Some(client) = state.clients.get_mut(&conn) {
            client.identity = Some(user.clone());
        }

        reply.send(
            conn,
            ServerMessage::Ack(Ack {
                original_message_id: message_id,
                success: true,
                version: None,
                server_id: Some(self.server_id.clone()),
            }),
        );
        self.deliver(reply.deliveries).await;
        log::info!("{conn} authenticated as {} ({})", user.user_id, user.username);
        Ok(())
    }

    async fn handle_join(
        &self,
        conn: ConnectionId,
        identity: VerifiedUser,
        frame: InboundFrame,
    ) -> Result<(), GatewayError> {
        let message_id = frame.id.clone();
        let body = self
            .validator
            .validate(MessageKind::Join, &Value::Object(frame.body))?;
        let request: JoinRequest = decode_body(body)?;
        let canvas_id = request.canvas_id;

        let decision = self.authorizer.check(&identity.user_id, &canvas_id).await;
        if !decision.allowed {
            let reason = decision
                .reason
                .unwrap_or_else(|| format!("no access to canvas {canvas_id}"));
            log::info!(
                "Access to canvas {canvas_id} denied for {}: {reason}",
                identity.user_id
            );
            return Err(GatewayError::AccessDenied(reason));
        }

        let mut state = self.state.lock().await;
        let Some(client) = state.clients.get(&conn) else {
            log::debug!("{conn} closed while joining {canvas_id}");
            return Ok(());
        };
        let same_user = client
            .identity
            .as_ref()
            .is_some_and(|u| u.user_id == identity.user_id);
        if !same_user {
            return Err(GatewayError::AccessDenied(
                "identity changed while joining".into(),
            ));
        }

        let mut reply = Reply::default();
        if let Some(previous) = client.room.clone() {
            self.depart(&mut state, conn, &previous, &mut reply).await;
        }

        state
            .rooms
            .get_or_create(&canvas_id)
            .add(conn, identity.user_id.clone());
        if let Some(client) = state.clients.get_mut(&conn) {
            client.room = Some(canvas_id.clone());
        }

        let join = self
            .sync
            .create_session(
                &identity.user_id,
                &canvas_id,
                conn,
                request.last_version,
                request.last_vector_clock,
            )
            .await;
        let version = match &join.delta {
            Some(delta) => delta.current_version(),
            None => self.sync.get_version(&canvas_id).await,
        };

        // Missed operations first, then the ack.
        if let Some(delta) = join.delta {
            reply.send(conn, delta_message(&canvas_id, delta));
        }
        reply.send(
            conn,
            ServerMessage::versioned_ack(message_id, version, &self.server_id),
        );

        let others = state
            .rooms
            .get(&canvas_id)
            .map(|room| room.others(conn))
            .unwrap_or_default();
        if let Some(entry) = state.presence.get(conn).cloned() {
            reply.broadcast(
                others.clone(),
                ServerMessage::PresenceJoin(PresenceJoinFrame {
                    canvas_id: canvas_id.clone(),
                    user: entry,
                }),
            );
        }
        let users = state.presence.entries_of(others.iter());
        reply.send(
            conn,
            ServerMessage::PresenceUpdate(PresenceUpdateFrame {
                canvas_id: canvas_id.clone(),
                users,
            }),
        );

        self.deliver(reply.deliveries).await;
        log::info!(
            "User {} joined canvas {canvas_id} at version {version} ({conn})",
            identity.user_id
        );
        Ok(())
    }

    async fn handle_leave(
        &self,
        state: &mut GatewayState,
        conn: ConnectionId,
        frame: InboundFrame,
        reply: &mut Reply,
    ) -> Result<(), GatewayError> {
        let message_id = frame.id.clone();
        let body = self
            .validator
            .validate(MessageKind::Leave, &Value::Object(frame.body))?;
        let request: LeaveRequest = decode_body(body)?;

        if joined_room(state, conn).as_deref() != Some(request.canvas_id.as_str()) {
            return Err(GatewayError::NotInRoom(request.canvas_id));
        }
        self.depart(state, conn, &request.canvas_id, reply).await;
        reply.send(conn, ServerMessage::ack(message_id));
        Ok(())
    }

    async fn handle_sync_request(
        &self,
        state: &GatewayState,
        conn: ConnectionId,
        frame: InboundFrame,
        reply: &mut Reply,
    ) -> Result<(), GatewayError> {
        let canvas_id = match (joined_room(state, conn), frame.canvas_id()) {
            (Some(joined), None) => joined,
            (Some(joined), Some(requested)) if joined == requested => joined,
            (_, requested) => return Err(not_in_room(requested)),
        };
        let body = self
            .validator
            .validate(MessageKind::SyncRequest, &Value::Object(frame.body))?;
        let request: SyncRequest = decode_body(body)?;

        let delta = self.sync.get_delta(&canvas_id, request.from_version).await;
        log::debug!(
            "Explicit resync of {conn} on {canvas_id} from {}: {} ops{}",
            request.from_version,
            delta.operations().len(),
            if delta.is_resync_required() { " [resync required]" } else { "" }
        );
        reply.send(conn, delta_message(&canvas_id, delta));
        Ok(())
    }

    /// Cursor and selection updates. Messages for another canvas are
    /// dropped silently.
    fn handle_presence(
        &self,
        state: &mut GatewayState,
        conn: ConnectionId,
        kind: MessageKind,
        frame: InboundFrame,
        reply: &mut Reply,
    ) -> Result<(), GatewayError> {
        let Some(canvas_id) = joined_room(state, conn) else {
            return Ok(());
        };
        if frame.canvas_id() != Some(canvas_id.as_str()) {
            log::trace!("Dropping {} for foreign canvas from {conn}", kind.as_str());
            return Ok(());
        }

        let sanitized = self.validator.validate(kind, &Value::Object(frame.body))?;
        let entry = match kind {
            MessageKind::CursorMove => {
                let request: CursorMoveRequest = decode_body(sanitized.clone())?;
                state.presence.update_cursor(conn, request.position).cloned()
            }
            _ => {
                let request: SelectionChangeRequest = decode_body(sanitized.clone())?;
                state
                    .presence
                    .update_selection(conn, request.selected_ids)
                    .cloned()
            }
        };
        let (Some(entry), Value::Object(mut relay)) = (entry, sanitized) else {
            return Ok(());
        };

        relay.remove("id");
        relay.insert("userId".to_string(), Value::from(entry.user_id));
        relay.insert("username".to_string(), Value::from(entry.username));
        relay.insert("color".to_string(), Value::from(entry.color));

        let others = state
            .rooms
            .get(&canvas_id)
            .map(|room| room.others(conn))
            .unwrap_or_default();
        reply.broadcast(others, Outbound::Relay(relay));
        Ok(())
    }

    async fn handle_mutation(
        &self,
        state: &mut GatewayState,
        conn: ConnectionId,
        identity: &VerifiedUser,
        kind: MessageKind,
        frame: InboundFrame,
        reply: &mut Reply,
    ) -> Result<(), GatewayError> {
        let Some((op_type, target_type)) = kind.operation() else {
            return Err(GatewayError::UnknownMessage(kind.as_str().to_string()));
        };
        let message_id = frame.id.clone();

        // A missing canvasId is left for the validator to report.
        let canvas_id = match (joined_room(state, conn), frame.canvas_id()) {
            (Some(joined), None) => joined,
            (Some(joined), Some(requested)) if joined == requested => joined,
            (_, requested) => return Err(not_in_room(requested)),
        };

        let sanitized = self.validator.validate(kind, &Value::Object(frame.body))?;
        let Value::Object(mut fields) = sanitized else {
            return Err(ValidationError("message must be an object".into()).into());
        };
        let target_id = match target_type {
            TargetType::Widget => widget_id(&fields)
                .map(str::to_string)
                .ok_or_else(|| ValidationError("widgetId or widget.id is required".into()))?,
            TargetType::Canvas => canvas_id.clone(),
        };

        fields.remove("id");
        let mut payload = fields.clone();
        payload.remove("type");
        payload.remove("canvasId");

        let operation = self
            .sync
            .record_operation(
                &canvas_id,
                op_type,
                &target_id,
                target_type,
                Value::Object(payload),
                &identity.user_id,
            )
            .await;

        let relay = Outbound::Relay(relay_operation(
            fields,
            &operation,
            &identity.user_id,
            &self.server_id,
        ));
        match relay.encode() {
            Ok(data) => {
                reply.publication = Some(Publication {
                    channel: canvas_channel(&self.config.channel_prefix, &canvas_id),
                    data,
                })
            }
            Err(e) => log::error!("Failed to encode fanout frame for {canvas_id}: {e}"),
        }

        let others = state
            .rooms
            .get(&canvas_id)
            .map(|room| room.others(conn))
            .unwrap_or_default();
        reply.broadcast(others, relay);
        reply.send(
            conn,
            ServerMessage::versioned_ack(message_id, operation.version, &self.server_id),
        );

        log::debug!(
            "{} on {canvas_id}/{target_id} by {} → v{}",
            kind.as_str(),
            identity.user_id,
            operation.version
        );
        Ok(())
    }

    /// Leave the joined room: presence:leave to the rest, empty room
    /// removed, session dropped.
    pub(super) async fn depart(
        &self,
        state: &mut GatewayState,
        conn: ConnectionId,
        canvas_id: &str,
        reply: &mut Reply,
    ) {
        if let Some(client) = state.clients.get_mut(&conn) {
            client.room = None;
        }
        if let Some(entry) = state.presence.get_mut(conn) {
            entry.clear_activity();
        }
        if let Some(departure) = state.rooms.leave(canvas_id, conn) {
            // Another tab of the same user keeps them present.
            if !departure.user_still_present {
                reply.broadcast(
                    departure.remaining,
                    ServerMessage::PresenceLeave(PresenceLeaveFrame {
                        canvas_id: canvas_id.to_string(),
                        user_id: departure.user_id.clone(),
                    }),
                );
            }
            log::info!("User {} left canvas {canvas_id} ({conn})", departure.user_id);
        }
        self.sync.remove_session(conn).await;
    }

    /// Encode each frame once and queue it to its recipients.
    pub(super) async fn deliver(&self, deliveries: Vec<Delivery>) {
        for Delivery { recipients, frame } in deliveries {
            let encoded: Arc<str> = match frame.encode() {
                Ok(text) => Arc::from(text),
                Err(e) => {
                    log::error!("Failed to encode outbound frame: {e}");
                    continue;
                }
            };
            self.connections.send_many(recipients.iter(), encoded).await;
        }
    }

    /// Fanout failures are logged and swallowed: local delivery already
    /// happened.
    async fn publish(&self, publication: Option<Publication>) {
        let Some(Publication { channel, data }) = publication else {
            return;
        };
        if let Err(e) = self
            .pubsub
            .publish(&channel, data, &self.server_id)
            .await
        {
            log::error!("Fanout publish on {channel} failed: {e}");
        }
    }
}
