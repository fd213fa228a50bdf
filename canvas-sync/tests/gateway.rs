//! Gateway behavior without sockets.
//!
//! Each test drives `Gateway::handle_text` directly and inspects the
//! `Outgoing` queue of every connection. Frames produced by one message are
//! queued before `handle_text` returns, so `try_recv` is deterministic.

use canvas_sync::auth::{AccessAuthorizer, AccessDecision, TokenVerifier};
use canvas_sync::{
    AuthError, ConnectionId, Gateway, GatewayConfig, GatewayOptions, MemoryBroker, Outgoing,
    PubSubAdapter, StaticTokenVerifier, TransportError, VerifiedUser,
};
use canvas_sync::pubsub::MessageHandler;
use futures_util::future::BoxFuture;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::Notify;
use tokio::time::timeout;

// ───────────────────────────────────────────────────────────────────
// Harness
// ───────────────────────────────────────────────────────────────────

fn verifier() -> StaticTokenVerifier {
    StaticTokenVerifier::new()
        .with_token("t-alice", VerifiedUser::new("u-alice", "Alice"))
        .with_token("t-bob", VerifiedUser::new("u-bob", "Bob"))
        .with_token("t-carol", VerifiedUser::new("u-carol", "Carol"))
}

fn options() -> GatewayOptions {
    GatewayOptions::new(Arc::new(verifier())).with_server_id("s1")
}

fn gateway() -> Gateway {
    Gateway::new(options())
}

struct Client {
    conn: ConnectionId,
    rx: UnboundedReceiver<Outgoing>,
}

impl Client {
    async fn connect(gateway: &Gateway) -> Self {
        let (conn, rx) = gateway.connect().await;
        Self { conn, rx }
    }

    async fn send(&self, gateway: &Gateway, message: Value) {
        gateway.handle_text(self.conn, &message.to_string()).await;
    }

    /// Next queued JSON frame, skipping pings.
    fn next(&mut self) -> Value {
        loop {
            match self.rx.try_recv() {
                Ok(Outgoing::Frame(frame)) => return serde_json::from_str(&frame).unwrap(),
                Ok(Outgoing::Ping) => continue,
                other => panic!("expected a frame, got {other:?}"),
            }
        }
    }

    fn drain(&mut self) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(item) = self.rx.try_recv() {
            if let Outgoing::Frame(frame) = item {
                frames.push(serde_json::from_str(&frame).unwrap());
            }
        }
        frames
    }

    fn assert_silent(&mut self) {
        let frames = self.drain();
        assert!(frames.is_empty(), "unexpected frames: {frames:?}");
    }

    async fn auth(gateway: &Gateway, token: &str) -> Self {
        let mut client = Self::connect(gateway).await;
        client.send(gateway, json!({ "type": "auth", "token": token })).await;
        let ack = client.next();
        assert_eq!(ack["type"], "ack", "auth failed: {ack}");
        client
    }

    async fn join(&mut self, gateway: &Gateway, canvas_id: &str) -> Vec<Value> {
        self.send(gateway, json!({ "type": "join", "id": "j", "canvasId": canvas_id }))
            .await;
        self.drain()
    }
}

fn widget_create(canvas_id: &str, widget_id: &str) -> Value {
    json!({
        "type": "widget:create",
        "id": format!("create-{widget_id}"),
        "canvasId": canvas_id,
        "widget": { "id": widget_id, "kind": "sticky", "x": 10, "y": 20 }
    })
}

fn assert_error(frame: &Value, code: &str) {
    assert_eq!(frame["type"], "error", "expected error frame, got {frame}");
    assert_eq!(frame["code"], code, "unexpected error: {frame}");
}

// ───────────────────────────────────────────────────────────────────
// Authentication and envelope errors
// ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_messages_before_auth_are_unauthorized() {
    let gw = gateway();
    let mut client = Client::connect(&gw).await;

    for message in [
        json!({ "type": "join", "id": "m1", "canvasId": "c1" }),
        widget_create("c1", "w1"),
        json!({ "type": "sync:request", "fromVersion": 0 }),
        json!({ "type": "no:such:type" }),
    ] {
        client.send(&gw, message.clone()).await;
        let frame = client.next();
        assert_error(&frame, "UNAUTHORIZED");
        if let Some(id) = message.get("id") {
            assert_eq!(&frame["originalMessageId"], id);
        }
    }
    assert_eq!(gw.sync().get_version("c1").await, 0);
}

#[tokio::test]
async fn test_auth_failure_keeps_connection_unauthenticated() {
    let gw = gateway();
    let mut client = Client::connect(&gw).await;

    client
        .send(&gw, json!({ "type": "auth", "id": "a1", "token": "forged" }))
        .await;
    let frame = client.next();
    assert_error(&frame, "AUTH_FAILED");
    assert_eq!(frame["originalMessageId"], "a1");

    client.send(&gw, json!({ "type": "auth" })).await;
    assert_error(&client.next(), "AUTH_FAILED");

    client.send(&gw, json!({ "type": "join", "canvasId": "c1" })).await;
    assert_error(&client.next(), "UNAUTHORIZED");
}

#[tokio::test]
async fn test_auth_ack_carries_server_id() {
    let gw = gateway();
    let mut client = Client::connect(&gw).await;
    client
        .send(&gw, json!({ "type": "auth", "id": "a1", "token": "t-alice" }))
        .await;
    let ack = client.next();
    assert_eq!(ack["type"], "ack");
    assert_eq!(ack["success"], true);
    assert_eq!(ack["serverId"], "s1");
    assert_eq!(ack["originalMessageId"], "a1");
    assert!(ack["timestamp"].as_u64().is_some());
}

#[tokio::test]
async fn test_malformed_and_unknown_messages() {
    let gw = gateway();
    let mut client = Client::auth(&gw, "t-alice").await;

    gw.handle_text(client.conn, "{not json").await;
    assert_error(&client.next(), "PARSE_ERROR");

    client.send(&gw, json!({ "id": "x" })).await;
    let frame = client.next();
    assert_error(&frame, "PARSE_ERROR");
    assert_eq!(frame["originalMessageId"], "x");

    client
        .send(&gw, json!({ "type": "widget:explode", "id": "u1" }))
        .await;
    let frame = client.next();
    assert_error(&frame, "UNKNOWN_MESSAGE");
    assert_eq!(frame["originalMessageId"], "u1");
}

#[tokio::test]
async fn test_binary_frames_must_be_utf8() {
    let gw = gateway();
    let mut client = Client::connect(&gw).await;

    gw.handle_binary(client.conn, &[0x7b, 0xff, 0xfe, 0x7d]).await;
    assert_error(&client.next(), "PARSE_ERROR");

    let auth = json!({ "type": "auth", "token": "t-alice" }).to_string();
    gw.handle_binary(client.conn, auth.as_bytes()).await;
    assert_eq!(client.next()["type"], "ack");
}

// ───────────────────────────────────────────────────────────────────
// Rooms, operations, delta sync
// ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_fresh_join_has_no_delta() {
    let gw = gateway();
    let mut alice = Client::auth(&gw, "t-alice").await;

    let frames = alice.join(&gw, "c1").await;
    assert_eq!(frames.len(), 2, "{frames:?}");
    assert_eq!(frames[0]["type"], "ack");
    assert_eq!(frames[0]["version"], 0);
    assert_eq!(frames[0]["originalMessageId"], "j");
    assert_eq!(frames[1]["type"], "presence:update");
    assert!(frames[1]["users"].as_array().unwrap().is_empty());
    assert!(frames.iter().all(|f| f["type"] != "sync:delta"));
}

#[tokio::test]
async fn test_join_announces_presence_both_ways() {
    let gw = gateway();
    let mut alice = Client::auth(&gw, "t-alice").await;
    alice.join(&gw, "c1").await;

    let mut bob = Client::auth(&gw, "t-bob").await;
    let frames = bob.join(&gw, "c1").await;
    assert_eq!(frames[0]["type"], "ack");
    assert_eq!(frames[1]["type"], "presence:update");
    let users = frames[1]["users"].as_array().unwrap();
    assert_eq!(users.len(), 1);
    assert_eq!(users[0]["userId"], "u-alice");
    assert_eq!(users[0]["username"], "Alice");

    let joined = alice.next();
    assert_eq!(joined["type"], "presence:join");
    assert_eq!(joined["canvasId"], "c1");
    assert_eq!(joined["userId"], "u-bob");
    assert!(joined["color"].as_str().unwrap().starts_with('#'));
    alice.assert_silent();
}

#[tokio::test]
async fn test_reconnect_scenario_delivers_missed_operation_before_ack() {
    let gw = gateway();

    // A joins c1 at version 0, B joins c1.
    let mut alice = Client::auth(&gw, "t-alice").await;
    alice.join(&gw, "c1").await;
    let mut bob = Client::auth(&gw, "t-bob").await;
    bob.join(&gw, "c1").await;
    alice.drain();

    // A creates w1: version 1.
    alice.send(&gw, widget_create("c1", "w1")).await;
    let relayed = bob.next();
    assert_eq!(relayed["type"], "widget:create");
    assert_eq!(relayed["version"], 1);
    assert_eq!(relayed["userId"], "u-alice");
    assert_eq!(relayed["widget"]["id"], "w1");
    bob.assert_silent();

    let ack = alice.next();
    assert_eq!(ack["type"], "ack");
    assert_eq!(ack["version"], 1);
    assert_eq!(ack["originalMessageId"], "create-w1");
    alice.assert_silent();

    // A drops; B moves w1: version 2.
    gw.disconnect(alice.conn).await;
    let left = bob.next();
    assert_eq!(left["type"], "presence:leave");
    assert_eq!(left["userId"], "u-alice");

    bob.send(
        &gw,
        json!({
            "type": "widget:move",
            "canvasId": "c1",
            "widgetId": "w1",
            "position": { "x": 50, "y": 60 }
        }),
    )
    .await;
    assert_eq!(bob.next()["version"], 2);

    // A reconnects with lastVersion 1.
    let mut alice = Client::auth(&gw, "t-alice").await;
    alice
        .send(
            &gw,
            json!({ "type": "join", "id": "rejoin", "canvasId": "c1", "lastVersion": 1 }),
        )
        .await;

    let delta = alice.next();
    assert_eq!(delta["type"], "sync:delta");
    assert_eq!(delta["canvasId"], "c1");
    assert_eq!(delta["currentVersion"], 2);
    assert_eq!(delta["resyncRequired"], false);
    let operations = delta["operations"].as_array().unwrap();
    assert_eq!(operations.len(), 1);
    assert_eq!(operations[0]["version"], 2);
    assert_eq!(operations[0]["type"], "move");
    assert_eq!(operations[0]["targetId"], "w1");
    assert_eq!(operations[0]["actorId"], "u-bob");

    let ack = alice.next();
    assert_eq!(ack["type"], "ack");
    assert_eq!(ack["originalMessageId"], "rejoin");
    assert_eq!(ack["version"], 2);

    let presence = alice.next();
    assert_eq!(presence["type"], "presence:update");
    alice.assert_silent();
}

#[tokio::test]
async fn test_reconnect_with_current_version_gets_empty_delta() {
    let gw = gateway();
    let mut alice = Client::auth(&gw, "t-alice").await;
    alice
        .send(&gw, json!({ "type": "join", "canvasId": "c1", "lastVersion": 0 }))
        .await;
    let delta = alice.next();
    assert_eq!(delta["type"], "sync:delta");
    assert!(delta["operations"].as_array().unwrap().is_empty());
    assert_eq!(alice.next()["type"], "ack");
}

#[tokio::test]
async fn test_broadcast_reaches_each_member_once_without_echo() {
    let gw = gateway();
    let mut alice = Client::auth(&gw, "t-alice").await;
    let mut bob = Client::auth(&gw, "t-bob").await;
    let mut carol = Client::auth(&gw, "t-carol").await;
    for client in [&mut alice, &mut bob, &mut carol] {
        client.join(&gw, "c1").await;
    }
    alice.drain();
    bob.drain();

    alice.send(&gw, widget_create("c1", "w1")).await;

    for other in [&mut bob, &mut carol] {
        let frames = other.drain();
        assert_eq!(frames.len(), 1, "{frames:?}");
        assert_eq!(frames[0]["type"], "widget:create");
        assert_eq!(frames[0]["serverId"], "s1");
        assert_eq!(frames[0]["vectorClock"]["s1"], 1);
    }
    let own = alice.drain();
    assert_eq!(own.len(), 1);
    assert_eq!(own[0]["type"], "ack");
}

#[tokio::test]
async fn test_versions_are_gapless_per_canvas() {
    let gw = gateway();
    let mut alice = Client::auth(&gw, "t-alice").await;
    alice.join(&gw, "c1").await;

    for (i, widget) in ["w1", "w2", "w3"].into_iter().enumerate() {
        alice.send(&gw, widget_create("c1", widget)).await;
        assert_eq!(alice.next()["version"], i as u64 + 1);
    }
    alice
        .send(
            &gw,
            json!({ "type": "canvas:update", "canvasId": "c1", "background": "#fff" }),
        )
        .await;
    assert_eq!(alice.next()["version"], 4);
    assert_eq!(gw.sync().get_version("c1").await, 4);
    assert_eq!(gw.sync().get_version("c2").await, 0);
}

#[tokio::test]
async fn test_client_cannot_forge_authorship_or_version() {
    let gw = gateway();
    let mut alice = Client::auth(&gw, "t-alice").await;
    alice.join(&gw, "c1").await;
    let mut bob = Client::auth(&gw, "t-bob").await;
    bob.join(&gw, "c1").await;
    alice.drain();

    alice
        .send(
            &gw,
            json!({
                "type": "widget:update",
                "canvasId": "c1",
                "widgetId": "w1",
                "version": 99,
                "userId": "u-mallory",
                "createdBy": "u-mallory",
                "changes": { "text": "hi" }
            }),
        )
        .await;

    let relayed = bob.next();
    assert_eq!(relayed["version"], 1);
    assert_eq!(relayed["userId"], "u-alice");
    assert!(relayed.get("createdBy").is_none());
    assert_eq!(relayed["changes"]["text"], "hi");

    let canvas_sync::DeltaResult::Delta { operations, .. } = gw.sync().get_delta("c1", 0).await
    else {
        panic!("expected a delta");
    };
    assert_eq!(operations[0].actor_id, "u-alice");
    assert!(operations[0].payload.get("userId").is_none());
}

#[tokio::test]
async fn test_validation_error_touches_nothing() {
    let gw = gateway();
    let mut alice = Client::auth(&gw, "t-alice").await;
    alice.join(&gw, "c1").await;
    let mut bob = Client::auth(&gw, "t-bob").await;
    bob.join(&gw, "c1").await;
    alice.drain();

    alice
        .send(
            &gw,
            json!({ "type": "widget:create", "id": "bad", "canvasId": "c1", "widget": "nope" }),
        )
        .await;
    let frame = alice.next();
    assert_error(&frame, "VALIDATION_ERROR");
    assert_eq!(frame["originalMessageId"], "bad");

    alice
        .send(&gw, json!({ "type": "widget:delete", "canvasId": "c1" }))
        .await;
    assert_error(&alice.next(), "VALIDATION_ERROR");

    bob.assert_silent();
    assert_eq!(gw.sync().get_version("c1").await, 0);
}

#[tokio::test]
async fn test_mutations_outside_the_joined_room() {
    let gw = gateway();
    let mut alice = Client::auth(&gw, "t-alice").await;

    alice.send(&gw, widget_create("c1", "w1")).await;
    assert_error(&alice.next(), "NOT_IN_ROOM");

    alice.join(&gw, "c1").await;
    alice.send(&gw, widget_create("c2", "w1")).await;
    assert_error(&alice.next(), "NOT_IN_ROOM");

    alice
        .send(&gw, json!({ "type": "sync:request", "fromVersion": 0, "canvasId": "c2" }))
        .await;
    assert_error(&alice.next(), "NOT_IN_ROOM");

    assert_eq!(gw.sync().get_version("c2").await, 0);
}

struct DenySecret;

impl AccessAuthorizer for DenySecret {
    fn check<'a>(&'a self, _user_id: &'a str, canvas_id: &'a str) -> BoxFuture<'a, AccessDecision> {
        Box::pin(async move {
            if canvas_id == "secret" {
                AccessDecision::deny("canvas is private")
            } else {
                AccessDecision::allow()
            }
        })
    }
}

#[tokio::test]
async fn test_access_denied_leaves_state_unchanged() {
    let gw = Gateway::new(options().with_authorizer(Arc::new(DenySecret)));
    let mut alice = Client::auth(&gw, "t-alice").await;
    alice.join(&gw, "c1").await;

    alice
        .send(&gw, json!({ "type": "join", "id": "j2", "canvasId": "secret" }))
        .await;
    let frame = alice.next();
    assert_error(&frame, "ACCESS_DENIED");
    assert!(frame["message"].as_str().unwrap().contains("canvas is private"));
    assert_eq!(frame["originalMessageId"], "j2");

    // Still in c1.
    assert!(gw.room_info("secret").await.is_none());
    assert_eq!(gw.room_info("c1").await.unwrap().user_count, 1);
    alice.send(&gw, widget_create("c1", "w1")).await;
    assert_eq!(alice.next()["version"], 1);
}

#[tokio::test]
async fn test_joining_another_canvas_leaves_the_first() {
    let gw = gateway();
    let mut alice = Client::auth(&gw, "t-alice").await;
    alice.join(&gw, "c1").await;
    let mut bob = Client::auth(&gw, "t-bob").await;
    bob.join(&gw, "c1").await;
    bob.drain();

    bob.join(&gw, "c2").await;
    assert_eq!(alice.drain().last().unwrap()["type"], "presence:leave");

    let c1 = gw.room_info("c1").await.unwrap();
    assert_eq!(c1.users, vec!["u-alice".to_string()]);
    let c2 = gw.room_info("c2").await.unwrap();
    assert_eq!(c2.users, vec!["u-bob".to_string()]);

    let session = gw.sync().session(bob.conn).await.unwrap();
    assert_eq!(session.canvas_id, "c2");
}

#[tokio::test]
async fn test_leave_acks_and_deletes_empty_room() {
    let gw = gateway();
    let mut alice = Client::auth(&gw, "t-alice").await;
    alice.join(&gw, "c1").await;
    let mut bob = Client::auth(&gw, "t-bob").await;
    bob.join(&gw, "c1").await;
    alice.drain();

    bob.send(&gw, json!({ "type": "leave", "id": "l1", "canvasId": "c2" }))
        .await;
    assert_error(&bob.next(), "NOT_IN_ROOM");

    bob.send(&gw, json!({ "type": "leave", "id": "l2", "canvasId": "c1" }))
        .await;
    let ack = bob.next();
    assert_eq!(ack["type"], "ack");
    assert_eq!(ack["originalMessageId"], "l2");
    assert_eq!(alice.next()["type"], "presence:leave");
    assert!(gw.sync().session(bob.conn).await.is_none());

    // Back to AUTHENTICATED: room-scoped messages are refused.
    bob.send(&gw, widget_create("c1", "w1")).await;
    assert_error(&bob.next(), "NOT_IN_ROOM");

    alice.send(&gw, json!({ "type": "leave", "canvasId": "c1" })).await;
    assert!(gw.room_info("c1").await.is_none());
    assert!(gw.all_rooms_info().await.is_empty());
}

#[tokio::test]
async fn test_disconnecting_last_member_deletes_room() {
    let gw = gateway();
    let mut alice = Client::auth(&gw, "t-alice").await;
    alice.join(&gw, "c1").await;
    assert_eq!(gw.room_info("c1").await.unwrap().user_count, 1);

    gw.disconnect(alice.conn).await;
    gw.disconnect(alice.conn).await;

    assert!(gw.room_info("c1").await.is_none());
    let stats = gw.stats().await;
    assert_eq!(stats.connections, 0);
    assert_eq!(stats.rooms, 0);
    assert_eq!(stats.sync_stats.total_sessions, 0);
}

#[tokio::test]
async fn test_second_tab_of_same_user_keeps_presence() {
    let gw = gateway();
    let mut tab1 = Client::auth(&gw, "t-alice").await;
    tab1.join(&gw, "c1").await;
    let mut tab2 = Client::auth(&gw, "t-alice").await;
    tab2.join(&gw, "c1").await;
    let mut bob = Client::auth(&gw, "t-bob").await;
    bob.join(&gw, "c1").await;

    let info = gw.room_info("c1").await.unwrap();
    assert_eq!(info.user_count, 2);
    assert_eq!(info.connections, 3);

    bob.drain();
    gw.disconnect(tab1.conn).await;
    bob.assert_silent();

    // Edits from one tab reach the other.
    tab2.drain();
    bob.send(&gw, widget_create("c1", "w1")).await;
    assert_eq!(tab2.next()["type"], "widget:create");
}

#[tokio::test]
async fn test_sync_request_and_resync_required() {
    let mut config = GatewayConfig::default();
    config.sync.max_operations = 2;
    let gw = Gateway::new(options().with_config(config));

    let mut alice = Client::auth(&gw, "t-alice").await;
    alice.join(&gw, "c1").await;
    for widget in ["w1", "w2", "w3"] {
        alice.send(&gw, widget_create("c1", widget)).await;
    }
    alice.drain();

    alice
        .send(&gw, json!({ "type": "sync:request", "fromVersion": 1 }))
        .await;
    let delta = alice.next();
    assert_eq!(delta["type"], "sync:delta");
    assert_eq!(delta["resyncRequired"], false);
    let versions: Vec<u64> = delta["operations"]
        .as_array()
        .unwrap()
        .iter()
        .map(|op| op["version"].as_u64().unwrap())
        .collect();
    assert_eq!(versions, vec![2, 3]);
    alice.assert_silent();

    alice
        .send(&gw, json!({ "type": "sync:request", "fromVersion": 0 }))
        .await;
    let resync = alice.next();
    assert_eq!(resync["type"], "sync:delta");
    assert_eq!(resync["resyncRequired"], true);
    assert_eq!(resync["currentVersion"], 3);
    assert!(resync["operations"].as_array().unwrap().is_empty());

    alice
        .send(&gw, json!({ "type": "sync:request", "fromVersion": "x" }))
        .await;
    assert_error(&alice.next(), "VALIDATION_ERROR");

    // The explicit resync path leaves the session alone.
    assert_eq!(gw.sync().session(alice.conn).await.unwrap().canvas_id, "c1");
}

// ───────────────────────────────────────────────────────────────────
// Presence
// ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_cursor_and_selection_relay() {
    let gw = gateway();
    let mut alice = Client::auth(&gw, "t-alice").await;
    alice.join(&gw, "c1").await;
    let mut bob = Client::auth(&gw, "t-bob").await;
    bob.join(&gw, "c1").await;
    alice.drain();

    alice
        .send(
            &gw,
            json!({ "type": "cursor:move", "canvasId": "c1", "position": { "x": 1.5, "y": 2.5 } }),
        )
        .await;
    let cursor = bob.next();
    assert_eq!(cursor["type"], "cursor:move");
    assert_eq!(cursor["userId"], "u-alice");
    assert_eq!(cursor["position"]["x"], 1.5);
    alice.assert_silent();

    alice
        .send(
            &gw,
            json!({ "type": "selection:change", "canvasId": "c1", "selectedIds": ["w1"] }),
        )
        .await;
    assert_eq!(bob.next()["selectedIds"][0], "w1");

    let presence = gw.presence("c1").await;
    let entry = presence.iter().find(|p| p.user_id == "u-alice").unwrap();
    assert_eq!(entry.selected_ids, vec!["w1".to_string()]);
    assert!(entry.cursor.is_some());

    // Presence never touches the log.
    assert_eq!(gw.sync().get_version("c1").await, 0);
}

#[tokio::test]
async fn test_presence_for_other_canvas_is_silently_ignored() {
    let gw = gateway();
    let mut alice = Client::auth(&gw, "t-alice").await;
    alice.join(&gw, "c1").await;
    let mut bob = Client::auth(&gw, "t-bob").await;
    bob.join(&gw, "c1").await;
    alice.drain();

    alice
        .send(
            &gw,
            json!({ "type": "cursor:move", "canvasId": "c2", "position": { "x": 1, "y": 2 } }),
        )
        .await;
    alice.assert_silent();
    bob.assert_silent();

    alice
        .send(
            &gw,
            json!({ "type": "cursor:move", "canvasId": "c1", "position": { "x": "left" } }),
        )
        .await;
    assert_error(&alice.next(), "VALIDATION_ERROR");
    bob.assert_silent();
}

// ───────────────────────────────────────────────────────────────────
// Rate limiting and heartbeat
// ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_rate_limit_rejects_message_past_the_window_max() {
    let config = GatewayConfig {
        rate_limit_max: 3,
        rate_limit_window: Duration::from_secs(60),
        ..GatewayConfig::default()
    };
    let gw = Gateway::new(options().with_config(config));
    let mut alice = Client::auth(&gw, "t-alice").await;

    alice.join(&gw, "c1").await; // 1
    alice.send(&gw, widget_create("c1", "w1")).await; // 2
    alice.send(&gw, widget_create("c1", "w2")).await; // 3
    assert_eq!(alice.drain().last().unwrap()["version"], 2);

    alice.send(&gw, widget_create("c1", "w3")).await; // 4
    let frame = alice.next();
    assert_error(&frame, "RATE_LIMITED");
    assert_eq!(frame["originalMessageId"], "create-w3");
    assert_eq!(gw.sync().get_version("c1").await, 2);

    // The limit is per user.
    let mut bob = Client::auth(&gw, "t-bob").await;
    let frames = bob.join(&gw, "c1").await;
    assert_eq!(frames[0]["type"], "ack");
}

#[tokio::test]
async fn test_reconnecting_does_not_reset_rate_limit() {
    let config = GatewayConfig {
        rate_limit_max: 2,
        rate_limit_window: Duration::from_secs(60),
        ..GatewayConfig::default()
    };
    let gw = Gateway::new(options().with_config(config));

    let mut alice = Client::auth(&gw, "t-alice").await;
    alice.join(&gw, "c1").await; // 1
    alice.send(&gw, widget_create("c1", "w1")).await; // 2
    assert_eq!(alice.next()["version"], 1);
    gw.disconnect(alice.conn).await;

    // Same user, same window: auth is free, the next message is not.
    let mut alice = Client::auth(&gw, "t-alice").await;
    alice
        .send(&gw, json!({ "type": "join", "id": "again", "canvasId": "c1" }))
        .await;
    let frame = alice.next();
    assert_error(&frame, "RATE_LIMITED");
    assert_eq!(frame["originalMessageId"], "again");
    assert!(gw.room_info("c1").await.is_none());
}

#[tokio::test]
async fn test_heartbeat_closes_silent_connections() {
    let gw = gateway();
    let mut alice = Client::auth(&gw, "t-alice").await;
    alice.join(&gw, "c1").await;
    let mut bob = Client::auth(&gw, "t-bob").await;
    bob.join(&gw, "c1").await;
    alice.drain();

    assert_eq!(gw.heartbeat_tick().await, 0);
    assert_eq!(alice.rx.try_recv().unwrap(), Outgoing::Ping);
    assert_eq!(bob.rx.try_recv().unwrap(), Outgoing::Ping);

    gw.mark_alive(alice.conn).await;
    assert_eq!(gw.heartbeat_tick().await, 1);

    assert_eq!(bob.rx.try_recv().unwrap(), Outgoing::Close);
    let frames = alice.drain();
    assert!(frames.iter().any(|f| f["type"] == "presence:leave" && f["userId"] == "u-bob"));
    assert_eq!(gw.room_info("c1").await.unwrap().users, vec!["u-alice".to_string()]);
    assert!(gw.sync().session(bob.conn).await.is_none());
}

// ───────────────────────────────────────────────────────────────────
// Fanout
// ───────────────────────────────────────────────────────────────────

async fn next_within(client: &mut Client, wait: Duration) -> Option<Value> {
    match timeout(wait, client.rx.recv()).await {
        Ok(Some(Outgoing::Frame(frame))) => Some(serde_json::from_str(&frame).unwrap()),
        _ => None,
    }
}

#[tokio::test]
async fn test_fanout_between_gateways() {
    let broker = MemoryBroker::new(64);
    let gw1 = Arc::new(Gateway::new(
        options()
            .with_server_id("s1")
            .with_pubsub(Arc::new(broker.adapter())),
    ));
    let gw2 = Arc::new(Gateway::new(
        options()
            .with_server_id("s2")
            .with_pubsub(Arc::new(broker.adapter())),
    ));
    let _bg1 = gw1.start_background().await.unwrap();
    let _bg2 = gw2.start_background().await.unwrap();

    let mut alice = Client::auth(&gw1, "t-alice").await;
    alice.join(&gw1, "c1").await;
    let mut bob = Client::auth(&gw2, "t-bob").await;
    bob.join(&gw2, "c1").await;
    let mut carol = Client::auth(&gw2, "t-carol").await;
    carol.join(&gw2, "c2").await;
    bob.drain();

    alice.send(&gw1, widget_create("c1", "w1")).await;
    assert_eq!(alice.next()["version"], 1);

    let relayed = next_within(&mut bob, Duration::from_secs(2)).await.unwrap();
    assert_eq!(relayed["type"], "widget:create");
    assert_eq!(relayed["userId"], "u-alice");
    assert_eq!(relayed["serverId"], "s1");
    assert_eq!(relayed["version"], 1);

    // Other canvases and the origin gateway stay quiet.
    assert!(next_within(&mut carol, Duration::from_millis(100)).await.is_none());
    assert!(next_within(&mut alice, Duration::from_millis(100)).await.is_none());
    assert!(next_within(&mut bob, Duration::from_millis(100)).await.is_none());

    // Versions are per process.
    assert_eq!(gw2.sync().get_version("c1").await, 0);
}

#[tokio::test]
async fn test_fanout_echo_from_self_is_dropped() {
    let gw = gateway();
    let mut alice = Client::auth(&gw, "t-alice").await;
    alice.join(&gw, "c1").await;

    gw.handle_fanout(canvas_sync::PubSubMessage::new(
        "canvas:c1",
        json!({ "type": "widget:create", "canvasId": "c1" }).to_string(),
        "s1",
    ))
    .await;
    alice.assert_silent();

    gw.handle_fanout(canvas_sync::PubSubMessage::new(
        "canvas:c1",
        json!({ "type": "widget:create", "canvasId": "c1", "version": 7 }).to_string(),
        "s9",
    ))
    .await;
    assert_eq!(alice.next()["version"], 7);

    gw.handle_fanout(canvas_sync::PubSubMessage::new("canvas:c1", "garbage", "s9"))
        .await;
    alice.assert_silent();
}

struct BrokenPubSub;

impl PubSubAdapter for BrokenPubSub {
    fn name(&self) -> &'static str {
        "broken"
    }

    fn publish<'a>(
        &'a self,
        _channel: &'a str,
        _data: String,
        _sender_id: &'a str,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async { Err(TransportError::Closed) })
    }

    fn subscribe<'a>(
        &'a self,
        _channel: &'a str,
        _handler: MessageHandler,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async { Ok(()) })
    }

    fn pattern_subscribe<'a>(
        &'a self,
        _prefix: &'a str,
        _handler: MessageHandler,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async { Ok(()) })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async { Ok(()) })
    }
}

#[tokio::test]
async fn test_publish_failure_does_not_affect_local_delivery() {
    let gw = Gateway::new(options().with_pubsub(Arc::new(BrokenPubSub)));
    let mut alice = Client::auth(&gw, "t-alice").await;
    alice.join(&gw, "c1").await;
    let mut bob = Client::auth(&gw, "t-bob").await;
    bob.join(&gw, "c1").await;
    alice.drain();

    alice.send(&gw, widget_create("c1", "w1")).await;
    assert_eq!(bob.next()["type"], "widget:create");
    let ack = alice.next();
    assert_eq!(ack["type"], "ack");
    assert_eq!(ack["version"], 1);
    assert_eq!(gw.stats().await.pubsub_adapter, "broken");
}

// ───────────────────────────────────────────────────────────────────
// Observability
// ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_stats_and_room_info() {
    let gw = gateway();
    let mut alice = Client::auth(&gw, "t-alice").await;
    alice.join(&gw, "c1").await;
    let mut bob = Client::auth(&gw, "t-bob").await;
    bob.join(&gw, "c2").await;
    alice.send(&gw, widget_create("c1", "w1")).await;
    let _idle = Client::connect(&gw).await;

    let stats = gw.stats().await;
    assert_eq!(stats.server_id, "s1");
    assert_eq!(stats.connections, 3);
    assert_eq!(stats.rooms, 2);
    assert_eq!(stats.pubsub_adapter, "local");
    assert_eq!(stats.sync_stats.total_sessions, 2);
    assert_eq!(stats.sync_stats.unique_users, 2);
    assert_eq!(stats.sync_stats.unique_canvases, 2);

    let rooms = gw.all_rooms_info().await;
    assert_eq!(rooms.len(), 2);
    assert_eq!(rooms[0].canvas_id, "c1");
    assert_eq!(rooms[0].version, 1);
    assert_eq!(rooms[1].version, 0);
    assert!(rooms[0].created_at > 0);
    assert_eq!(stats.presence_entries, 2);

    let value = serde_json::to_value(&stats).unwrap();
    assert_eq!(value["pubsubAdapter"], "local");
    assert_eq!(value["syncStats"]["totalSessions"], 2);
}

#[tokio::test]
async fn test_reauth_leaves_current_room() {
    let gw = gateway();
    let mut alice = Client::auth(&gw, "t-alice").await;
    alice.join(&gw, "c1").await;
    let mut bob = Client::auth(&gw, "t-bob").await;
    bob.join(&gw, "c1").await;
    alice.drain();

    bob.send(&gw, json!({ "type": "auth", "token": "t-carol" })).await;
    assert_eq!(bob.next()["type"], "ack");
    assert_eq!(alice.next()["type"], "presence:leave");
    assert_eq!(gw.room_info("c1").await.unwrap().users, vec!["u-alice".to_string()]);

    // A failed re-auth keeps the current identity.
    bob.send(&gw, json!({ "type": "auth", "token": "nope" })).await;
    assert_error(&bob.next(), "AUTH_FAILED");
    bob.join(&gw, "c1").await;
    assert_eq!(alice.next()["userId"], "u-carol");
}

// ───────────────────────────────────────────────────────────────────
// Connections closing during awaited collaborator calls
// ───────────────────────────────────────────────────────────────────

/// Blocks inside the call until released.
#[derive(Default)]
struct Gate {
    entered: Notify,
    release: Notify,
}

impl Gate {
    async fn pass(&self) {
        self.entered.notify_one();
        self.release.notified().await;
    }
}

struct GatedVerifier {
    gate: Arc<Gate>,
    inner: StaticTokenVerifier,
}

impl TokenVerifier for GatedVerifier {
    fn verify<'a>(&'a self, token: &'a str) -> BoxFuture<'a, Result<VerifiedUser, AuthError>> {
        Box::pin(async move {
            self.gate.pass().await;
            self.inner.verify(token).await
        })
    }
}

struct GatedAuthorizer {
    gate: Arc<Gate>,
}

impl AccessAuthorizer for GatedAuthorizer {
    fn check<'a>(&'a self, _user_id: &'a str, _canvas_id: &'a str) -> BoxFuture<'a, AccessDecision> {
        Box::pin(async move {
            self.gate.pass().await;
            AccessDecision::allow()
        })
    }
}

#[tokio::test]
async fn test_disconnect_during_token_verification() {
    let gate = Arc::new(Gate::default());
    let verifier = GatedVerifier {
        gate: gate.clone(),
        inner: verifier(),
    };
    let gw = Arc::new(Gateway::new(
        GatewayOptions::new(Arc::new(verifier)).with_server_id("s1"),
    ));
    let mut client = Client::connect(&gw).await;
    let conn = client.conn;

    let pending = tokio::spawn({
        let gw = gw.clone();
        async move {
            let auth = json!({ "type": "auth", "token": "t-alice" }).to_string();
            gw.handle_text(conn, &auth).await;
        }
    });
    gate.entered.notified().await;
    gw.disconnect(conn).await;
    gate.release.notify_one();
    timeout(Duration::from_secs(2), pending).await.unwrap().unwrap();

    client.assert_silent();
    let stats = gw.stats().await;
    assert_eq!(stats.connections, 0);
    assert_eq!(stats.presence_entries, 0);
}

#[tokio::test]
async fn test_disconnect_during_access_check() {
    let gate = Arc::new(Gate::default());
    let gw = Arc::new(Gateway::new(
        options().with_authorizer(Arc::new(GatedAuthorizer { gate: gate.clone() })),
    ));
    let mut alice = Client::auth(&gw, "t-alice").await;
    let conn = alice.conn;

    let pending = tokio::spawn({
        let gw = gw.clone();
        async move {
            let join = json!({ "type": "join", "canvasId": "c1", "lastVersion": 0 }).to_string();
            gw.handle_text(conn, &join).await;
        }
    });
    gate.entered.notified().await;
    gw.disconnect(conn).await;
    gate.release.notify_one();
    timeout(Duration::from_secs(2), pending).await.unwrap().unwrap();

    alice.assert_silent();
    assert!(gw.room_info("c1").await.is_none());
    assert!(gw.sync().session(conn).await.is_none());
    let stats = gw.stats().await;
    assert_eq!(stats.rooms, 0);
    assert_eq!(stats.presence_entries, 0);
    assert_eq!(stats.sync_stats.total_sessions, 0);
}
