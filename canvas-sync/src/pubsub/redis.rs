//! Distributed fanout backed by Redis pub/sub.
//!
//! Publishing goes through one multiplexed connection. Redis forbids
//! ordinary commands on a subscribed connection, so every subscription gets
//! its own pub/sub connection and listener task.

use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use redis::AsyncCommands;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::{MessageHandler, PubSubAdapter, PubSubMessage};
use crate::error::TransportError;

enum Subscription {
    Channel(String),
    Prefix(String),
}

pub struct RedisPubSub {
    client: redis::Client,
    publisher: redis::aio::MultiplexedConnection,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl RedisPubSub {
    /// Connect to `url` (e.g. `redis://127.0.0.1:6379`).
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let client = redis::Client::open(url)?;
        let publisher = client.get_multiplexed_async_connection().await?;
        log::info!("Connected to Redis pub/sub at {url}");
        Ok(Self {
            client,
            publisher,
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    async fn listen(
        &self,
        subscription: Subscription,
        handler: MessageHandler,
    ) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let mut pubsub = self.client.get_async_pubsub().await?;
        let description = match &subscription {
            Subscription::Channel(channel) => {
                pubsub.subscribe(channel.as_str()).await?;
                channel.clone()
            }
            Subscription::Prefix(prefix) => {
                let pattern = prefix_pattern(prefix);
                pubsub.psubscribe(pattern.as_str()).await?;
                pattern
            }
        };
        log::debug!("Redis subscription active: {description}");

        let handle = tokio::spawn(async move {
            let mut messages = pubsub.on_message();
            while let Some(msg) = messages.next().await {
                let payload: Vec<u8> = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        log::warn!("Unreadable Redis payload on {}: {e}", msg.get_channel_name());
                        continue;
                    }
                };
                match PubSubMessage::decode(&payload) {
                    Ok(decoded) => handler(decoded),
                    Err(e) => log::warn!("Dropping foreign message on {}: {e}", msg.get_channel_name()),
                }
            }
            log::warn!("Redis subscription {description} ended");
        });

        self.tasks.lock().await.push(handle);
        Ok(())
    }
}

/// Redis glob matching `prefix` literally, followed by anything.
pub fn prefix_pattern(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 2);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('*');
    pattern
}

impl PubSubAdapter for RedisPubSub {
    fn name(&self) -> &'static str {
        "redis"
    }

    fn publish<'a>(
        &'a self,
        channel: &'a str,
        data: String,
        sender_id: &'a str,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            if self.closed.load(Ordering::SeqCst) {
                return Err(TransportError::Closed);
            }
            let bytes = PubSubMessage::new(channel, data, sender_id).encode()?;
            let mut conn = self.publisher.clone();
            let _: () = conn.publish(channel, bytes).await?;
            Ok(())
        })
    }

    fn subscribe<'a>(
        &'a self,
        channel: &'a str,
        handler: MessageHandler,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(self.listen(Subscription::Channel(channel.to_string()), handler))
    }

    fn pattern_subscribe<'a>(
        &'a self,
        prefix: &'a str,
        handler: MessageHandler,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(self.listen(Subscription::Prefix(prefix.to_string()), handler))
    }

    fn close(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            self.closed.store(true, Ordering::SeqCst);
            for task in self.tasks.lock().await.drain(..) {
                task.abort();
            }
            log::info!("Redis pub/sub closed");
            Ok(())
        })
    }
}
