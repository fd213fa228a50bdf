//! In-process fanout adapters.
//!
//! `LocalPubSub` is for single-instance deployments: there is nobody to
//! reach, so publishing returns immediately. `MemoryBroker` connects several
//! gateways living in the same process through one tokio broadcast channel.

use futures_util::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use super::{MessageHandler, PubSubAdapter, PubSubMessage};
use crate::error::TransportError;

/// Single-instance adapter: no peers, no delivery.
#[derive(Debug, Default)]
pub struct LocalPubSub;

impl LocalPubSub {
    pub fn new() -> Self {
        Self
    }
}

impl PubSubAdapter for LocalPubSub {
    fn name(&self) -> &'static str {
        "local"
    }

    fn publish<'a>(
        &'a self,
        _channel: &'a str,
        _data: String,
        _sender_id: &'a str,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async { Ok(()) })
    }

    fn subscribe<'a>(
        &'a self,
        channel: &'a str,
        _handler: MessageHandler,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            log::debug!("Local pub/sub: subscription to {channel} will never fire");
            Ok(())
        })
    }

    fn pattern_subscribe<'a>(
        &'a self,
        prefix: &'a str,
        _handler: MessageHandler,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            log::debug!("Local pub/sub: subscription to {prefix}* will never fire");
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async { Ok(()) })
    }
}

/// Shared in-memory broker. Clone it, or hand out adapters with `adapter()`.
#[derive(Clone)]
pub struct MemoryBroker {
    sender: broadcast::Sender<Arc<PubSubMessage>>,
}

impl MemoryBroker {
    /// `capacity` bounds how far a slow subscriber may lag before
    /// it starts losing messages.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// A new adapter attached to this broker.
    pub fn adapter(&self) -> MemoryPubSub {
        MemoryPubSub {
            sender: self.sender.clone(),
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// One process's view of a [`MemoryBroker`].
pub struct MemoryPubSub {
    sender: broadcast::Sender<Arc<PubSubMessage>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl MemoryPubSub {
    async fn listen<F>(&self, description: String, accepts: F, handler: MessageHandler)
    where
        F: Fn(&str) -> bool + Send + 'static,
    {
        let mut rx = self.sender.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(msg) => {
                        if accepts(&msg.channel) {
                            handler(msg.as_ref().clone());
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Memory pub/sub subscriber {description} lagged by {n} messages");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.tasks.lock().await.push(handle);
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }
}

impl PubSubAdapter for MemoryPubSub {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn publish<'a>(
        &'a self,
        channel: &'a str,
        data: String,
        sender_id: &'a str,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            self.ensure_open()?;
            // No subscribers is not an error.
            let _ = self
                .sender
                .send(Arc::new(PubSubMessage::new(channel, data, sender_id)));
            Ok(())
        })
    }

    fn subscribe<'a>(
        &'a self,
        channel: &'a str,
        handler: MessageHandler,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            self.ensure_open()?;
            let wanted = channel.to_string();
            self.listen(wanted.clone(), move |c| c == wanted, handler).await;
            Ok(())
        })
    }

    fn pattern_subscribe<'a>(
        &'a self,
        prefix: &'a str,
        handler: MessageHandler,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            self.ensure_open()?;
            let prefix = prefix.to_string();
            self.listen(format!("{prefix}*"), move |c| c.starts_with(&prefix), handler)
                .await;
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            self.closed.store(true, Ordering::SeqCst);
            for task in self.tasks.lock().await.drain(..) {
                task.abort();
            }
            Ok(())
        })
    }
}
