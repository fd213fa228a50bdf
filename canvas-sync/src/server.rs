//! WebSocket front end of the gateway.
//!
//! ```text
//! TcpListener ── accept ──► accept_async ──► per-connection task
//!                                              │
//!                    socket text ──────────────┼──► Gateway::handle_text (in order)
//!                    socket pong ──────────────┼──► Gateway::mark_alive
//!                    Outgoing receiver ◄───────┘◄── frames / pings / close
//! ```
//!
//! Each connection task owns both socket halves and selects between
//! inbound socket messages and its `Outgoing` queue. Inbound frames of one
//! connection are handled strictly one after another.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use crate::connection::Outgoing;
use crate::error::ServerError;
use crate::gateway::{BackgroundTasks, Gateway, GatewayOptions};

/// A running sync server.
pub struct SyncServer {
    gateway: Arc<Gateway>,
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
    background: BackgroundTasks,
}

impl SyncServer {
    /// Serve `listener` with a new gateway built from `options`.
    ///
    /// Subscribes to canvas fanout and starts the heartbeat and session
    /// sweep before accepting connections.
    pub async fn start(listener: TcpListener, options: GatewayOptions) -> Result<Self, ServerError> {
        let local_addr = listener.local_addr()?;
        let gateway = Arc::new(Gateway::new(options));
        let background = gateway.start_background().await?;

        let accept_gateway = gateway.clone();
        let accept_task = tokio::spawn(Self::accept_loop(listener, accept_gateway));

        log::info!(
            "Canvas sync server {} listening on {local_addr}",
            gateway.server_id()
        );
        Ok(Self {
            gateway,
            local_addr,
            accept_task,
            background,
        })
    }

    /// Bind `options.config.bind_addr` and start.
    pub async fn bind(options: GatewayOptions) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(&options.config.bind_addr).await?;
        Self::start(listener, options).await
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    /// Stop accepting, stop timers and fanout, close every connection.
    pub async fn shutdown(self) {
        self.accept_task.abort();
        self.background.stop();
        self.gateway.shutdown().await;
        log::info!("Canvas sync server on {} stopped", self.local_addr);
    }

    async fn accept_loop(listener: TcpListener, gateway: Arc<Gateway>) {
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::error!("Accept failed: {e}");
                    continue;
                }
            };
            log::debug!("New TCP connection from {addr}");

            let gateway = gateway.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, gateway).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        gateway: Arc<Gateway>,
    ) -> Result<(), WsError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let (conn, mut outgoing) = gateway.connect().await;
        log::info!("WebSocket connection {conn} established from {addr}");

        let result: Result<(), WsError> = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                gateway.handle_text(conn, text.as_str()).await;
                            }
                            Some(Ok(Message::Binary(data))) => {
                                gateway.handle_binary(conn, &data).await;
                            }
                            Some(Ok(Message::Pong(_))) | Some(Ok(Message::Ping(_))) => {
                                gateway.mark_alive(conn).await;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection {conn} closed by {addr}");
                                break;
                            }
                            Some(Ok(Message::Frame(_))) => {}
                            Some(Err(e)) => {
                                log::warn!("WebSocket error on {conn} from {addr}: {e}");
                                break;
                            }
                        }
                    }

                    item = outgoing.recv() => {
                        match item {
                            Some(Outgoing::Frame(frame)) => {
                                ws_sender.send(Message::text(frame.to_string())).await?;
                            }
                            Some(Outgoing::Ping) => {
                                ws_sender.send(Message::Ping(Default::default())).await?;
                            }
                            Some(Outgoing::Close) | None => {
                                let _ = ws_sender.send(Message::Close(None)).await;
                                break;
                            }
                        }
                    }
                }
            }
            Ok(())
        }
        .await;

        gateway.disconnect(conn).await;
        result
    }
}
