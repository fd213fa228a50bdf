//! canvas-sync-server: development server for the canvas sync gateway.
//!
//! Environment:
//! - `CANVAS_SYNC_*`: see `GatewayConfig::from_env`
//! - `REDIS_URL`: enables Redis fanout (single instance otherwise)
//! - `SERVER_ID`: process identity (random otherwise)
//! - `CANVAS_SYNC_TOKENS`: `token=userId:username,...`
//! - `RUST_LOG`: log filter

use std::sync::Arc;

use canvas_sync::{
    GatewayConfig, GatewayOptions, PubSubAdapter, RedisPubSub, StaticTokenVerifier, SyncServer,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = GatewayConfig::from_env()?;
    let tokens = std::env::var("CANVAS_SYNC_TOKENS").unwrap_or_default();
    let verifier = StaticTokenVerifier::parse(&tokens)?;
    if verifier.is_empty() {
        log::warn!("CANVAS_SYNC_TOKENS is empty; every auth attempt will fail");
    }

    let mut options = GatewayOptions::new(Arc::new(verifier)).with_config(config);
    if let Ok(server_id) = std::env::var("SERVER_ID") {
        options = options.with_server_id(server_id);
    }
    if let Ok(url) = std::env::var("REDIS_URL") {
        let redis: Arc<dyn PubSubAdapter> = Arc::new(RedisPubSub::connect(&url).await?);
        options = options.with_pubsub(redis);
    } else {
        log::info!("REDIS_URL not set, running single-instance");
    }

    let server = SyncServer::bind(options).await?;
    log::info!("Ready on ws://{}", server.local_addr());

    tokio::signal::ctrl_c().await?;
    log::info!("Shutting down...");
    server.shutdown().await;
    Ok(())
}
