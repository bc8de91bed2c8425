//! # lostlink-server
//!
//! Realtime messaging core for the LostLink lost-and-found service.
//!
//! This binary provides:
//! - **Chat over WebSocket** with multi-device presence, durable history and
//!   delivery tracking
//! - **Moderation**: blocking erases a conversation and drops both parties'
//!   live connections
//! - **Match suggestion streams** (SSE) fed by a bounded analysis worker pool
//! - **REST API** (axum) for history, inbox summaries, read marks and blocks
//! - **Per-IP and per-identity rate limiting**
//!
//! Identities are not verified here: an upstream auth proxy passes the
//! authenticated user in a request header.

mod analysis;
mod api;
mod chat;
mod config;
mod db;
mod error;
mod hub;
mod rate_limit;
mod registry;
mod streams;
mod topics;
mod ws;

use std::sync::Arc;
use std::time::Duration;

use lostlink_store::Database;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::analysis::{Embedder, HttpEmbedder};
use crate::api::AppState;
use crate::config::ServerConfig;

const BUCKET_IDLE: Duration = Duration::from_secs(600);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,lostlink_server=debug")),
        )
        .init();

    info!("Starting LostLink server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------
    let database = match &config.database_path {
        Some(path) => Database::open_at(path)?,
        None => Database::new()?,
    };

    let embedder: Option<Arc<dyn Embedder>> = match &config.embedding_url {
        Some(url) => Some(Arc::new(HttpEmbedder::new(url.clone())) as Arc<dyn Embedder>),
        None => {
            info!("EMBEDDING_URL not set, match analysis disabled");
            None
        }
    };

    let http_addr = config.http_addr;
    let app_state = AppState::new(config, database, embedder);

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------

    // Evict rate limit buckets idle for 10 minutes (every 5 minutes)
    let ip_limiter = app_state.rate_limiter.clone();
    let event_limiter = app_state.event_limiter.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            interval.tick().await;
            let evicted = ip_limiter.purge_stale(BUCKET_IDLE).await
                + event_limiter.purge_stale(BUCKET_IDLE).await;
            if evicted > 0 {
                debug!(evicted, "purged idle rate limit buckets");
            }
        }
    });

    // Sweep expired match subscriptions (every minute)
    let publisher = app_state.publisher.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            let removed = publisher.prune_expired().await;
            if removed > 0 {
                debug!(removed, "pruned expired match subscriptions");
            }
        }
    });

    // -----------------------------------------------------------------------
    // 5. Run the HTTP server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
