//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use lostlink_shared::constants::{
    APP_NAME, DEFAULT_CHANNEL_BUFFER, DEFAULT_HTTP_PORT, DEFAULT_IDENTITY_HEADER,
    DEFAULT_MATCH_LIMIT, DEFAULT_SUBSCRIPTION_TIMEOUT_SECS,
};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP (axum) server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// SQLite database file.
    /// Env: `DATABASE_PATH`
    /// Default: `None` (platform data directory).
    pub database_path: Option<PathBuf>,

    /// Request header carrying the identity verified by the upstream auth
    /// proxy.
    /// Env: `IDENTITY_HEADER`
    /// Default: `x-authenticated-user`
    pub identity_header: String,

    /// Human-readable name for this instance.
    /// Env: `INSTANCE_NAME`
    pub instance_name: String,

    /// Lifetime of a match stream subscription.
    /// Env: `SUBSCRIPTION_TIMEOUT_SECS`
    /// Default: 1800 (30 minutes).
    pub subscription_timeout: Duration,

    /// Outbound queue depth of each live socket or stream.
    /// Env: `CHANNEL_BUFFER`
    pub channel_buffer: usize,

    /// Env: `ANALYSIS_WORKERS`
    pub analysis_workers: usize,

    /// Pending analysis jobs accepted before `submit` reports a full queue.
    /// Env: `ANALYSIS_QUEUE`
    pub analysis_queue: usize,

    /// Embedding service endpoint. Match analysis is disabled when unset.
    /// Env: `EMBEDDING_URL`
    pub embedding_url: Option<String>,

    /// Number of suggestions kept per analysis run.
    /// Env: `MATCH_LIMIT`
    pub match_limit: usize,

    /// Sustained requests per second per client.
    /// Env: `RATE_LIMIT_PER_SEC`
    pub rate_limit_per_sec: f64,

    /// Env: `RATE_LIMIT_BURST`
    pub rate_limit_burst: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            database_path: None,
            identity_header: DEFAULT_IDENTITY_HEADER.to_string(),
            instance_name: format!("{APP_NAME} Node"),
            subscription_timeout: Duration::from_secs(DEFAULT_SUBSCRIPTION_TIMEOUT_SECS),
            channel_buffer: DEFAULT_CHANNEL_BUFFER,
            analysis_workers: 2,
            analysis_queue: 64,
            embedding_url: None,
            match_limit: DEFAULT_MATCH_LIMIT,
            rate_limit_per_sec: 10.0,
            rate_limit_burst: 30.0,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = lookup("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default");
            }
        }

        if let Some(path) = lookup("DATABASE_PATH") {
            if !path.is_empty() {
                config.database_path = Some(PathBuf::from(path));
            }
        }

        if let Some(header) = lookup("IDENTITY_HEADER") {
            let header = header.trim().to_ascii_lowercase();
            if header.is_empty() {
                tracing::warn!("Empty IDENTITY_HEADER, using default");
            } else {
                config.identity_header = header;
            }
        }

        if let Some(name) = lookup("INSTANCE_NAME") {
            config.instance_name = name;
        }

        if let Some(secs) = parse_positive::<u64, _>(&lookup, "SUBSCRIPTION_TIMEOUT_SECS") {
            config.subscription_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = parse_positive(&lookup, "CHANNEL_BUFFER") {
            config.channel_buffer = n;
        }
        if let Some(n) = parse_positive(&lookup, "ANALYSIS_WORKERS") {
            config.analysis_workers = n;
        }
        if let Some(n) = parse_positive(&lookup, "ANALYSIS_QUEUE") {
            config.analysis_queue = n;
        }
        if let Some(n) = parse_positive(&lookup, "MATCH_LIMIT") {
            config.match_limit = n;
        }
        if let Some(rate) = parse_positive(&lookup, "RATE_LIMIT_PER_SEC") {
            config.rate_limit_per_sec = rate;
        }
        if let Some(burst) = parse_positive(&lookup, "RATE_LIMIT_BURST") {
            config.rate_limit_burst = burst;
        }

        if let Some(url) = lookup("EMBEDDING_URL") {
            if !url.is_empty() {
                config.embedding_url = Some(url);
            }
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}

/// Parse a strictly positive number, warning and returning `None` on junk.
fn parse_positive<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr + PartialOrd + Default,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) if value > T::default() => Some(value),
        _ => {
            tracing::warn!(key, value = %raw, "Invalid value, using default");
            None
        }
    }
}
