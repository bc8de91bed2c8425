//! Token-bucket rate limiting.
//!
//! REST requests are limited per client address by [`rate_limit_middleware`];
//! chat sockets keep a second limiter keyed by identity so one user cannot
//! flood the hub from several devices.

use std::collections::HashMap;
use std::hash::Hash;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::warn;

/// Headers a reverse proxy uses to pass the original client address, in
/// the order they are trusted.
const FORWARDED_HEADERS: [&str; 2] = ["x-forwarded-for", "x-real-ip"];

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    touched: Instant,
}

impl Bucket {
    fn full(burst: f64, now: Instant) -> Self {
        Self {
            tokens: burst,
            touched: now,
        }
    }

    /// Refill for the time since the last touch, then take one token if
    /// there is one.
    fn take(&mut self, rate: f64, burst: f64, now: Instant) -> bool {
        let refill = now.duration_since(self.touched).as_secs_f64() * rate;
        self.tokens = (self.tokens + refill).min(burst);
        self.touched = now;

        let allowed = self.tokens >= 1.0;
        if allowed {
            self.tokens -= 1.0;
        }
        allowed
    }
}

/// Shared limiter: `rate` tokens per second refill up to `burst`.
pub struct RateLimiter<K = IpAddr> {
    buckets: Arc<Mutex<HashMap<K, Bucket>>>,
    rate: f64,
    burst: f64,
}

impl<K> Clone for RateLimiter<K> {
    fn clone(&self) -> Self {
        Self {
            buckets: self.buckets.clone(),
            rate: self.rate,
            burst: self.burst,
        }
    }
}

impl<K: Eq + Hash> RateLimiter<K> {
    pub fn new(rate: f64, burst: f64) -> Self {
        Self {
            buckets: Arc::new(Mutex::new(HashMap::new())),
            rate,
            burst,
        }
    }

    /// Spend one token for `key`. Returns `false` when it has none left.
    pub async fn check(&self, key: K) -> bool {
        let now = Instant::now();
        self.buckets
            .lock()
            .await
            .entry(key)
            .or_insert_with(|| Bucket::full(self.burst, now))
            .take(self.rate, self.burst, now)
    }

    /// Forget keys untouched for at least `max_idle`. Returns how many went.
    pub async fn purge_stale(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().await;
        let before = buckets.len();
        buckets.retain(|_, bucket| now.duration_since(bucket.touched) < max_idle);
        before - buckets.len()
    }
}

/// Rejects a request with 429 once its client address runs out of tokens.
/// Requests whose address cannot be determined pass through.
pub async fn rate_limit_middleware(
    State(limiter): State<RateLimiter>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip());

    if let Some(ip) = client_ip(req.headers(), peer) {
        if !limiter.check(ip).await {
            warn!(ip = %ip, path = %req.uri().path(), "rate limit exceeded");
            return Err(StatusCode::TOO_MANY_REQUESTS);
        }
    }

    Ok(next.run(req).await)
}

/// The socket peer when known, otherwise the first parseable address a
/// proxy header names.
fn client_ip(headers: &HeaderMap, peer: Option<IpAddr>) -> Option<IpAddr> {
    peer.or_else(|| {
        FORWARDED_HEADERS.iter().find_map(|name| {
            let value = headers.get(*name)?.to_str().ok()?;
            value.split(',').next()?.trim().parse().ok()
        })
    })
}
