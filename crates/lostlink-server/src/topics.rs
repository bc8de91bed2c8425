//! Topic-keyed publish/subscribe with expiring subscriptions.
//!
//! Subscribers register against a [`TopicKey`] and receive every payload
//! published on it until they go away, are completed explicitly, or their
//! timeout elapses. There is no backlog: a late subscriber never sees
//! earlier payloads.

use std::time::Duration;

use lostlink_shared::{ConnectionId, TopicKey};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::hub::{FanOut, Hub, Outlet};

/// The receiving end of one subscription. The stream ends once the
/// subscription is removed.
pub struct Subscription<T> {
    pub id: ConnectionId,
    pub key: TopicKey,
    pub rx: mpsc::Receiver<T>,
}

pub struct TopicPublisher<T> {
    hub: Hub<TopicKey, T>,
    buffer: usize,
}

impl<T> Clone for TopicPublisher<T> {
    fn clone(&self) -> Self {
        Self {
            hub: self.hub.clone(),
            buffer: self.buffer,
        }
    }
}

impl<T> TopicPublisher<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(buffer: usize) -> Self {
        Self {
            hub: Hub::new(),
            buffer,
        }
    }

    /// Register a subscriber on `key` that expires after `timeout`.
    pub async fn subscribe(&self, key: TopicKey, timeout: Duration) -> Subscription<T> {
        let (tx, rx) = mpsc::channel(self.buffer);
        let outlet = Outlet::new(tx).with_deadline(Instant::now() + timeout);
        let closed = outlet.closed_signal();
        let id = self.hub.attach(key, outlet).await;

        // Every removal path signals `closed`, which ends the timer early.
        let hub = self.hub.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    if hub.close(&key, id).await {
                        debug!(topic = %key, subscriber = %id, "subscription expired");
                    }
                }
                _ = closed.notified() => {}
            }
        });

        debug!(topic = %key, subscriber = %id, ?timeout, "subscribed");
        Subscription { id, key, rx }
    }

    /// Push `payload` to every current subscriber of `key`.
    ///
    /// Subscribers whose stream is gone are removed during this call. A
    /// subscriber whose queue is full misses this payload but stays.
    pub async fn publish(&self, key: &TopicKey, payload: T) -> FanOut {
        let report = self.hub.send(key, payload).await;
        debug!(
            topic = %key,
            delivered = report.accepted,
            skipped = report.full,
            removed = report.removed,
            "published"
        );
        report
    }

    /// End a subscription before its timeout.
    pub async fn complete(&self, key: &TopicKey, id: ConnectionId) -> bool {
        self.hub.close(key, id).await
    }

    pub async fn subscriber_count(&self, key: &TopicKey) -> usize {
        self.hub.outlets(key).await.len()
    }

    pub async fn total_subscribers(&self) -> usize {
        self.hub.outlet_count().await
    }

    /// Sweep subscriptions whose deadline passed but whose timer has not
    /// fired yet.
    pub async fn prune_expired(&self) -> usize {
        self.hub.prune_expired().await
    }
}
