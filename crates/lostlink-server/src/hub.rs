//! Keyed fan-out shared by the connection registry and the topic publisher.
//!
//! A [`Hub`] maps a key to the set of live [`Outlet`]s registered under it.
//! Pushes hold the read lock for the whole fan-out while removals take the
//! write lock, so a removal is ordered strictly before or after any push:
//! an outlet either receives the item or is already gone.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use lostlink_shared::ConnectionId;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify, RwLock};
use tokio::time::Instant;

/// One live channel: the bounded queue feeding a socket or stream writer,
/// plus a signal the owner waits on to learn it was closed from outside.
#[derive(Debug)]
pub struct Outlet<T> {
    pub id: ConnectionId,
    tx: mpsc::Sender<T>,
    closed: Arc<Notify>,
    expires_at: Option<Instant>,
}

impl<T> Outlet<T> {
    pub fn new(tx: mpsc::Sender<T>) -> Self {
        Self {
            id: ConnectionId::new(),
            tx,
            closed: Arc::new(Notify::new()),
            expires_at: None,
        }
    }

    /// Expire the outlet at `deadline`; expired outlets never receive pushes.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.expires_at = Some(deadline);
        self
    }

    /// Handle the owner awaits to learn about a forced close.
    pub fn closed_signal(&self) -> Arc<Notify> {
        self.closed.clone()
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    fn close(&self) {
        // notify_one stores a permit, so an owner that is not yet waiting
        // still observes the close.
        self.closed.notify_one();
    }
}

/// What happened to one push across every outlet of a key.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FanOut {
    /// Outlets whose queue accepted the item.
    pub accepted: usize,
    /// Outlets skipped because their queue was full.
    pub full: usize,
    /// Outlets removed because their receiver was gone or they had expired.
    pub removed: usize,
}

impl FanOut {
    pub fn any_accepted(&self) -> bool {
        self.accepted > 0
    }
}

type Table<K, T> = HashMap<K, HashMap<ConnectionId, Outlet<T>>>;

pub struct Hub<K, T> {
    table: Arc<RwLock<Table<K, T>>>,
}

impl<K, T> Clone for Hub<K, T> {
    fn clone(&self) -> Self {
        Self {
            table: self.table.clone(),
        }
    }
}

impl<K, T> Default for Hub<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, T> Hub<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone,
{
    pub fn new() -> Self {
        Self {
            table: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Add `outlet` under `key`, creating the set if needed.
    pub async fn attach(&self, key: K, outlet: Outlet<T>) -> ConnectionId {
        let id = outlet.id;
        self.table
            .write()
            .await
            .entry(key)
            .or_default()
            .insert(id, outlet);
        id
    }

    /// Remove one outlet without signalling it. An empty set drops the key.
    /// Returns whether the outlet was present.
    pub async fn detach(&self, key: &K, id: ConnectionId) -> bool {
        let mut table = self.table.write().await;
        remove_outlet(&mut table, key, id).is_some()
    }

    /// Remove one outlet and signal its owner.
    pub async fn close(&self, key: &K, id: ConnectionId) -> bool {
        let mut table = self.table.write().await;
        match remove_outlet(&mut table, key, id) {
            Some(outlet) => {
                outlet.close();
                true
            }
            None => false,
        }
    }

    /// Remove and signal every outlet under `key`. Returns how many closed.
    pub async fn close_all(&self, key: &K) -> usize {
        let removed = self.table.write().await.remove(key);
        match removed {
            Some(outlets) => {
                for outlet in outlets.values() {
                    outlet.close();
                }
                outlets.len()
            }
            None => 0,
        }
    }

    /// Snapshot of the outlet ids currently under `key`.
    pub async fn outlets(&self, key: &K) -> Vec<ConnectionId> {
        self.table
            .read()
            .await
            .get(key)
            .map(|set| set.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Push `item` to one outlet. Returns `true` if its queue accepted it.
    pub async fn send_to(&self, key: &K, id: ConnectionId, item: T) -> bool {
        let table = self.table.read().await;
        let Some(outlet) = table.get(key).and_then(|set| set.get(&id)) else {
            return false;
        };
        if outlet.is_expired(Instant::now()) {
            return false;
        }
        outlet.tx.try_send(item).is_ok()
    }

    /// Push `item` to one outlet, waiting for room in its queue.
    ///
    /// The sender is cloned under the read lock and the wait happens after
    /// the lock is released, so fan-out and removals are never held up by
    /// one slow queue. Returns `false` if the outlet is gone, expired, or
    /// its receiver was dropped.
    pub async fn send_to_wait(&self, key: &K, id: ConnectionId, item: T) -> bool {
        let tx = {
            let table = self.table.read().await;
            match table.get(key).and_then(|set| set.get(&id)) {
                Some(outlet) if !outlet.is_expired(Instant::now()) => outlet.tx.clone(),
                _ => return false,
            }
        };
        tx.send(item).await.is_ok()
    }

    /// Push `item` to every outlet under `key` without waiting on any of them.
    ///
    /// Full queues are skipped. Outlets whose receiver is gone, and expired
    /// ones, are removed before this call returns.
    pub async fn send(&self, key: &K, item: T) -> FanOut {
        let mut report = FanOut::default();
        let mut dead = Vec::new();
        let now = Instant::now();

        {
            let table = self.table.read().await;
            let Some(set) = table.get(key) else {
                return report;
            };
            for outlet in set.values() {
                if outlet.is_expired(now) {
                    dead.push(outlet.id);
                    continue;
                }
                match outlet.tx.try_send(item.clone()) {
                    Ok(()) => report.accepted += 1,
                    Err(TrySendError::Full(_)) => report.full += 1,
                    Err(TrySendError::Closed(_)) => dead.push(outlet.id),
                }
            }
        }

        if !dead.is_empty() {
            let mut table = self.table.write().await;
            for id in dead {
                if let Some(outlet) = remove_outlet(&mut table, key, id) {
                    outlet.close();
                    report.removed += 1;
                }
            }
        }

        report
    }

    /// Drop every expired outlet. Returns how many were removed.
    pub async fn prune_expired(&self) -> usize {
        let now = Instant::now();
        let mut table = self.table.write().await;
        let mut removed = 0;
        table.retain(|_, set| {
            set.retain(|_, outlet| {
                let keep = !outlet.is_expired(now);
                if !keep {
                    outlet.close();
                    removed += 1;
                }
                keep
            });
            !set.is_empty()
        });
        removed
    }

    /// Number of keys with at least one outlet.
    pub async fn key_count(&self) -> usize {
        self.table.read().await.len()
    }

    /// Total outlets across all keys.
    pub async fn outlet_count(&self) -> usize {
        self.table.read().await.values().map(HashMap::len).sum()
    }

    /// Live handles onto the shared table, this one included.
    #[cfg(test)]
    pub(crate) fn handle_count(&self) -> usize {
        Arc::strong_count(&self.table)
    }
}

fn remove_outlet<K, T>(table: &mut Table<K, T>, key: &K, id: ConnectionId) -> Option<Outlet<T>>
where
    K: Eq + Hash,
{
    let set = table.get_mut(key)?;
    let outlet = set.remove(&id);
    if set.is_empty() {
        table.remove(key);
    }
    outlet
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_attach_detach_drops_empty_keys() {
        let hub: Hub<&'static str, u32> = Hub::new();
        let (tx, _rx) = mpsc::channel(4);
        let id = hub.attach("k", Outlet::new(tx)).await;

        assert_eq!(hub.outlets(&"k").await, vec![id]);
        assert!(hub.detach(&"k", id).await);
        assert!(!hub.detach(&"k", id).await);
        assert_eq!(hub.key_count().await, 0);
    }

    #[tokio::test]
    async fn test_send_reaches_every_outlet() {
        let hub: Hub<&'static str, u32> = Hub::new();
        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);
        hub.attach("k", Outlet::new(tx1)).await;
        hub.attach("k", Outlet::new(tx2)).await;

        let report = hub.send(&"k", 7).await;
        assert_eq!(report.accepted, 2);
        assert_eq!(rx1.try_recv().unwrap(), 7);
        assert_eq!(rx2.try_recv().unwrap(), 7);

        assert_eq!(hub.send(&"other", 1).await, FanOut::default());
    }

    #[tokio::test]
    async fn test_full_queue_is_skipped_not_removed() {
        let hub: Hub<&'static str, u32> = Hub::new();
        let (tx, _rx) = mpsc::channel(1);
        let id = hub.attach("k", Outlet::new(tx)).await;

        assert_eq!(hub.send(&"k", 1).await.accepted, 1);
        let report = hub.send(&"k", 2).await;
        assert_eq!(report.full, 1);
        assert!(!report.any_accepted());
        assert_eq!(hub.outlets(&"k").await, vec![id]);
    }

    #[tokio::test]
    async fn test_send_to_wait_blocks_until_room() {
        let hub: Hub<&'static str, u32> = Hub::new();
        let (tx, mut rx) = mpsc::channel(1);
        let id = hub.attach("k", Outlet::new(tx)).await;
        assert!(hub.send_to(&"k", id, 1).await);
        assert!(!hub.send_to(&"k", id, 2).await);

        let waiting = {
            let hub = hub.clone();
            tokio::spawn(async move { hub.send_to_wait(&"k", id, 2).await })
        };
        assert_eq!(rx.recv().await, Some(1));
        assert!(waiting.await.unwrap());
        assert_eq!(rx.recv().await, Some(2));

        assert!(hub.detach(&"k", id).await);
        assert!(!hub.send_to_wait(&"k", id, 3).await);
    }

    #[tokio::test]
    async fn test_closed_receiver_is_removed_during_send() {
        let hub: Hub<&'static str, u32> = Hub::new();
        let (tx, rx) = mpsc::channel(4);
        hub.attach("k", Outlet::new(tx)).await;
        drop(rx);

        let report = hub.send(&"k", 1).await;
        assert_eq!(report.removed, 1);
        assert_eq!(hub.outlet_count().await, 0);
    }

    #[tokio::test]
    async fn test_close_all_signals_owners() {
        let hub: Hub<&'static str, u32> = Hub::new();
        let (tx, _rx) = mpsc::channel(4);
        let outlet = Outlet::new(tx);
        let signal = outlet.closed_signal();
        hub.attach("k", outlet).await;

        assert_eq!(hub.close_all(&"k").await, 1);
        tokio::time::timeout(Duration::from_millis(100), signal.notified())
            .await
            .expect("owner should be signalled");
        assert_eq!(hub.send(&"k", 1).await.accepted, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_outlets_are_skipped_and_pruned() {
        let hub: Hub<&'static str, u32> = Hub::new();
        let (tx, mut rx) = mpsc::channel(4);
        let deadline = Instant::now() + Duration::from_secs(1);
        hub.attach("k", Outlet::new(tx).with_deadline(deadline)).await;

        tokio::time::advance(Duration::from_secs(2)).await;
        let report = hub.send(&"k", 1).await;
        assert_eq!(report.accepted, 0);
        assert_eq!(report.removed, 1);
        assert!(rx.try_recv().is_err());
        assert_eq!(hub.prune_expired().await, 0);
    }
}
