//! Directory of live chat channels keyed by identity.
//!
//! One identity may hold several channels at once (one per device). The
//! registry is a thin layer over [`Hub`]; see there for the locking rules
//! that order pushes against removals.

use std::sync::Arc;

use lostlink_shared::{ChatEvent, ConnectionId, Identity};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info};

use crate::hub::{FanOut, Hub, Outlet};

/// Handle a session keeps for its own registry entry.
pub struct Registration {
    pub id: ConnectionId,
    /// Woken when moderation closes this channel from outside.
    pub closed: Arc<Notify>,
}

#[derive(Clone)]
pub struct ConnectionRegistry {
    hub: Hub<Identity, ChatEvent>,
    buffer: usize,
}

impl ConnectionRegistry {
    pub fn new(buffer: usize) -> Self {
        Self {
            hub: Hub::new(),
            buffer,
        }
    }

    /// A fresh bounded queue sized for one channel.
    pub fn channel(&self) -> (mpsc::Sender<ChatEvent>, mpsc::Receiver<ChatEvent>) {
        mpsc::channel(self.buffer)
    }

    /// Add a channel to `identity`'s set.
    pub async fn register(&self, identity: &Identity, tx: mpsc::Sender<ChatEvent>) -> Registration {
        let outlet = Outlet::new(tx);
        let closed = outlet.closed_signal();
        let id = self.hub.attach(identity.clone(), outlet).await;

        info!(identity = %identity, connection = %id, "channel registered");
        Registration { id, closed }
    }

    /// Remove one channel. Returns whether it was still registered.
    pub async fn deregister(&self, identity: &Identity, id: ConnectionId) -> bool {
        let removed = self.hub.detach(identity, id).await;
        if removed {
            info!(identity = %identity, connection = %id, "channel deregistered");
        }
        removed
    }

    /// Snapshot of the channels currently live for `identity`.
    pub async fn channels_for(&self, identity: &Identity) -> Vec<ConnectionId> {
        self.hub.outlets(identity).await
    }

    /// Close and remove every channel of each identity. Returns how many
    /// channels were closed.
    pub async fn force_disconnect(&self, identities: &[&Identity]) -> usize {
        let mut closed = 0;
        for identity in identities {
            let n = self.hub.close_all(*identity).await;
            if n > 0 {
                info!(identity = %identity, channels = n, "channels force-closed");
            }
            closed += n;
        }
        closed
    }

    /// Push `event` to every live channel of `to` without waiting on any of
    /// them.
    pub async fn deliver(&self, to: &Identity, event: ChatEvent) -> FanOut {
        let report = self.hub.send(to, event).await;
        if report.full > 0 {
            debug!(identity = %to, skipped = report.full, "dropping event for slow channel");
        }
        report
    }

    /// Push `event` to one specific channel of `identity`.
    pub async fn send_to(&self, identity: &Identity, id: ConnectionId, event: ChatEvent) -> bool {
        self.hub.send_to(identity, id, event).await
    }

    /// Push `event` to one specific channel, waiting while its queue is
    /// full. Used for backlog replay, where nothing may be skipped.
    pub async fn send_to_wait(
        &self,
        identity: &Identity,
        id: ConnectionId,
        event: ChatEvent,
    ) -> bool {
        self.hub.send_to_wait(identity, id, event).await
    }

    /// Number of identities with at least one live channel.
    pub async fn online_count(&self) -> usize {
        self.hub.key_count().await
    }
}
