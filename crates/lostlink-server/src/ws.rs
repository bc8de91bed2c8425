//! Realtime chat over WebSocket.
//!
//! The upgrade only happens for a request that carries an authenticated
//! identity; anything else is rejected before a session or registry entry
//! exists. An upgraded session registers one channel, replays undelivered
//! messages into it, then dispatches inbound frames by type until the
//! client leaves or moderation closes the channel. The channel is
//! deregistered before the session task ends.

use std::collections::HashMap;
use std::fmt::Display;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{Sink, SinkExt, Stream, StreamExt};
use lostlink_shared::constants::BLOCKED_NOTICE;
use lostlink_shared::{ChatEvent, ConnectionId, EventKind, Identity};
use lostlink_store::Message;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use crate::api::{AppState, AuthenticatedIdentity};
use crate::error::ServerError;

/// How long a closing session waits for its writer to flush.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn chat_socket(
    AuthenticatedIdentity(identity): AuthenticatedIdentity,
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| run_session(socket, state, identity))
}

async fn run_session(socket: WebSocket, state: AppState, identity: Identity) {
    let (sink, stream) = socket.split();
    drive_session(sink, stream, state, identity).await;
}

/// Run one session over any frame sink and stream. Returns once the
/// channel is deregistered and the writer has stopped.
pub(crate) async fn drive_session<Si, St, E>(
    sink: Si,
    mut stream: St,
    state: AppState,
    identity: Identity,
) where
    Si: Sink<WsMessage> + Unpin + Send + 'static,
    Si::Error: Send,
    St: Stream<Item = Result<WsMessage, E>> + Unpin,
    E: Display,
{
    // The registry holds the only long-lived sender, so the writer stops
    // once the channel is deregistered or force-closed.
    let (tx, rx) = state.registry.channel();
    let registration = state.registry.register(&identity, tx).await;
    let session = Session {
        state: state.clone(),
        identity: identity.clone(),
        connection: registration.id,
    };

    // Taken after registering: anything sent from here on is pushed live,
    // and may also be in the snapshot.
    let backlog = session.load_backlog().await;
    let filter = ReplayFilter::new(backlog.iter().map(|message| message.id));
    let mut writer = tokio::spawn(write_events(sink, rx, filter));

    tokio::select! {
        replayed = session.replay(backlog) => {
            info!(identity = %identity, connection = %registration.id, replayed, "chat session opened");
            session.read_frames(&mut stream, &registration.closed).await;
        }
        _ = registration.closed.notified() => {
            info!(identity = %identity, "chat session closed by moderation during replay");
        }
    }

    state.registry.deregister(&identity, registration.id).await;
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
        .await
        .is_err()
    {
        writer.abort();
    }
    info!(identity = %identity, connection = %registration.id, "chat session closed");
}

async fn write_events<Si>(mut sink: Si, mut rx: mpsc::Receiver<ChatEvent>, mut filter: ReplayFilter)
where
    Si: Sink<WsMessage> + Unpin,
{
    while let Some(event) = rx.recv().await {
        if !filter.admit(&event) {
            continue;
        }
        let text = match event.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "failed to encode outbound event");
                continue;
            }
        };
        if sink.send(WsMessage::Text(text.into())).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}

/// Drops the second copy of a backlog message that reached the channel
/// both live and by replay.
///
/// Only the ids in the session's backlog snapshot are tracked, and an id is
/// forgotten once its duplicate has been dropped. Events flagged
/// `delivered` (the sender's own echo) always pass.
#[derive(Debug, Default)]
pub(crate) struct ReplayFilter {
    /// Backlog id -> whether one copy already went out.
    backlog: HashMap<i64, bool>,
}

impl ReplayFilter {
    pub(crate) fn new(ids: impl IntoIterator<Item = i64>) -> Self {
        Self {
            backlog: ids.into_iter().map(|id| (id, false)).collect(),
        }
    }

    pub(crate) fn admit(&mut self, event: &ChatEvent) -> bool {
        if event.kind != EventKind::Message || event.delivered {
            return true;
        }
        let Some(id) = event.id else {
            return true;
        };
        match self.backlog.get_mut(&id) {
            Some(sent) if *sent => {
                self.backlog.remove(&id);
                false
            }
            Some(sent) => {
                *sent = true;
                true
            }
            None => true,
        }
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.backlog.len()
    }
}

/// An authenticated session bound to one registered channel.
pub(crate) struct Session {
    state: AppState,
    identity: Identity,
    connection: ConnectionId,
}

impl Session {
    /// Everything still queued for this identity, oldest first. A failed
    /// load is logged and treated as empty.
    pub(crate) async fn load_backlog(&self) -> Vec<Message> {
        match self.state.chat.undelivered_for(&self.identity).await {
            Ok(pending) => pending,
            Err(e) => {
                warn!(identity = %self.identity, error = %e, "failed to load undelivered messages");
                Vec::new()
            }
        }
    }

    /// Push `backlog` into this session's channel, waiting for room rather
    /// than skipping, and mark each message delivered once the channel took
    /// it. Stops early only if the channel goes away.
    pub(crate) async fn replay(&self, backlog: Vec<Message>) -> usize {
        let mut replayed = 0;
        for message in backlog {
            let accepted = self
                .state
                .registry
                .send_to_wait(&self.identity, self.connection, message.to_event())
                .await;
            if !accepted {
                break;
            }
            if let Err(e) = self.state.chat.mark_delivered(message.id).await {
                warn!(message = message.id, error = %e, "failed to record replayed delivery");
            }
            replayed += 1;
        }
        replayed
    }

    /// Dispatch inbound frames until the client leaves or `closed` fires.
    async fn read_frames<St, E>(&self, stream: &mut St, closed: &Notify)
    where
        St: Stream<Item = Result<WsMessage, E>> + Unpin,
        E: Display,
    {
        loop {
            tokio::select! {
                _ = closed.notified() => {
                    info!(identity = %self.identity, "chat session closed by moderation");
                    break;
                }
                frame = stream.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => self.handle_text(text.as_str()).await,
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(identity = %self.identity, error = %e, "socket read failed");
                        break;
                    }
                },
            }
        }
    }

    /// Dispatch one inbound text frame. Malformed frames are dropped.
    pub(crate) async fn handle_text(&self, raw: &str) {
        if !self.state.event_limiter.check(self.identity.clone()).await {
            warn!(identity = %self.identity, "event rate limit exceeded, dropping frame");
            return;
        }

        let event = match ChatEvent::parse_inbound(raw) {
            Ok(event) => event,
            Err(e) => {
                debug!(identity = %self.identity, error = %e, "dropping malformed frame");
                return;
            }
        };
        let Some(to) = event.to.clone() else {
            debug!(identity = %self.identity, "dropping frame without recipient");
            return;
        };

        match event.kind {
            EventKind::Message => {
                let Some(text) = event.text else {
                    debug!(identity = %self.identity, "dropping message without text");
                    return;
                };
                self.send_message(&to, &text).await;
            }
            EventKind::Typing => {
                self.state.chat.forward_typing(&self.identity, event).await;
            }
            EventKind::Read => match event.id {
                Some(id) => self.state.chat.acknowledge_read(&self.identity, &to, id).await,
                None => debug!(identity = %self.identity, "dropping read receipt without id"),
            },
            EventKind::Error => {
                debug!(identity = %self.identity, "ignoring client-sent error event");
            }
        }
    }

    async fn send_message(&self, to: &Identity, text: &str) {
        let reply = match self.state.chat.send(&self.identity, to, text).await {
            Ok(message) => message.to_event(),
            Err(ServerError::Blocked) => ChatEvent::error(self.identity.clone(), BLOCKED_NOTICE),
            Err(ServerError::BadRequest(reason)) => ChatEvent::error(self.identity.clone(), reason),
            Err(e) => {
                warn!(identity = %self.identity, error = %e, "send failed");
                ChatEvent::error(self.identity.clone(), "Message could not be sent")
            }
        };
        self.push(reply).await;
    }

    async fn push(&self, event: ChatEvent) -> bool {
        self.state
            .registry
            .send_to(&self.identity, self.connection, event)
            .await
    }
}
