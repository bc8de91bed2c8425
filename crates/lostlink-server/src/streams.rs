//! Server-sent event streams of match suggestions.

use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use lostlink_shared::constants::MATCHES_EVENT;
use lostlink_shared::{ConnectionId, MatchScore, TopicKey, TopicKind};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, info};

use crate::analysis::MatchPublisher;
use crate::api::{AppState, AuthenticatedIdentity};
use crate::error::ServerError;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(20);

/// `GET /api/stream/matches/{kind}/{id}`
///
/// Every analysis published on the topic arrives as a `matches` event whose
/// data is the ranked score array. The stream ends when the subscription
/// times out; a viewer that disconnects is unsubscribed right away.
pub async fn match_stream(
    AuthenticatedIdentity(viewer): AuthenticatedIdentity,
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, i64)>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ServerError> {
    let kind: TopicKind = kind.parse()?;
    let key = TopicKey { kind, id };

    let subscription = state
        .publisher
        .subscribe(key, state.config.subscription_timeout)
        .await;
    info!(viewer = %viewer, topic = %key, subscriber = %subscription.id, "match stream opened");

    let guard = SubscriptionGuard {
        publisher: state.publisher.clone(),
        key: subscription.key,
        id: subscription.id,
    };
    let events = ReceiverStream::new(subscription.rx).map(move |scores| {
        let _held = &guard;
        matches_event(&scores)
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL)))
}

/// Completes the subscription when the response stream is dropped.
struct SubscriptionGuard {
    publisher: MatchPublisher,
    key: TopicKey,
    id: ConnectionId,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        let (publisher, key, id) = (self.publisher.clone(), self.key, self.id);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if publisher.complete(&key, id).await {
                    debug!(topic = %key, subscriber = %id, "match stream closed by viewer");
                }
            });
        }
    }
}

fn matches_event(scores: &[MatchScore]) -> Result<Event, axum::Error> {
    Event::default().event(MATCHES_EVENT).json_data(scores)
}
