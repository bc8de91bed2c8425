//! The chat coordinator: persists messages, enforces blocks, tracks
//! delivery state and builds conversation summaries.
//!
//! Live pushes go through the [`ConnectionRegistry`]. Forced disconnects
//! after a block are left to the caller.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use lostlink_shared::constants::MAX_MESSAGE_TEXT;
use lostlink_shared::{ChatEvent, EventKind, Identity};
use lostlink_store::{BlockEdge, Message};
use serde::Serialize;
use tracing::{debug, warn};

use crate::db::Db;
use crate::error::ServerError;
use crate::registry::ConnectionRegistry;

/// One row of a user's inbox, derived from the message log on every call.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub partner_identity: Identity,
    pub last_text: String,
    pub last_at: DateTime<Utc>,
    pub unread_count: u64,
    pub last_outgoing_undelivered: bool,
}

#[derive(Clone)]
pub struct ChatService {
    db: Db,
    registry: ConnectionRegistry,
}

impl ChatService {
    pub fn new(db: Db, registry: ConnectionRegistry) -> Self {
        Self { db, registry }
    }

    /// Persist and push a chat message.
    ///
    /// Fails with [`ServerError::Blocked`] without persisting anything when
    /// either party blocked the other. Otherwise the returned message
    /// carries its delivery state as of return.
    pub async fn send(
        &self,
        from: &Identity,
        to: &Identity,
        text: &str,
    ) -> Result<Message, ServerError> {
        if text.len() > MAX_MESSAGE_TEXT {
            return Err(ServerError::BadRequest(format!(
                "message text exceeds {MAX_MESSAGE_TEXT} bytes"
            )));
        }

        // Block check and insert share one store call so a concurrent block
        // cannot slip between them.
        let (f, t, body) = (from.clone(), to.clone(), text.to_string());
        let stored = self
            .db
            .call(move |db| {
                if db.is_blocked_between(&f, &t)? {
                    return Ok(None);
                }
                db.insert_message(&f, &t, &body).map(Some)
            })
            .await?;
        let Some(mut message) = stored else {
            debug!(from = %from, to = %to, "send rejected by block");
            return Err(ServerError::Blocked);
        };

        let report = self.registry.deliver(to, message.to_event()).await;
        if report.any_accepted() {
            let id = message.id;
            match self.db.call(move |db| db.mark_delivered(id)).await {
                Ok(_) => message.delivered = true,
                Err(e) => warn!(message = id, error = %e, "failed to record delivery"),
            }
        }

        debug!(
            id = message.id,
            from = %from,
            to = %to,
            delivered = message.delivered,
            "message sent"
        );
        Ok(message)
    }

    /// Both directions of the conversation, oldest first.
    pub async fn conversation(
        &self,
        a: &Identity,
        b: &Identity,
    ) -> Result<Vec<Message>, ServerError> {
        let (a, b) = (a.clone(), b.clone());
        self.db.call(move |db| db.conversation(&a, &b)).await
    }

    pub async fn undelivered_for(&self, identity: &Identity) -> Result<Vec<Message>, ServerError> {
        let identity = identity.clone();
        self.db.call(move |db| db.undelivered_for(&identity)).await
    }

    /// Idempotent; unknown ids are ignored.
    pub async fn mark_delivered(&self, message_id: i64) -> Result<bool, ServerError> {
        self.db.call(move |db| db.mark_delivered(message_id)).await
    }

    pub async fn mark_delivered_for_conversation(
        &self,
        me: &Identity,
        partner: &Identity,
    ) -> Result<usize, ServerError> {
        let (me, partner) = (me.clone(), partner.clone());
        self.db
            .call(move |db| db.mark_delivered_from(&me, &partner))
            .await
    }

    /// Inbox for `me`, most recently active conversation first.
    pub async fn list_conversations(
        &self,
        me: &Identity,
    ) -> Result<Vec<ConversationSummary>, ServerError> {
        let owner = me.clone();
        let messages = self
            .db
            .call(move |db| db.messages_involving(&owner))
            .await?;
        Ok(summarize(me, &messages))
    }

    pub async fn is_blocked_between(
        &self,
        a: &Identity,
        b: &Identity,
    ) -> Result<bool, ServerError> {
        let (a, b) = (a.clone(), b.clone());
        self.db.call(move |db| db.is_blocked_between(&a, &b)).await
    }

    /// Record the block and erase the pair's history in one transaction.
    pub async fn block_user(
        &self,
        blocker: &Identity,
        blocked: &Identity,
        reason: Option<&str>,
    ) -> Result<BlockEdge, ServerError> {
        if blocker == blocked {
            return Err(ServerError::BadRequest("cannot block yourself".into()));
        }
        let (blocker, blocked) = (blocker.clone(), blocked.clone());
        let reason = reason.map(str::to_string);
        self.db
            .call(move |db| db.block_user(&blocker, &blocked, reason.as_deref()))
            .await
    }

    /// Forward a typing event to its recipient's live channels, as sent
    /// apart from `from`, which is set to the sender's identity. Never
    /// persisted; dropped when the recipient is offline or `to` is missing.
    ///
    /// Typing indicators and read receipts are not block-checked: they
    /// carry no content and are never stored.
    pub async fn forward_typing(&self, from: &Identity, mut event: ChatEvent) -> bool {
        let Some(to) = event.to.clone() else {
            return false;
        };
        event.kind = EventKind::Typing;
        event.from = Some(from.clone());
        self.registry.deliver(&to, event).await.any_accepted()
    }

    /// Record a read receipt for `message_id` and forward it to `to`.
    ///
    /// The forward is best effort and happens even when recording fails.
    pub async fn acknowledge_read(&self, from: &Identity, to: &Identity, message_id: i64) {
        if let Err(e) = self.mark_delivered(message_id).await {
            warn!(message = message_id, error = %e, "failed to record read receipt");
        }
        let event = ChatEvent {
            kind: EventKind::Read,
            from: Some(from.clone()),
            to: Some(to.clone()),
            text: None,
            id: Some(message_id),
            created_at: None,
            delivered: true,
        };
        self.registry.deliver(to, event).await;
    }
}

/// Fold `messages` (newest first) into one summary per partner, ordered by
/// each conversation's latest message.
pub fn summarize(me: &Identity, messages: &[Message]) -> Vec<ConversationSummary> {
    let mut order: Vec<ConversationSummary> = Vec::new();
    let mut index: HashMap<&Identity, usize> = HashMap::new();

    for message in messages {
        let partner = message.partner_of(me);
        let slot = match index.get(partner) {
            Some(&slot) => slot,
            None => {
                index.insert(partner, order.len());
                order.push(ConversationSummary {
                    partner_identity: partner.clone(),
                    last_text: message.text.clone(),
                    last_at: message.created_at,
                    unread_count: 0,
                    last_outgoing_undelivered: &message.from == me && !message.delivered,
                });
                order.len() - 1
            }
        };

        if &message.to == me && !message.delivered {
            order[slot].unread_count += 1;
        }
    }

    order
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use lostlink_store::Database;

    use super::*;

    fn id(s: &str) -> Identity {
        Identity::new(s).unwrap()
    }

    fn service() -> (ChatService, ConnectionRegistry) {
        let registry = ConnectionRegistry::new(16);
        let chat = ChatService::new(
            Db::new(Database::open_in_memory().unwrap()),
            registry.clone(),
        );
        (chat, registry)
    }

    #[tokio::test]
    async fn test_offline_recipient_stays_undelivered() {
        let (chat, _) = service();
        let a = id("a@campus.edu");
        let b = id("b@campus.edu");

        let sent = chat.send(&a, &b, "found your wallet").await.unwrap();
        assert!(!sent.delivered);

        let pending = chat.undelivered_for(&b).await.unwrap();
        assert_eq!(pending, vec![sent]);
    }

    #[tokio::test]
    async fn test_online_recipient_gets_push_and_delivered_flag() {
        let (chat, registry) = service();
        let a = id("a@campus.edu");
        let b = id("b@campus.edu");
        let (tx, mut rx) = registry.channel();
        registry.register(&b, tx).await;

        let sent = chat.send(&a, &b, "hi").await.unwrap();
        assert!(sent.delivered);

        let pushed = rx.recv().await.unwrap();
        assert_eq!(pushed.id, Some(sent.id));
        assert_eq!(pushed.text.as_deref(), Some("hi"));
        assert!(chat.undelivered_for(&b).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_block_scenario() {
        let (chat, _) = service();
        let a = id("a@campus.edu");
        let b = id("b@campus.edu");

        chat.send(&a, &b, "1").await.unwrap();
        chat.send(&b, &a, "2").await.unwrap();
        chat.send(&a, &b, "3").await.unwrap();
        assert_eq!(chat.conversation(&a, &b).await.unwrap().len(), 3);

        let edge = chat.block_user(&a, &b, Some("harassment")).await.unwrap();
        assert_eq!(edge.reason.as_deref(), Some("harassment"));
        assert!(chat.conversation(&a, &b).await.unwrap().is_empty());
        assert!(chat.is_blocked_between(&b, &a).await.unwrap());

        let err = chat.send(&b, &a, "hello?").await.unwrap_err();
        assert!(matches!(err, ServerError::Blocked));
        assert!(chat.undelivered_for(&a).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_self_block_rejected() {
        let (chat, _) = service();
        let a = id("a@campus.edu");
        assert!(matches!(
            chat.block_user(&a, &a, None).await,
            Err(ServerError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_mark_delivered_twice_equals_once() {
        let (chat, _) = service();
        let a = id("a@campus.edu");
        let b = id("b@campus.edu");
        let sent = chat.send(&a, &b, "x").await.unwrap();

        assert!(chat.mark_delivered(sent.id).await.unwrap());
        assert!(!chat.mark_delivered(sent.id).await.unwrap());
        assert!(!chat.mark_delivered(424_242).await.unwrap());
        assert!(chat.conversation(&a, &b).await.unwrap()[0].delivered);
    }

    #[tokio::test]
    async fn test_list_conversations() {
        let (chat, _) = service();
        let me = id("me@campus.edu");
        let p = id("p@campus.edu");
        let q = id("q@campus.edu");

        chat.send(&p, &me, "p1").await.unwrap();
        chat.send(&p, &me, "p2").await.unwrap();
        chat.send(&me, &q, "q1").await.unwrap();

        let inbox = chat.list_conversations(&me).await.unwrap();
        assert_eq!(inbox.len(), 2);

        assert_eq!(inbox[0].partner_identity, q);
        assert_eq!(inbox[0].last_text, "q1");
        assert_eq!(inbox[0].unread_count, 0);
        assert!(inbox[0].last_outgoing_undelivered);

        assert_eq!(inbox[1].partner_identity, p);
        assert_eq!(inbox[1].last_text, "p2");
        assert_eq!(inbox[1].unread_count, 2);
        assert!(!inbox[1].last_outgoing_undelivered);

        assert_eq!(chat.mark_delivered_for_conversation(&me, &p).await.unwrap(), 2);
        let inbox = chat.list_conversations(&me).await.unwrap();
        assert_eq!(inbox[1].unread_count, 0);
    }

    #[tokio::test]
    async fn test_typing_and_read_forwarding() {
        let (chat, registry) = service();
        let a = id("a@campus.edu");
        let b = id("b@campus.edu");

        let typing = ChatEvent {
            kind: EventKind::Typing,
            from: None,
            to: Some(b.clone()),
            text: None,
            id: None,
            created_at: None,
            delivered: false,
        };
        assert!(!chat.forward_typing(&a, typing).await);

        let (tx, mut rx) = registry.channel();
        registry.register(&a, tx).await;
        let sent = chat.send(&a, &b, "are you there").await.unwrap();

        chat.acknowledge_read(&b, &a, sent.id).await;
        let receipt = rx.recv().await.unwrap();
        assert_eq!(receipt.kind, EventKind::Read);
        assert_eq!(receipt.id, Some(sent.id));
        assert!(chat.undelivered_for(&b).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_forward_typing_keeps_payload_and_overwrites_sender() {
        let (chat, registry) = service();
        let a = id("a@campus.edu");
        let b = id("b@campus.edu");
        let (tx, mut rx) = registry.channel();
        registry.register(&b, tx).await;

        let typing = ChatEvent {
            kind: EventKind::Typing,
            from: Some(id("mallory@x.org")),
            to: Some(b.clone()),
            text: Some("composing".into()),
            id: None,
            created_at: None,
            delivered: false,
        };
        assert!(chat.forward_typing(&a, typing.clone()).await);

        let forwarded = rx.recv().await.unwrap();
        assert_eq!(forwarded.from, Some(a.clone()));
        assert_eq!(forwarded.text.as_deref(), Some("composing"));
        assert_eq!(forwarded.to, typing.to);

        let no_recipient = ChatEvent { to: None, ..typing };
        assert!(!chat.forward_typing(&a, no_recipient).await);
    }

    #[tokio::test]
    async fn test_typing_passes_between_blocked_pair() {
        let (chat, registry) = service();
        let a = id("a@campus.edu");
        let b = id("b@campus.edu");
        chat.block_user(&b, &a, None).await.unwrap();
        let (tx, mut rx) = registry.channel();
        registry.register(&b, tx).await;

        let typing = ChatEvent {
            kind: EventKind::Typing,
            from: None,
            to: Some(b.clone()),
            text: None,
            id: None,
            created_at: None,
            delivered: false,
        };
        assert!(chat.forward_typing(&a, typing).await);
        assert_eq!(rx.recv().await.unwrap().kind, EventKind::Typing);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_mark_delivered_flips_once() {
        let (chat, _) = service();
        let a = id("a@campus.edu");
        let b = id("b@campus.edu");
        let message_id = chat.send(&a, &b, "x").await.unwrap().id;

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let chat = chat.clone();
                tokio::spawn(async move { chat.mark_delivered(message_id).await.unwrap() })
            })
            .collect();

        let mut flipped = 0;
        for task in tasks {
            if task.await.unwrap() {
                flipped += 1;
            }
        }
        assert_eq!(flipped, 1);
        assert!(chat.undelivered_for(&b).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_send_racing_force_disconnect_keeps_delivery_honest() {
        let (chat, registry) = service();
        let a = id("a@campus.edu");
        let b = id("b@campus.edu");
        let (tx, mut rx) = registry.channel();
        registry.register(&b, tx).await;

        // Fewer than the channel buffer, so a skipped push can only mean
        // the channel was already closed.
        let sender = {
            let (chat, a, b) = (chat.clone(), a.clone(), b.clone());
            tokio::spawn(async move {
                let mut sent = Vec::new();
                for i in 0..12 {
                    sent.push(chat.send(&a, &b, &format!("m{i}")).await.unwrap());
                }
                sent
            })
        };
        tokio::task::yield_now().await;
        registry.force_disconnect(&[&b]).await;
        let sent = sender.await.unwrap();

        let mut received = HashSet::new();
        while let Some(event) = rx.recv().await {
            received.extend(event.id);
        }
        let delivered: HashSet<i64> = sent.iter().filter(|m| m.delivered).map(|m| m.id).collect();
        assert_eq!(received, delivered);

        let pending: Vec<i64> = chat
            .undelivered_for(&b)
            .await
            .unwrap()
            .iter()
            .map(|m| m.id)
            .collect();
        let expected: Vec<i64> = sent.iter().filter(|m| !m.delivered).map(|m| m.id).collect();
        assert_eq!(pending, expected);
    }

    #[test]
    fn test_summarize_counts_only_incoming_unread() {
        let me = id("me@x.org");
        let p = id("p@x.org");
        let now = Utc::now();
        let msg = |id: i64, from: &Identity, to: &Identity, delivered: bool| Message {
            id,
            from: from.clone(),
            to: to.clone(),
            text: format!("m{id}"),
            created_at: now,
            delivered,
        };

        // newest first
        let messages = vec![
            msg(3, &me, &p, false),
            msg(2, &p, &me, false),
            msg(1, &p, &me, true),
        ];
        let inbox = summarize(&me, &messages);
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].last_text, "m3");
        assert_eq!(inbox[0].unread_count, 1);
        assert!(inbox[0].last_outgoing_undelivered);
    }
}
