use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::identity::Identity;

/// Discriminator carried in the `type` field of every realtime event.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// A chat message. Clients that omit `type` are sending one of these.
    #[default]
    Message,
    /// Transient "is typing" indicator, never persisted.
    Typing,
    /// Read receipt carrying the id of the message that was read.
    Read,
    /// Server-to-client failure notice.
    Error,
}

/// The bidirectional JSON object exchanged over a chat socket:
/// `{from, to, text, id, createdAt, type, delivered}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatEvent {
    #[serde(default, rename = "type")]
    pub kind: EventKind,
    #[serde(default)]
    pub from: Option<Identity>,
    #[serde(default)]
    pub to: Option<Identity>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub delivered: bool,
}

impl ChatEvent {
    /// Parse a frame sent by a client.
    ///
    /// Server-assigned fields are discarded: `createdAt` and `delivered`
    /// always, `id` unless the event is a read receipt (where it names the
    /// message being acknowledged). `from` is left for the caller to
    /// overwrite with the connection's identity.
    pub fn parse_inbound(raw: &str) -> Result<Self, ProtocolError> {
        let mut event: ChatEvent = serde_json::from_str(raw)?;
        event.created_at = None;
        event.delivered = false;
        if event.kind != EventKind::Read {
            event.id = None;
        }
        Ok(event)
    }

    /// A persisted chat message as pushed to recipients and echoed to the sender.
    pub fn message(
        id: i64,
        from: Identity,
        to: Identity,
        text: String,
        created_at: DateTime<Utc>,
        delivered: bool,
    ) -> Self {
        Self {
            kind: EventKind::Message,
            from: Some(from),
            to: Some(to),
            text: Some(text),
            id: Some(id),
            created_at: Some(created_at),
            delivered,
        }
    }

    /// An `error` event addressed to `to` (always the connection's own identity).
    pub fn error(to: Identity, text: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Error,
            from: None,
            to: Some(to),
            text: Some(text.into()),
            id: None,
            created_at: None,
            delivered: false,
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// One ranked candidate in a `matches` stream event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MatchScore {
    pub found_item_id: i64,
    pub lost_item_id: i64,
    /// Cosine similarity in `[-1, 1]`; `-1` when no comparable embedding exists.
    pub score: f64,
}
