//! Domain model structs persisted in the SQLite database.
//!
//! Every struct derives `Serialize` so it can be handed directly to the
//! REST layer. Field names follow the camelCase wire convention.

use chrono::{DateTime, Utc};
use lostlink_shared::{ChatEvent, Identity, MatchScore};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A single chat message in the log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Auto-assigned, strictly increasing row id.
    pub id: i64,
    pub from: Identity,
    pub to: Identity,
    pub text: String,
    /// Server clock at persist time (monotonic per process).
    pub created_at: DateTime<Utc>,
    /// Whether the message reached at least one live channel of `to`.
    /// Only ever flips from `false` to `true`.
    pub delivered: bool,
}

impl Message {
    /// The other party, seen from `me`.
    pub fn partner_of(&self, me: &Identity) -> &Identity {
        if &self.from == me {
            &self.to
        } else {
            &self.from
        }
    }

    /// Render as a realtime `message` event.
    pub fn to_event(&self) -> ChatEvent {
        ChatEvent::message(
            self.id,
            self.from.clone(),
            self.to.clone(),
            self.text.clone(),
            self.created_at,
            self.delivered,
        )
    }
}

// ---------------------------------------------------------------------------
// Block edge
// ---------------------------------------------------------------------------

/// A moderation edge: `blocker` no longer wants contact with `blocked`.
/// Queried as an undirected relation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BlockEdge {
    pub id: i64,
    pub blocker: Identity,
    pub blocked: Identity,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Match suggestion
// ---------------------------------------------------------------------------

/// A persisted result of one match analysis run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MatchSuggestion {
    pub id: i64,
    pub found_item_id: i64,
    pub lost_item_id: i64,
    pub score: f64,
    pub created_at: DateTime<Utc>,
}

impl From<&MatchSuggestion> for MatchScore {
    fn from(s: &MatchSuggestion) -> Self {
        MatchScore {
            found_item_id: s.found_item_id,
            lost_item_id: s.lost_item_id,
            score: s.score,
        }
    }
}
