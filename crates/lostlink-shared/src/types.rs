use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ProtocolError;

/// Identifies one live channel (a socket or a stream) inside the server.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which side of a lost/found pair a topic follows.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TopicKind {
    Found,
    Lost,
}

impl TopicKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TopicKind::Found => "found",
            TopicKind::Lost => "lost",
        }
    }
}

impl FromStr for TopicKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "found" => Ok(Self::Found),
            "lost" => Ok(Self::Lost),
            other => Err(ProtocolError::InvalidTopic(other.to_string())),
        }
    }
}

/// A `(type, entity id)` key that stream subscribers register against,
/// rendered as `found:42` / `lost:7`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TopicKey {
    pub kind: TopicKind,
    pub id: i64,
}

impl TopicKey {
    pub fn found(id: i64) -> Self {
        Self {
            kind: TopicKind::Found,
            id,
        }
    }

    pub fn lost(id: i64) -> Self {
        Self {
            kind: TopicKind::Lost,
            id,
        }
    }
}

impl fmt::Display for TopicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}

impl FromStr for TopicKey {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| ProtocolError::InvalidTopic(s.to_string()))?;
        let id = id
            .parse::<i64>()
            .map_err(|_| ProtocolError::InvalidTopic(s.to_string()))?;
        Ok(Self {
            kind: kind.parse()?,
            id,
        })
    }
}
