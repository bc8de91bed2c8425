use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// A participant in a conversation, as handed over by the auth layer.
///
/// In the deployed system this is an email address. The value is trimmed
/// and lowercased on construction, so two identities compare equal (and
/// hash equal) whenever their raw strings differ only in case.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identity(String);

impl Identity {
    /// Normalize a raw identity string.
    ///
    /// Fails with [`ProtocolError::EmptyIdentity`] when nothing but
    /// whitespace is left.
    pub fn new(raw: &str) -> Result<Self, ProtocolError> {
        let normalized = raw.trim().to_lowercase();
        if normalized.is_empty() {
            return Err(ProtocolError::EmptyIdentity);
        }
        Ok(Self(normalized))
    }

    /// Normalize an optional raw value, treating `None` as unauthenticated.
    pub fn from_optional(raw: Option<&str>) -> Result<Self, ProtocolError> {
        raw.map(Self::new).unwrap_or(Err(ProtocolError::EmptyIdentity))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Identity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Identity {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<Identity> for String {
    fn from(identity: Identity) -> Self {
        identity.0
    }
}

impl std::str::FromStr for Identity {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}
