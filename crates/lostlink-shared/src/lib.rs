//! # lostlink-shared
//!
//! Types shared by the LostLink store and server crates: the normalized
//! participant [`Identity`], the realtime wire protocol, topic keys for the
//! match stream, and protocol-level errors.

pub mod constants;
pub mod error;
pub mod identity;
pub mod protocol;
pub mod types;

pub use error::ProtocolError;
pub use identity::Identity;
pub use protocol::{ChatEvent, EventKind, MatchScore};
pub use types::{ConnectionId, TopicKey, TopicKind};
