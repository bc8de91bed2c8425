//! # lostlink-store
//!
//! Durable storage for the LostLink messaging core, backed by SQLite.
//!
//! The crate exposes a synchronous [`Database`] handle that wraps a
//! `rusqlite::Connection` and provides typed helpers for the message log,
//! the block registry and persisted match suggestions. Callers running on
//! an async runtime are expected to serialize access and move calls onto a
//! blocking thread.

pub mod blocks;
pub mod clock;
pub mod database;
pub mod matches;
pub mod messages;
pub mod migrations;
pub mod models;

mod error;

pub use database::Database;
pub use error::StoreError;
pub use models::*;
