//! The block registry.

use lostlink_shared::Identity;
use rusqlite::{params, OptionalExtension};

use crate::clock;
use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::messages::{delete_conversation, parse_identity, parse_timestamp};
use crate::models::BlockEdge;

impl Database {
    /// Record that `blocker` blocked `blocked` and erase their conversation.
    ///
    /// The edge insert and the message purge commit in one transaction, so
    /// no reader ever sees the edge while old messages are still present.
    /// Blocking the same identity again refreshes the reason (when one is
    /// given) and purges anything sent in between.
    pub fn block_user(
        &mut self,
        blocker: &Identity,
        blocked: &Identity,
        reason: Option<&str>,
    ) -> Result<BlockEdge> {
        let tx = self.conn_mut().transaction()?;

        tx.execute(
            "INSERT INTO user_blocks (blocker, blocked, reason, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (blocker, blocked)
             DO UPDATE SET reason = COALESCE(excluded.reason, user_blocks.reason)",
            params![
                blocker.as_str(),
                blocked.as_str(),
                reason,
                clock::to_db_text(&clock::now()),
            ],
        )?;

        let edge = tx.query_row(
            "SELECT id, blocker, blocked, reason, created_at
             FROM user_blocks WHERE blocker = ?1 AND blocked = ?2",
            params![blocker.as_str(), blocked.as_str()],
            row_to_block,
        )?;

        let purged = delete_conversation(&tx, blocker, blocked)?;
        tx.commit()?;

        tracing::info!(
            blocker = %blocker,
            blocked = %blocked,
            purged,
            "block recorded"
        );

        Ok(edge)
    }

    /// True iff an edge exists in either direction.
    pub fn is_blocked_between(&self, a: &Identity, b: &Identity) -> Result<bool> {
        let found: Option<i64> = self
            .conn()
            .query_row(
                "SELECT 1 FROM user_blocks
                 WHERE (blocker = ?1 AND blocked = ?2)
                    OR (blocker = ?2 AND blocked = ?1)
                 LIMIT 1",
                params![a.as_str(), b.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// The edge `blocker -> blocked`, if any.
    pub fn get_block(&self, blocker: &Identity, blocked: &Identity) -> Result<BlockEdge> {
        self.conn()
            .query_row(
                "SELECT id, blocker, blocked, reason, created_at
                 FROM user_blocks WHERE blocker = ?1 AND blocked = ?2",
                params![blocker.as_str(), blocked.as_str()],
                row_to_block,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }
}

fn row_to_block(row: &rusqlite::Row<'_>) -> rusqlite::Result<BlockEdge> {
    let id: i64 = row.get(0)?;
    let blocker = parse_identity(1, row.get(1)?)?;
    let blocked = parse_identity(2, row.get(2)?)?;
    let reason: Option<String> = row.get(3)?;
    let created_str: String = row.get(4)?;

    Ok(BlockEdge {
        id,
        blocker,
        blocked,
        reason,
        created_at: parse_timestamp(4, &created_str)?,
    })
}
