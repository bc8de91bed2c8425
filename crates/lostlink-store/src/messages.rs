//! The message log: append, read back per conversation, and delivery-state
//! tracking for [`Message`] records.

use chrono::{DateTime, Utc};
use lostlink_shared::Identity;
use rusqlite::{params, Connection};

use crate::clock;
use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::Message;

const SELECT_COLUMNS: &str = "SELECT id, from_ident, to_ident, text, created_at, delivered
     FROM chat_records";

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Append a message with `delivered = false` and return it with its
    /// assigned id and timestamp.
    pub fn insert_message(&self, from: &Identity, to: &Identity, text: &str) -> Result<Message> {
        let created_at = clock::now();

        self.conn().execute(
            "INSERT INTO chat_records (from_ident, to_ident, text, created_at, delivered)
             VALUES (?1, ?2, ?3, ?4, 0)",
            params![from.as_str(), to.as_str(), text, clock::to_db_text(&created_at)],
        )?;

        Ok(Message {
            id: self.conn().last_insert_rowid(),
            from: from.clone(),
            to: to.clone(),
            text: text.to_string(),
            created_at,
            delivered: false,
        })
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    pub fn get_message(&self, id: i64) -> Result<Message> {
        self.conn()
            .query_row(
                &format!("{SELECT_COLUMNS} WHERE id = ?1"),
                params![id],
                row_to_message,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// Every message between `a` and `b` in either direction, oldest first.
    /// Ties on `created_at` are broken by id.
    pub fn conversation(&self, a: &Identity, b: &Identity) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(&format!(
            "{SELECT_COLUMNS}
             WHERE (from_ident = ?1 AND to_ident = ?2)
                OR (from_ident = ?2 AND to_ident = ?1)
             ORDER BY created_at ASC, id ASC"
        ))?;

        let rows = stmt.query_map(params![a.as_str(), b.as_str()], row_to_message)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    /// Messages addressed to `to` that no live channel has accepted yet,
    /// oldest first.
    pub fn undelivered_for(&self, to: &Identity) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(&format!(
            "{SELECT_COLUMNS}
             WHERE to_ident = ?1 AND delivered = 0
             ORDER BY created_at ASC, id ASC"
        ))?;

        let rows = stmt.query_map(params![to.as_str()], row_to_message)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    /// Every message `me` sent or received, newest first.
    pub fn messages_involving(&self, me: &Identity) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(&format!(
            "{SELECT_COLUMNS}
             WHERE from_ident = ?1 OR to_ident = ?1
             ORDER BY created_at DESC, id DESC"
        ))?;

        let rows = stmt.query_map(params![me.as_str()], row_to_message)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Flip `delivered` to true. Returns `true` only if this call changed
    /// the row; already-delivered and unknown ids are no-ops.
    pub fn mark_delivered(&self, id: i64) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE chat_records SET delivered = 1 WHERE id = ?1 AND delivered = 0",
            params![id],
        )?;
        Ok(affected > 0)
    }

    /// Mark every undelivered message from `partner` to `me` as delivered.
    /// Returns how many rows changed.
    pub fn mark_delivered_from(&self, me: &Identity, partner: &Identity) -> Result<usize> {
        let affected = self.conn().execute(
            "UPDATE chat_records SET delivered = 1
             WHERE to_ident = ?1 AND from_ident = ?2 AND delivered = 0",
            params![me.as_str(), partner.as_str()],
        )?;
        Ok(affected)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Delete the whole conversation between two identities. Runs on a plain
/// connection so it can take part in a caller's transaction.
pub(crate) fn delete_conversation(conn: &Connection, a: &Identity, b: &Identity) -> Result<usize> {
    let affected = conn.execute(
        "DELETE FROM chat_records
         WHERE (from_ident = ?1 AND to_ident = ?2)
            OR (from_ident = ?2 AND to_ident = ?1)",
        params![a.as_str(), b.as_str()],
    )?;
    Ok(affected)
}

pub(crate) fn parse_identity(idx: usize, raw: String) -> rusqlite::Result<Identity> {
    Identity::new(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

pub(crate) fn parse_timestamp(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let id: i64 = row.get(0)?;
    let from = parse_identity(1, row.get(1)?)?;
    let to = parse_identity(2, row.get(2)?)?;
    let text: String = row.get(3)?;
    let ts_str: String = row.get(4)?;
    let delivered_int: i32 = row.get(5)?;

    Ok(Message {
        id,
        from,
        to,
        text,
        created_at: parse_timestamp(4, &ts_str)?,
        delivered: delivered_int != 0,
    })
}
