//! v001 -- Initial schema creation.
//!
//! Creates the message log (`chat_records`) and the block registry
//! (`user_blocks`).

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Message log
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS chat_records (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,  -- never reused
    from_ident  TEXT NOT NULL,                      -- lowercase identity
    to_ident    TEXT NOT NULL,
    text        TEXT NOT NULL,
    created_at  TEXT NOT NULL,                      -- RFC-3339, fixed-width micros
    delivered   INTEGER NOT NULL DEFAULT 0          -- boolean 0/1, only ever 0 -> 1
);

CREATE INDEX IF NOT EXISTS idx_chat_pair
    ON chat_records(from_ident, to_ident, created_at, id);

CREATE INDEX IF NOT EXISTS idx_chat_undelivered
    ON chat_records(to_ident, delivered, created_at, id);

-- ----------------------------------------------------------------
-- Block registry
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS user_blocks (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    blocker     TEXT NOT NULL,
    blocked     TEXT NOT NULL,
    reason      TEXT,
    created_at  TEXT NOT NULL,

    UNIQUE (blocker, blocked)
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
