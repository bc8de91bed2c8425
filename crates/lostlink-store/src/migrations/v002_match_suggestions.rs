use rusqlite::Connection;

const UP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS match_suggestions (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    found_item_id  INTEGER NOT NULL,
    lost_item_id   INTEGER NOT NULL,
    score          REAL NOT NULL,             -- cosine similarity in [-1, 1]
    created_at     TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_match_found ON match_suggestions(found_item_id, score DESC);
CREATE INDEX IF NOT EXISTS idx_match_lost ON match_suggestions(lost_item_id, score DESC);
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
