//! Persisted match suggestions produced by the analysis workers.

use lostlink_shared::{MatchScore, TopicKey, TopicKind};
use rusqlite::params;

use crate::clock;
use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::messages::parse_timestamp;
use crate::models::MatchSuggestion;

impl Database {
    /// Store one analysis run's ranked scores in a single transaction.
    pub fn save_match_suggestions(
        &mut self,
        scores: &[MatchScore],
    ) -> Result<Vec<MatchSuggestion>> {
        let created_at = clock::now();
        let created_text = clock::to_db_text(&created_at);
        let tx = self.conn_mut().transaction()?;

        let mut saved = Vec::with_capacity(scores.len());
        for score in scores {
            tx.execute(
                "INSERT INTO match_suggestions (found_item_id, lost_item_id, score, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![score.found_item_id, score.lost_item_id, score.score, created_text],
            )?;
            saved.push(MatchSuggestion {
                id: tx.last_insert_rowid(),
                found_item_id: score.found_item_id,
                lost_item_id: score.lost_item_id,
                score: score.score,
                created_at,
            });
        }

        tx.commit()?;
        Ok(saved)
    }

    /// Suggestions recorded for the item behind `topic`, best score first.
    pub fn suggestions_for(&self, topic: &TopicKey) -> Result<Vec<MatchSuggestion>> {
        let column = match topic.kind {
            TopicKind::Found => "found_item_id",
            TopicKind::Lost => "lost_item_id",
        };
        let mut stmt = self.conn().prepare(&format!(
            "SELECT id, found_item_id, lost_item_id, score, created_at
             FROM match_suggestions
             WHERE {column} = ?1
             ORDER BY score DESC, id ASC"
        ))?;

        let rows = stmt.query_map(params![topic.id], row_to_suggestion)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }
}

fn row_to_suggestion(row: &rusqlite::Row<'_>) -> rusqlite::Result<MatchSuggestion> {
    let created_str: String = row.get(4)?;
    Ok(MatchSuggestion {
        id: row.get(0)?,
        found_item_id: row.get(1)?,
        lost_item_id: row.get(2)?,
        score: row.get(3)?,
        created_at: parse_timestamp(4, &created_str)?,
    })
}
