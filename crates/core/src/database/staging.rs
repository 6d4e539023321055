//! Query-scoped staging tables.
//!
//! `batch` holds identifier working sets, `scores` holds one averaged
//! similarity score per section id. Both are connection-local temp tables.
//!
//! Ordering rules:
//! - staging batch 0 empties the whole table first, later batch indexes
//!   append, so several similarity clauses of one query share the table and
//!   nothing carries over from the previous query;
//! - `scores` is always cleared and repopulated as a whole.

use crate::ann::Neighbor;
use crate::error::Result;
use rusqlite::{params, Connection};
use std::collections::HashMap;

pub(crate) const CREATE_BATCH: &str =
    "CREATE TEMP TABLE IF NOT EXISTS batch (id INTEGER, uid TEXT, batch INTEGER)";
pub(crate) const CREATE_SCORES: &str =
    "CREATE TEMP TABLE IF NOT EXISTS scores (id INTEGER PRIMARY KEY, score REAL)";

/// Identifiers to stage. Exactly one column of a batch row is populated.
#[derive(Debug, Clone, Copy)]
pub enum Keys<'a> {
    /// Section ids, used for similarity results.
    Ids(&'a [i64]),
    /// Document uids, used for deletes and lookups by external key.
    Uids(&'a [String]),
}

/// Stages `keys` under batch `index`.
pub fn batch(conn: &Connection, keys: Keys<'_>, index: usize) -> Result<()> {
    conn.execute(CREATE_BATCH, [])?;
    if index == 0 {
        conn.execute("DELETE FROM batch", [])?;
    }

    let index = index as i64;
    match keys {
        Keys::Ids(ids) => {
            let mut stmt = conn.prepare_cached("INSERT INTO batch (id, batch) VALUES (?1, ?2)")?;
            for id in ids {
                stmt.execute(params![id, index])?;
            }
            tracing::debug!("Staged {} ids into batch {}", ids.len(), index);
        }
        Keys::Uids(uids) => {
            let mut stmt =
                conn.prepare_cached("INSERT INTO batch (uid, batch) VALUES (?1, ?2)")?;
            for uid in uids {
                stmt.execute(params![uid, index])?;
            }
            tracing::debug!("Staged {} uids into batch {}", uids.len(), index);
        }
    }
    Ok(())
}

/// Per-id similarity scores gathered across the clauses of one query.
#[derive(Debug, Default)]
pub struct ScoreAccumulator {
    scores: HashMap<i64, Vec<f32>>,
}

impl ScoreAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one clause's hits. Existing ids gain another score, never a replacement.
    pub fn extend(&mut self, hits: &[Neighbor]) {
        for &(id, score) in hits {
            self.scores.entry(i64::from(id)).or_default().push(score);
        }
    }

    /// Mean score per id, in ascending id order.
    pub fn averages(&self) -> Vec<(i64, f64)> {
        let mut averages: Vec<(i64, f64)> = self
            .scores
            .iter()
            .map(|(&id, scores)| {
                let sum: f64 = scores.iter().map(|&s| f64::from(s)).sum();
                (id, sum / scores.len() as f64)
            })
            .collect();
        averages.sort_unstable_by_key(|&(id, _)| id);
        averages
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }
}

/// Replaces the contents of `scores` with the accumulated averages.
pub fn scores(conn: &Connection, accumulator: &ScoreAccumulator) -> Result<()> {
    clear_scores(conn)?;
    let mut stmt = conn.prepare_cached("INSERT INTO scores (id, score) VALUES (?1, ?2)")?;
    let averages = accumulator.averages();
    for (id, score) in &averages {
        stmt.execute(params![id, score])?;
    }
    tracing::debug!("Staged {} scores", averages.len());
    Ok(())
}

/// Empties `scores` so a non-similarity query never sees stale values.
pub fn clear_scores(conn: &Connection) -> Result<()> {
    conn.execute(CREATE_SCORES, [])?;
    conn.execute("DELETE FROM scores", [])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch_rows(conn: &Connection) -> Vec<(Option<i64>, Option<String>, i64)> {
        let mut stmt = conn
            .prepare("SELECT id, uid, batch FROM batch ORDER BY rowid")
            .unwrap();
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();
        rows
    }

    #[test]
    fn test_average_across_clauses() {
        let mut acc = ScoreAccumulator::new();
        acc.extend(&[(1, 0.8), (2, 0.5)]);
        acc.extend(&[(1, 0.6)]);
        let averages = acc.averages();
        assert_eq!(averages.len(), 2);
        assert_eq!(averages[0].0, 1);
        assert!((averages[0].1 - 0.7).abs() < 1e-6);
        assert!((averages[1].1 - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_batch_zero_clears_table_later_batches_append() {
        let conn = Connection::open_in_memory().unwrap();
        batch(&conn, Keys::Ids(&[1, 2]), 0).unwrap();
        batch(&conn, Keys::Ids(&[3]), 1).unwrap();
        batch(&conn, Keys::Ids(&[4]), 1).unwrap();
        assert_eq!(batch_rows(&conn).len(), 4);

        batch(&conn, Keys::Uids(&["a".to_string()]), 0).unwrap();
        assert_eq!(batch_rows(&conn), vec![(None, Some("a".to_string()), 0)]);
    }

    #[test]
    fn test_scores_replace_previous_contents() {
        let conn = Connection::open_in_memory().unwrap();
        let mut acc = ScoreAccumulator::new();
        acc.extend(&[(7, 0.9)]);
        scores(&conn, &acc).unwrap();

        let mut acc = ScoreAccumulator::new();
        acc.extend(&[(1, 0.8)]);
        acc.extend(&[(1, 0.6)]);
        scores(&conn, &acc).unwrap();

        let rows: Vec<(i64, f64)> = conn
            .prepare("SELECT id, score FROM scores")
            .unwrap()
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0, 1);
        assert!((rows[0].1 - 0.7).abs() < 1e-6);

        clear_scores(&conn).unwrap();
        let count: i64 = conn
            .query_row("SELECT count(*) FROM scores", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
