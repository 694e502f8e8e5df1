//! SQLite-backed implementation of the conflict history port.
//!
//! Audit rows are append-only; a background prune drops rows past the
//! retention window. Persistence failures never block merge application,
//! so callers treat append errors as log-and-continue.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde_json::Value;
use tidemark_core::store::ports::ConflictHistoryStore;
use tidemark_domain::{
    ConflictHistoryEntry, ConflictStrategy, ConflictWinner, EngineError, Result,
};
use tokio::task;

use super::entity_store::map_join_error;
use super::manager::{map_sql_error, DbManager};

/// SQLite-backed conflict audit store.
pub struct SqliteHistoryRepository {
    db: Arc<DbManager>,
}

impl SqliteHistoryRepository {
    /// Construct a repository backed by the shared pool manager.
    pub fn new(db: Arc<DbManager>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ConflictHistoryStore for SqliteHistoryRepository {
    async fn append(&self, entries: &[ConflictHistoryEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let db = Arc::clone(&self.db);
        let entries = entries.to_vec();

        task::spawn_blocking(move || -> Result<()> {
            let mut conn = db.get_connection()?;
            let tx = conn.transaction().map_err(map_sql_error)?;
            for entry in &entries {
                insert_history_entry(&tx, entry)?;
            }
            tx.commit().map_err(map_sql_error)
        })
        .await
        .map_err(map_join_error)?
    }

    async fn list_for_entity(
        &self,
        table: &str,
        entity_id: &str,
    ) -> Result<Vec<ConflictHistoryEntry>> {
        let db = Arc::clone(&self.db);
        let table = table.to_owned();
        let entity_id = entity_id.to_owned();

        task::spawn_blocking(move || -> Result<Vec<ConflictHistoryEntry>> {
            let conn = db.get_connection()?;
            let mut stmt = conn
                .prepare(
                    "SELECT seq, tbl, entity_id, field, local_value, remote_value,
                            resolved_value, winner, strategy, at
                     FROM conflict_history
                     WHERE tbl = ?1 AND entity_id = ?2
                     ORDER BY seq ASC",
                )
                .map_err(map_sql_error)?;
            let result = stmt
                .query_map(params![table, entity_id], map_history_row)
                .map_err(map_sql_error)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(map_sql_error);
            result
        })
        .await
        .map_err(map_join_error)?
    }

    async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let db = Arc::clone(&self.db);
        let cutoff = cutoff.to_rfc3339();

        task::spawn_blocking(move || -> Result<usize> {
            let conn = db.get_connection()?;
            conn.execute("DELETE FROM conflict_history WHERE at < ?1", params![cutoff])
                .map_err(map_sql_error)
        })
        .await
        .map_err(map_join_error)?
    }
}

/// Insert one audit row; shared with the local store's transactional commit.
pub(crate) fn insert_history_entry(conn: &Connection, entry: &ConflictHistoryEntry) -> Result<()> {
    conn.execute(
        "INSERT INTO conflict_history (
            tbl, entity_id, field, local_value, remote_value, resolved_value,
            winner, strategy, at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            entry.table,
            entry.entity_id,
            entry.field,
            encode_value(&entry.local_value)?,
            encode_value(&entry.remote_value)?,
            encode_value(&entry.resolved_value)?,
            entry.winner.as_str(),
            entry.strategy.as_str(),
            entry.at.to_rfc3339(),
        ],
    )
    .map_err(map_sql_error)?;
    Ok(())
}

fn map_history_row(row: &Row<'_>) -> rusqlite::Result<ConflictHistoryEntry> {
    let winner_raw: String = row.get(7)?;
    let strategy_raw: String = row.get(8)?;
    let at_raw: String = row.get(9)?;

    Ok(ConflictHistoryEntry {
        seq: row.get(0)?,
        table: row.get(1)?,
        entity_id: row.get(2)?,
        field: row.get(3)?,
        local_value: decode_value(row.get::<_, String>(4)?),
        remote_value: decode_value(row.get::<_, String>(5)?),
        resolved_value: decode_value(row.get::<_, String>(6)?),
        winner: parse_winner(&winner_raw),
        strategy: parse_strategy(&strategy_raw),
        at: DateTime::parse_from_rfc3339(&at_raw)
            .map(|parsed| parsed.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

fn parse_winner(raw: &str) -> ConflictWinner {
    match raw {
        "local" => ConflictWinner::Local,
        "merged" => ConflictWinner::Merged,
        _ => ConflictWinner::Remote,
    }
}

fn parse_strategy(raw: &str) -> ConflictStrategy {
    match raw {
        "delete_wins" => ConflictStrategy::DeleteWins,
        "local_pending" => ConflictStrategy::LocalPending,
        "numeric_merge" => ConflictStrategy::NumericMerge,
        _ => ConflictStrategy::LastWrite,
    }
}

fn encode_value(value: &Value) -> Result<String> {
    serde_json::to_string(value)
        .map_err(|e| EngineError::Internal(format!("value serialisation failed: {e}")))
}

fn decode_value(raw: String) -> Value {
    serde_json::from_str(&raw).unwrap_or(Value::Null)
}
