//! SQLite-backed implementation of the outbox queue port.
//!
//! Provides the async adapter used by the sync layer for enqueueing,
//! snapshotting and updating outbox items with retry bookkeeping. Retry
//! eligibility is evaluated in memory against the exponential backoff
//! schedule carried by each item.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde_json::Value;
use tidemark_core::coalesce::CoalesceOutcome;
use tidemark_core::store::ports::OutboxQueue;
use tidemark_domain::constants::OUTBOX_MAX_RETRIES;
use tidemark_domain::{EngineError, NewOutboxItem, OutboxItem, OutboxOp, Result};
use tokio::task;
use tracing::warn;

use super::entity_store::map_join_error;
use super::manager::{map_sql_error, DbManager};

/// SQLite-backed outbox repository.
pub struct SqliteOutboxRepository {
    db: Arc<DbManager>,
}

impl SqliteOutboxRepository {
    /// Construct a repository backed by the shared pool manager.
    pub fn new(db: Arc<DbManager>) -> Self {
        Self { db }
    }

    fn run_blocking<T, F>(&self, work: F) -> impl std::future::Future<Output = Result<T>>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        async move {
            task::spawn_blocking(move || {
                let mut conn = db.get_connection()?;
                work(&mut conn)
            })
            .await
            .map_err(map_join_error)?
        }
    }
}

#[async_trait]
impl OutboxQueue for SqliteOutboxRepository {
    async fn enqueue(&self, item: NewOutboxItem) -> Result<i64> {
        self.run_blocking(move |conn| {
            let now = Utc::now();
            insert_outbox_item(conn, &item, now)?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    async fn list_all(&self) -> Result<Vec<OutboxItem>> {
        self.run_blocking(|conn| {
            let mut stmt = conn.prepare(OUTBOX_SELECT_ALL_SQL).map_err(map_sql_error)?;
            let items = stmt
                .query_map([], map_outbox_row)
                .map_err(map_sql_error)?
                .collect::<rusqlite::Result<Vec<OutboxItem>>>()
                .map_err(map_sql_error)?;
            Ok(items)
        })
        .await
    }

    async fn list_eligible(&self, now: DateTime<Utc>) -> Result<Vec<OutboxItem>> {
        let all = self.list_all().await?;
        Ok(all.into_iter().filter(|item| item.is_eligible(now)).collect())
    }

    async fn pending_for_entity(&self, table: &str, entity_id: &str) -> Result<Vec<OutboxItem>> {
        let table = table.to_owned();
        let entity_id = entity_id.to_owned();

        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(OUTBOX_SELECT_ENTITY_SQL).map_err(map_sql_error)?;
            let items = stmt
                .query_map(params![table, entity_id], map_outbox_row)
                .map_err(map_sql_error)?
                .collect::<rusqlite::Result<Vec<OutboxItem>>>()
                .map_err(map_sql_error)?;
            Ok(items)
        })
        .await
    }

    async fn remove(&self, seq: i64) -> Result<()> {
        self.run_blocking(move |conn| {
            conn.execute("DELETE FROM sync_outbox WHERE seq = ?1", params![seq])
                .map_err(map_sql_error)?;
            Ok(())
        })
        .await
    }

    async fn increment_retry(&self, seq: i64, now: DateTime<Utc>) -> Result<()> {
        self.run_blocking(move |conn| {
            let updated = conn
                .execute(
                    "UPDATE sync_outbox
                     SET retries = retries + 1, last_attempt_at = ?1
                     WHERE seq = ?2",
                    params![now.to_rfc3339(), seq],
                )
                .map_err(map_sql_error)?;

            if updated == 0 {
                Err(EngineError::NotFound(format!("outbox item {seq} not found")))
            } else {
                Ok(())
            }
        })
        .await
    }

    async fn apply_coalesce(&self, outcome: &CoalesceOutcome) -> Result<()> {
        if outcome.is_empty() {
            return Ok(());
        }
        let outcome = outcome.clone();

        self.run_blocking(move |conn| {
            let tx = conn.transaction().map_err(map_sql_error)?;

            for seq in &outcome.removed {
                tx.execute("DELETE FROM sync_outbox WHERE seq = ?1", params![seq])
                    .map_err(map_sql_error)?;
            }
            for patch in &outcome.patches {
                let value = encode_optional_value(patch.value.as_ref())?;
                tx.execute(
                    "UPDATE sync_outbox SET field = ?1, value = ?2 WHERE seq = ?3",
                    params![patch.field, value, patch.seq],
                )
                .map_err(map_sql_error)?;
            }

            tx.commit().map_err(map_sql_error)
        })
        .await
    }

    async fn cleanup_exhausted(&self) -> Result<Vec<(String, usize)>> {
        self.run_blocking(|conn| {
            let tx = conn.transaction().map_err(map_sql_error)?;

            let counts: Vec<(String, usize)> = {
                let mut stmt = tx
                    .prepare(
                        "SELECT tbl, COUNT(*) FROM sync_outbox
                         WHERE retries >= ?1 GROUP BY tbl",
                    )
                    .map_err(map_sql_error)?;
                let rows = stmt
                    .query_map(params![OUTBOX_MAX_RETRIES], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                    })
                    .map_err(map_sql_error)?
                    .collect::<rusqlite::Result<Vec<(String, i64)>>>()
                    .map_err(map_sql_error)?
                    .into_iter()
                    .map(|(table, count)| (table, usize::try_from(count).unwrap_or(0)))
                    .collect();
                rows
            };

            tx.execute("DELETE FROM sync_outbox WHERE retries >= ?1", params![OUTBOX_MAX_RETRIES])
                .map_err(map_sql_error)?;
            tx.commit().map_err(map_sql_error)?;

            if !counts.is_empty() {
                warn!(dropped = ?counts, "dropped outbox items that exhausted retries");
            }
            Ok(counts)
        })
        .await
    }

    async fn purge_entity(&self, table: &str, entity_id: &str) -> Result<usize> {
        let table = table.to_owned();
        let entity_id = entity_id.to_owned();

        self.run_blocking(move |conn| {
            conn.execute(
                "DELETE FROM sync_outbox WHERE tbl = ?1 AND entity_id = ?2",
                params![table, entity_id],
            )
            .map_err(map_sql_error)
        })
        .await
    }

    async fn clear(&self) -> Result<usize> {
        self.run_blocking(|conn| {
            conn.execute("DELETE FROM sync_outbox", []).map_err(map_sql_error)
        })
        .await
    }

    async fn is_empty(&self) -> Result<bool> {
        self.run_blocking(|conn| {
            let count: i64 = conn
                .query_row("SELECT COUNT(*) FROM sync_outbox", [], |row| row.get(0))
                .map_err(map_sql_error)?;
            Ok(count == 0)
        })
        .await
    }
}

const OUTBOX_SELECT_ALL_SQL: &str = "SELECT
        seq, tbl, entity_id, op, field, value, enqueued_at, retries, last_attempt_at
    FROM sync_outbox
    ORDER BY seq ASC";

const OUTBOX_SELECT_ENTITY_SQL: &str = "SELECT
        seq, tbl, entity_id, op, field, value, enqueued_at, retries, last_attempt_at
    FROM sync_outbox
    WHERE tbl = ?1 AND entity_id = ?2
    ORDER BY seq ASC";

/// Insert one intent; shared with the local store's transactional commit.
pub(crate) fn insert_outbox_item(
    conn: &Connection,
    item: &NewOutboxItem,
    now: DateTime<Utc>,
) -> Result<()> {
    let value = encode_optional_value(item.value.as_ref())?;
    conn.execute(
        "INSERT INTO sync_outbox (tbl, entity_id, op, field, value, enqueued_at, retries)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)",
        params![item.table, item.entity_id, item.op.as_str(), item.field, value, now.to_rfc3339()],
    )
    .map_err(map_sql_error)?;
    Ok(())
}

fn map_outbox_row(row: &Row<'_>) -> rusqlite::Result<OutboxItem> {
    let op_raw: String = row.get(3)?;
    let op = op_raw.parse::<OutboxOp>().unwrap_or_else(|_| {
        warn!(raw_op = %op_raw, "invalid outbox op in storage, defaulting to set");
        OutboxOp::Set
    });

    let value_raw: Option<String> = row.get(5)?;
    let value = value_raw.and_then(|raw| serde_json::from_str::<Value>(&raw).ok());

    let enqueued_raw: String = row.get(6)?;
    let enqueued_at = parse_timestamp(&enqueued_raw).unwrap_or_else(Utc::now);

    let last_attempt_raw: Option<String> = row.get(8)?;
    let last_attempt_at = last_attempt_raw.as_deref().and_then(parse_timestamp);

    Ok(OutboxItem {
        seq: row.get(0)?,
        table: row.get(1)?,
        entity_id: row.get(2)?,
        op,
        field: row.get(4)?,
        value,
        enqueued_at,
        retries: row.get(7)?,
        last_attempt_at,
    })
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw).ok().map(|parsed| parsed.with_timezone(&Utc))
}

fn encode_optional_value(value: Option<&Value>) -> Result<Option<String>> {
    value
        .map(|v| {
            serde_json::to_string(v)
                .map_err(|e| EngineError::Internal(format!("value serialisation failed: {e}")))
        })
        .transpose()
}
