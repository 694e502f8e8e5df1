//! SQLite-backed implementation of the local store port.
//!
//! Entity rows are stored as JSON payloads with the engine-managed columns
//! mirrored for indexing. [`SqliteLocalStore::commit`] applies a whole write
//! batch, entity rows, outbox intents, conflict history and key-value
//! entries, inside one transaction, so a local write is never visible
//! without its queued intent.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde_json::Value;
use tidemark_core::store::ports::{LocalStore, WriteBatch};
use tidemark_domain::entity;
use tidemark_domain::{EngineConfig, EngineError, Entity, Result};
use tokio::task;

use super::history_repository::insert_history_entry;
use super::manager::{map_sql_error, validated_table_name, DbManager};
use super::outbox_repository::insert_outbox_item;

/// SQLite-backed local store.
pub struct SqliteLocalStore {
    db: Arc<DbManager>,
    config: Arc<EngineConfig>,
}

impl SqliteLocalStore {
    /// Construct a store backed by the shared pool manager.
    pub fn new(db: Arc<DbManager>, config: Arc<EngineConfig>) -> Self {
        Self { db, config }
    }

    fn local_table(&self, remote_name: &str) -> Result<String> {
        let table = self
            .config
            .table(remote_name)
            .ok_or_else(|| EngineError::InvalidInput(format!("table not configured: {remote_name}")))?;
        validated_table_name(table.local_name())
    }

    fn run_blocking<T, F>(&self, work: F) -> impl std::future::Future<Output = Result<T>>
    where
        T: Send + 'static,
        F: FnOnce(DbHandle) -> Result<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        async move {
            task::spawn_blocking(move || {
                let conn = db.get_connection()?;
                work(DbHandle { conn })
            })
            .await
            .map_err(map_join_error)?
        }
    }
}

/// Connection wrapper handed to blocking closures.
struct DbHandle {
    conn: super::manager::DbConnection,
}

#[async_trait]
impl LocalStore for SqliteLocalStore {
    async fn get(&self, table: &str, id: &str) -> Result<Option<Entity>> {
        let local = self.local_table(table)?;
        let id = id.to_owned();

        self.run_blocking(move |handle| {
            let sql = format!("SELECT payload FROM \"{local}\" WHERE id = ?1");
            let payload: Option<String> = handle
                .conn
                .query_row(&sql, params![id], |row| row.get(0))
                .map(Some)
                .or_else(ignore_missing_row)
                .map_err(map_sql_error)?;

            payload.map(|raw| parse_entity(&raw)).transpose()
        })
        .await
    }

    async fn get_all(&self, table: &str, order_by: Option<&str>) -> Result<Vec<Entity>> {
        let local = self.local_table(table)?;
        let order_by = order_by.map(str::to_owned);

        self.run_blocking(move |handle| {
            let sql = match &order_by {
                Some(_) => format!(
                    "SELECT payload FROM \"{local}\" ORDER BY json_extract(payload, ?1) ASC"
                ),
                None => format!("SELECT payload FROM \"{local}\" ORDER BY id ASC"),
            };

            let mut stmt = handle.conn.prepare(&sql).map_err(map_sql_error)?;
            let rows = match &order_by {
                Some(field) => stmt
                    .query_map(params![format!("$.{field}")], |row| row.get::<_, String>(0))
                    .map_err(map_sql_error)?
                    .collect::<rusqlite::Result<Vec<String>>>(),
                None => stmt
                    .query_map([], |row| row.get::<_, String>(0))
                    .map_err(map_sql_error)?
                    .collect::<rusqlite::Result<Vec<String>>>(),
            }
            .map_err(map_sql_error)?;

            rows.iter().map(|raw| parse_entity(raw)).collect()
        })
        .await
    }

    async fn query_equals(&self, table: &str, field: &str, value: &Value) -> Result<Vec<Entity>> {
        let local = self.local_table(table)?;
        let path = format!("$.{field}");
        let encoded = encode_value(value)?;

        self.run_blocking(move |handle| {
            let sql = format!(
                "SELECT payload FROM \"{local}\"
                 WHERE json_extract(payload, ?1) = json_extract(?2, '$')
                 ORDER BY id ASC"
            );
            collect_entities(&handle.conn, &sql, params![path, encoded])
        })
        .await
    }

    async fn query_range(
        &self,
        table: &str,
        field: &str,
        low: &Value,
        high: &Value,
    ) -> Result<Vec<Entity>> {
        let local = self.local_table(table)?;
        let path = format!("$.{field}");
        let low = encode_value(low)?;
        let high = encode_value(high)?;

        self.run_blocking(move |handle| {
            let sql = format!(
                "SELECT payload FROM \"{local}\"
                 WHERE json_extract(payload, ?1) >= json_extract(?2, '$')
                   AND json_extract(payload, ?1) <= json_extract(?3, '$')
                 ORDER BY json_extract(payload, ?1) ASC"
            );
            collect_entities(&handle.conn, &sql, params![path, low, high])
        })
        .await
    }

    async fn updated_after(&self, table: &str, cursor: DateTime<Utc>) -> Result<Vec<Entity>> {
        let local = self.local_table(table)?;
        let cursor = cursor.to_rfc3339();

        self.run_blocking(move |handle| {
            let sql = format!(
                "SELECT payload FROM \"{local}\"
                 WHERE updated_at > ?1
                 ORDER BY updated_at ASC, id ASC"
            );
            collect_entities(&handle.conn, &sql, params![cursor])
        })
        .await
    }

    async fn count(&self, table: &str) -> Result<u64> {
        let local = self.local_table(table)?;

        self.run_blocking(move |handle| {
            let sql = format!("SELECT COUNT(*) FROM \"{local}\"");
            handle.conn.query_row(&sql, [], |row| row.get::<_, u64>(0)).map_err(map_sql_error)
        })
        .await
    }

    async fn purge_tombstones(&self, table: &str, cutoff: DateTime<Utc>) -> Result<usize> {
        let local = self.local_table(table)?;
        let cutoff = cutoff.to_rfc3339();

        self.run_blocking(move |handle| {
            let sql = format!("DELETE FROM \"{local}\" WHERE deleted = 1 AND updated_at < ?1");
            handle.conn.execute(&sql, params![cutoff]).map_err(map_sql_error)
        })
        .await
    }

    async fn commit(&self, batch: WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        // Resolve and validate table names before entering the transaction.
        let mut puts = Vec::with_capacity(batch.puts.len());
        for put in batch.puts {
            puts.push((self.local_table(&put.table)?, put.entity));
        }
        let mut hard_deletes = Vec::with_capacity(batch.hard_deletes.len());
        for (table, id) in batch.hard_deletes {
            hard_deletes.push((self.local_table(&table)?, id));
        }

        let enqueues = batch.enqueues;
        let outbox_removes = batch.outbox_removes;
        let history = batch.history;
        let kv_puts = batch.kv_puts;

        self.run_blocking(move |mut handle| {
            let tx = handle.conn.transaction().map_err(map_sql_error)?;
            let now = Utc::now();

            for (local, entity) in &puts {
                upsert_entity(&tx, local, entity)?;
            }
            for (local, id) in &hard_deletes {
                let sql = format!("DELETE FROM \"{local}\" WHERE id = ?1");
                tx.execute(&sql, params![id]).map_err(map_sql_error)?;
            }
            for item in &enqueues {
                insert_outbox_item(&tx, item, now)?;
            }
            for seq in &outbox_removes {
                tx.execute("DELETE FROM sync_outbox WHERE seq = ?1", params![seq])
                    .map_err(map_sql_error)?;
            }
            for entry in &history {
                insert_history_entry(&tx, entry)?;
            }
            for (key, value) in &kv_puts {
                tx.execute(
                    "INSERT INTO engine_kv (key, value) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    params![key, value],
                )
                .map_err(map_sql_error)?;
            }

            tx.commit().map_err(map_sql_error)
        })
        .await
    }
}

/// Upsert one entity row, mirroring the indexed columns from the payload.
pub(crate) fn upsert_entity(conn: &Connection, local: &str, row: &Entity) -> Result<()> {
    let id = entity::id(row)
        .ok_or_else(|| EngineError::InvalidInput("entity is missing an id".to_string()))?;
    let payload = serde_json::to_string(row)
        .map_err(|e| EngineError::Internal(format!("payload serialisation failed: {e}")))?;
    let updated_at = entity::updated_at(row).unwrap_or_else(Utc::now).to_rfc3339();
    let deleted = i32::from(entity::is_deleted(row));
    let device_id = entity::device_id(row);

    let sql = format!(
        "INSERT INTO \"{local}\" (id, payload, updated_at, deleted, device_id)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(id) DO UPDATE SET
            payload = excluded.payload,
            updated_at = excluded.updated_at,
            deleted = excluded.deleted,
            device_id = excluded.device_id"
    );
    conn.execute(&sql, params![id, payload, updated_at, deleted, device_id])
        .map_err(map_sql_error)?;
    Ok(())
}

fn collect_entities(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<Entity>> {
    let mut stmt = conn.prepare(sql).map_err(map_sql_error)?;
    let rows = stmt
        .query_map(params, |row| row.get::<_, String>(0))
        .map_err(map_sql_error)?
        .collect::<rusqlite::Result<Vec<String>>>()
        .map_err(map_sql_error)?;

    rows.iter().map(|raw| parse_entity(raw)).collect()
}

fn parse_entity(raw: &str) -> Result<Entity> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(EngineError::Database("entity payload is not an object".to_string())),
        Err(e) => Err(EngineError::Database(format!("entity payload parse failed: {e}"))),
    }
}

fn encode_value(value: &Value) -> Result<String> {
    serde_json::to_string(value)
        .map_err(|e| EngineError::InvalidInput(format!("unencodable query value: {e}")))
}

fn ignore_missing_row<T>(err: rusqlite::Error) -> rusqlite::Result<Option<T>> {
    match err {
        rusqlite::Error::QueryReturnedNoRows => Ok(None),
        other => Err(other),
    }
}

pub(crate) fn map_join_error(err: task::JoinError) -> EngineError {
    if err.is_cancelled() {
        EngineError::Internal("database task cancelled".into())
    } else {
        EngineError::Internal(format!("database task panic: {err}"))
    }
}
