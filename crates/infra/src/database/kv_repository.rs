//! SQLite-backed implementation of the key-value port.
//!
//! Holds the per-user sync cursor and the device identifier.

use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::params;
use tidemark_core::store::ports::KeyValueStore;
use tidemark_domain::Result;
use tokio::task;

use super::entity_store::map_join_error;
use super::manager::{map_sql_error, DbManager};

/// SQLite-backed key-value repository.
pub struct SqliteKvRepository {
    db: Arc<DbManager>,
}

impl SqliteKvRepository {
    /// Construct a repository backed by the shared pool manager.
    pub fn new(db: Arc<DbManager>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl KeyValueStore for SqliteKvRepository {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let db = Arc::clone(&self.db);
        let key = key.to_owned();

        task::spawn_blocking(move || -> Result<Option<String>> {
            let conn = db.get_connection()?;
            match conn.query_row(
                "SELECT value FROM engine_kv WHERE key = ?1",
                params![key],
                |row| row.get(0),
            ) {
                Ok(value) => Ok(Some(value)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(other) => Err(map_sql_error(other)),
            }
        })
        .await
        .map_err(map_join_error)?
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let db = Arc::clone(&self.db);
        let key = key.to_owned();
        let value = value.to_owned();

        task::spawn_blocking(move || -> Result<()> {
            let conn = db.get_connection()?;
            conn.execute(
                "INSERT INTO engine_kv (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )
            .map_err(map_sql_error)?;
            Ok(())
        })
        .await
        .map_err(map_join_error)?
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let db = Arc::clone(&self.db);
        let key = key.to_owned();

        task::spawn_blocking(move || -> Result<()> {
            let conn = db.get_connection()?;
            conn.execute("DELETE FROM engine_kv WHERE key = ?1", params![key])
                .map_err(map_sql_error)?;
            Ok(())
        })
        .await
        .map_err(map_join_error)?
    }
}
