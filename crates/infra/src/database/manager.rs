//! Database connection manager backed by a pooled SQLite handle.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use tidemark_domain::{EngineConfig, EngineError, Result};
use tracing::{info, warn};

const SCHEMA_VERSION: i32 = 1;
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Bookkeeping tables every healthy database must contain.
const REQUIRED_TABLES: [&str; 3] = ["sync_outbox", "conflict_history", "engine_kv"];

/// Pooled connection type handed to repositories.
pub type DbConnection = PooledConnection<SqliteConnectionManager>;

/// Database manager wrapping an r2d2 SQLite pool.
pub struct DbManager {
    pool: Arc<Pool<SqliteConnectionManager>>,
    path: PathBuf,
}

impl DbManager {
    /// Create a manager for the database file with the given pool size.
    pub fn new<P: AsRef<Path>>(db_path: P, pool_size: u32) -> Result<Self> {
        let path = db_path.as_ref().to_path_buf();

        let manager = SqliteConnectionManager::file(&path).with_init(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
            )
        });

        let pool = Pool::builder()
            .max_size(pool_size.max(1))
            .build(manager)
            .map_err(|e| EngineError::Database(format!("pool initialisation failed: {e}")))?;

        info!(
            db_path = %path.display(),
            max_connections = pool.max_size(),
            "sqlite pool initialised"
        );

        Ok(Self { pool: Arc::new(pool), path })
    }

    /// Create a manager over a private in-memory database. The pool is
    /// pinned to one connection so every caller sees the same data.
    pub fn in_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory().with_init(|conn| {
            conn.execute_batch("PRAGMA foreign_keys = ON;")
        });

        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e| EngineError::Database(format!("pool initialisation failed: {e}")))?;

        Ok(Self { pool: Arc::new(pool), path: PathBuf::from(":memory:") })
    }

    /// Acquire a connection from the pool.
    pub fn get_connection(&self) -> Result<DbConnection> {
        self.pool
            .get()
            .map_err(|e| EngineError::StoreUnavailable(format!("connection unavailable: {e}")))
    }

    /// Ensure the bookkeeping schema and every configured entity table
    /// exist.
    pub fn run_migrations(&self, config: &EngineConfig) -> Result<()> {
        let conn = self.get_connection()?;

        conn.execute_batch(SCHEMA_SQL).map_err(map_sql_error)?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_version (version, applied_at)
             VALUES (?, CAST(strftime('%s','now') AS INTEGER))",
            params![SCHEMA_VERSION],
        )
        .map_err(map_sql_error)?;

        for table in &config.tables {
            let local = validated_table_name(table.local_name())?;
            conn.execute_batch(&entity_table_sql(&local)).map_err(map_sql_error)?;
        }

        Ok(())
    }

    /// Return the configured database path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Verify connectivity and the presence of every required table.
    ///
    /// A missing table reads as local corruption and surfaces as
    /// [`EngineError::StoreUnavailable`]; the caller may then [`Self::reset`].
    pub fn health_check(&self, config: &EngineConfig) -> Result<()> {
        let conn = self.get_connection()?;

        conn.query_row("SELECT 1", params![], |row| row.get::<_, i32>(0))
            .map_err(|e| EngineError::StoreUnavailable(format!("database unresponsive: {e}")))?;

        let mut expected: Vec<String> =
            REQUIRED_TABLES.iter().map(|t| (*t).to_string()).collect();
        for table in &config.tables {
            expected.push(table.local_name().to_string());
        }

        for name in expected {
            let present: bool = conn
                .query_row(
                    "SELECT EXISTS (SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
                    params![name],
                    |row| row.get(0),
                )
                .map_err(map_sql_error)?;

            if !present {
                return Err(EngineError::StoreUnavailable(format!("missing table: {name}")));
            }
        }

        Ok(())
    }

    /// Drop every engine table and recreate the schema from scratch.
    pub fn reset(&self, config: &EngineConfig) -> Result<()> {
        warn!(db_path = %self.path.display(), "resetting local database");

        let conn = self.get_connection()?;
        for name in REQUIRED_TABLES {
            conn.execute_batch(&format!("DROP TABLE IF EXISTS {name};")).map_err(map_sql_error)?;
        }
        conn.execute_batch("DROP TABLE IF EXISTS schema_version;").map_err(map_sql_error)?;
        for table in &config.tables {
            let local = validated_table_name(table.local_name())?;
            conn.execute_batch(&format!("DROP TABLE IF EXISTS \"{local}\";"))
                .map_err(map_sql_error)?;
        }
        drop(conn);

        self.run_migrations(config)
    }
}

/// Reject table names that cannot be embedded as SQL identifiers.
pub fn validated_table_name(name: &str) -> Result<String> {
    let valid = !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.chars().next().is_some_and(|c| c.is_ascii_digit());

    if valid {
        Ok(name.to_string())
    } else {
        Err(EngineError::InvalidInput(format!("invalid table name: {name}")))
    }
}

fn entity_table_sql(local: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS \"{local}\" (
            id TEXT PRIMARY KEY,
            payload TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            deleted INTEGER NOT NULL DEFAULT 0,
            device_id TEXT
        );
        CREATE INDEX IF NOT EXISTS \"idx_{local}_updated_at\" ON \"{local}\" (updated_at);
        CREATE INDEX IF NOT EXISTS \"idx_{local}_deleted\" ON \"{local}\" (deleted);"
    )
}

pub(crate) fn map_sql_error(err: rusqlite::Error) -> EngineError {
    EngineError::Database(err.to_string())
}
