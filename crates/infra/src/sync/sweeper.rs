//! Tombstone sweeper.
//!
//! Soft-deleted rows are kept long enough for every device to observe the
//! deletion, then hard-deleted locally and on the backend. The sweep runs
//! cooperatively from the sync engine, at most once per day.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::Value;
use tidemark_core::store::ports::LocalStore;
use tidemark_core::RemoteAdapter;
use tidemark_domain::entity;
use tidemark_domain::{EngineConfig, Filter, Result};
use tracing::{info, warn};

/// Outcome of one sweep.
#[derive(Debug, Clone, Default)]
pub struct SweepStats {
    /// Rows hard-deleted locally.
    pub local_deleted: usize,
    /// Rows hard-deleted on the backend.
    pub remote_deleted: usize,
}

/// Cooperative tombstone sweeper.
pub struct TombstoneSweeper {
    config: Arc<EngineConfig>,
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteAdapter>,
}

impl TombstoneSweeper {
    /// Sweeper over the engine's store and adapter.
    pub fn new(
        config: Arc<EngineConfig>,
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteAdapter>,
    ) -> Self {
        Self { config, store, remote }
    }

    /// Hard-delete tombstones older than the retention window, locally
    /// first, then remotely. Remote failures are logged per table; the
    /// sweep continues.
    pub async fn sweep_once(&self) -> Result<SweepStats> {
        let cutoff = Utc::now() - Duration::days(i64::from(self.config.tombstone_max_age_days));
        let cutoff_value = Value::String(cutoff.to_rfc3339());
        let mut stats = SweepStats::default();

        for table in &self.config.tables {
            let purged = self.store.purge_tombstones(&table.remote_name, cutoff).await?;
            stats.local_deleted += purged;

            let filters = vec![
                Filter::eq(entity::DELETED, Value::Bool(true)),
                Filter::lt(entity::UPDATED_AT, cutoff_value.clone()),
            ];
            match self.remote.delete_where(&table.remote_name, &filters).await {
                Ok(ids) => stats.remote_deleted += ids.len(),
                Err(error) => {
                    warn!(
                        table = %table.remote_name,
                        error = %error,
                        "remote tombstone sweep failed"
                    );
                }
            }
        }

        if stats.local_deleted > 0 || stats.remote_deleted > 0 {
            info!(
                local = stats.local_deleted,
                remote = stats.remote_deleted,
                "tombstone sweep completed"
            );
        }

        Ok(stats)
    }
}
