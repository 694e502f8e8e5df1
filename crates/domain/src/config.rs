//! Engine configuration structures

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_ONLINE_RECONNECT_COOLDOWN_MS, DEFAULT_SYNC_DEBOUNCE_MS, DEFAULT_SYNC_INTERVAL_MS,
    DEFAULT_TOMBSTONE_MAX_AGE_DAYS, DEFAULT_VISIBILITY_SYNC_MIN_AWAY_MS,
};

/// Per-table sync configuration.
///
/// The remote name is canonical; the local table name may differ via
/// `local_name`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableConfig {
    /// Table name on the backend.
    pub remote_name: String,
    /// Local table name override; defaults to `remote_name`.
    pub local_name: Option<String>,
    /// Columns pulled from the backend: `"*"` or a comma-separated list.
    pub columns: String,
    /// Tables enforcing one row per user; duplicate-key pushes reconcile ids.
    pub is_singleton: bool,
    /// Fields never considered during conflict resolution.
    pub exclude_from_conflict: Vec<String>,
    /// Fields reserved for additive merge. Currently resolved last-write.
    pub numeric_merge_fields: Vec<String>,
}

impl TableConfig {
    /// Create a table configuration with defaults for the given remote name.
    pub fn new(remote_name: impl Into<String>) -> Self {
        Self {
            remote_name: remote_name.into(),
            local_name: None,
            columns: "*".to_string(),
            is_singleton: false,
            exclude_from_conflict: Vec::new(),
            numeric_merge_fields: Vec::new(),
        }
    }

    /// Override the local table name.
    pub fn with_local_name(mut self, name: impl Into<String>) -> Self {
        self.local_name = Some(name.into());
        self
    }

    /// Restrict the pulled column set.
    pub fn with_columns(mut self, columns: impl Into<String>) -> Self {
        self.columns = columns.into();
        self
    }

    /// Mark the table as one-row-per-user.
    pub fn singleton(mut self) -> Self {
        self.is_singleton = true;
        self
    }

    /// Exclude fields from conflict resolution.
    pub fn with_exclude_from_conflict(mut self, fields: Vec<String>) -> Self {
        self.exclude_from_conflict = fields;
        self
    }

    /// Declare numeric-merge candidate fields.
    pub fn with_numeric_merge_fields(mut self, fields: Vec<String>) -> Self {
        self.numeric_merge_fields = fields;
        self
    }

    /// Effective local table name.
    pub fn local_name(&self) -> &str {
        self.local_name.as_deref().unwrap_or(&self.remote_name)
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Namespace prefix for persistent keys and channel names.
    pub prefix: String,
    /// Synced tables.
    pub tables: Vec<TableConfig>,
    /// Debounce window after a local write before sync fires.
    pub sync_debounce: Duration,
    /// Interval between periodic full syncs.
    pub sync_interval: Duration,
    /// Age after which tombstones are hard-deleted on both sides.
    pub tombstone_max_age_days: u32,
    /// Minimum hidden duration before visibility schedules a sync.
    pub visibility_sync_min_away: Duration,
    /// Cooldown between reconnect-triggered syncs.
    pub online_reconnect_cooldown: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            prefix: "tidemark".to_string(),
            tables: Vec::new(),
            sync_debounce: Duration::from_millis(DEFAULT_SYNC_DEBOUNCE_MS),
            sync_interval: Duration::from_millis(DEFAULT_SYNC_INTERVAL_MS),
            tombstone_max_age_days: DEFAULT_TOMBSTONE_MAX_AGE_DAYS,
            visibility_sync_min_away: Duration::from_millis(DEFAULT_VISIBILITY_SYNC_MIN_AWAY_MS),
            online_reconnect_cooldown: Duration::from_millis(DEFAULT_ONLINE_RECONNECT_COOLDOWN_MS),
        }
    }
}

impl EngineConfig {
    /// Validate configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        if self.prefix.is_empty() {
            return Err("Prefix must not be empty".to_string());
        }

        if self.tables.is_empty() {
            return Err("At least one table must be configured".to_string());
        }

        if self.tombstone_max_age_days == 0 {
            return Err("Tombstone max age must be at least one day".to_string());
        }

        let mut seen = std::collections::HashSet::new();
        for table in &self.tables {
            if table.remote_name.is_empty() {
                return Err("Table remote name must not be empty".to_string());
            }
            if !seen.insert(table.remote_name.clone()) {
                return Err(format!("Duplicate table configuration: {}", table.remote_name));
            }
        }

        Ok(())
    }

    /// Look up a table configuration by remote name.
    pub fn table(&self, remote_name: &str) -> Option<&TableConfig> {
        self.tables.iter().find(|t| t.remote_name == remote_name)
    }

    /// Remote names of all configured tables.
    pub fn remote_names(&self) -> Vec<String> {
        self.tables.iter().map(|t| t.remote_name.clone()).collect()
    }
}
