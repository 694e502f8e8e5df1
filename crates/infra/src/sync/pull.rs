//! Pull phase of the sync cycle.
//!
//! Every configured table is selected in parallel for rows newer than the
//! effective cursor, and all results are applied inside one transaction
//! together with conflict history and the cursor advance. Rows shielded by
//! the recently-modified or realtime-dedup guards are skipped, but their
//! timestamps still advance the cursor.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tidemark_core::conflict::resolve_conflict;
use tidemark_core::store::ports::WriteBatch;
use tidemark_domain::constants::CURSOR_KEY_PREFIX;
use tidemark_domain::entity;
use tidemark_domain::{ConflictHistoryEntry, EngineError, Entity, Result};
use tracing::{debug, info};

use super::engine::SyncEngineDeps;

/// Result of one pull attempt.
#[derive(Debug, Default)]
pub(crate) struct PullOutcome {
    /// Remote rows applied locally.
    pub pulled: usize,
    /// Cursor value stored by this attempt, when it advanced.
    pub cursor_advanced_to: Option<DateTime<Utc>>,
}

/// Key-value key of one user's cursor.
pub(crate) fn cursor_key(user_id: &str) -> String {
    format!("{CURSOR_KEY_PREFIX}{user_id}")
}

/// Run one pull attempt for one user.
///
/// The application is all-or-nothing: a failing select fails the whole
/// attempt, and every local write of the attempt rides one transaction.
pub(crate) async fn run_pull(
    deps: &SyncEngineDeps,
    user_id: &str,
    effective_cursor: Option<DateTime<Utc>>,
) -> Result<PullOutcome> {
    let selects = deps.config.tables.iter().map(|table| {
        let remote = std::sync::Arc::clone(&deps.remote);
        let remote_name = table.remote_name.clone();
        let columns = table.columns.clone();
        async move {
            let rows = remote.select(&remote_name, &columns, effective_cursor, &[]).await;
            (remote_name, rows)
        }
    });

    let mut batch = WriteBatch::new();
    let mut pulled = 0_usize;
    let mut max_seen: Option<DateTime<Utc>> = None;

    for (table_name, result) in join_all(selects).await {
        let rows = result.map_err(|e| EngineError::Network(format!("pull select failed: {e}")))?;
        if rows.is_empty() {
            continue;
        }
        debug!(table = %table_name, count = rows.len(), "pull returned rows");

        for row in rows {
            if let Some(at) = entity::updated_at(&row) {
                max_seen = Some(max_seen.map_or(at, |current| current.max(at)));
            }

            if apply_row(deps, &table_name, row, &mut batch).await? {
                pulled += 1;
            }
        }
    }

    let mut advanced = None;
    if let Some(max_seen) = max_seen {
        if effective_cursor.map_or(true, |cursor| max_seen > cursor) {
            batch.set_kv(cursor_key(user_id), max_seen.to_rfc3339());
            advanced = Some(max_seen);
        }
    }

    if !batch.is_empty() {
        deps.store.commit(batch).await?;
    }

    if pulled > 0 {
        info!(pulled, "pull applied remote rows");
    }

    Ok(PullOutcome { pulled, cursor_advanced_to: advanced })
}

/// Decide how one remote row lands locally; returns whether it was applied.
async fn apply_row(
    deps: &SyncEngineDeps,
    table_name: &str,
    row: Entity,
    batch: &mut WriteBatch,
) -> Result<bool> {
    let Some(entity_id) = entity::id(&row).map(str::to_string) else {
        debug!(table = %table_name, "pulled row without an id skipped");
        return Ok(false);
    };

    // Fresh local writes and rows just applied by realtime are shielded.
    if deps.recently_modified.contains(&entity_id) {
        return Ok(false);
    }
    if deps.recently_processed.contains(&entity_id) {
        return Ok(false);
    }

    let Some(local) = deps.store.get(table_name, &entity_id).await? else {
        batch.put(table_name, row);
        return Ok(true);
    };

    if entity::updated_at(&row) <= entity::updated_at(&local) {
        return Ok(false);
    }

    let pending = deps.outbox.pending_for_entity(table_name, &entity_id).await?;
    if pending.is_empty() {
        batch.put(table_name, row);
        return Ok(true);
    }

    let Some(table_config) = deps.config.table(table_name) else {
        return Ok(false);
    };
    let resolution = resolve_conflict(table_config, Some(&local), &row, &pending);
    let at = Utc::now();
    let history: Vec<ConflictHistoryEntry> = resolution
        .field_resolutions
        .iter()
        .map(|r| ConflictHistoryEntry::from_resolution(table_name, &entity_id, r, at))
        .collect();

    batch.put(table_name, resolution.merged_entity);
    batch.append_history(history);
    Ok(true)
}
