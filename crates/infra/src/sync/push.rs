//! Push phase of the sync cycle.
//!
//! The outbox is coalesced in place, then the eligible items are translated
//! into backend mutations in queue order. Every mutation asks the backend to
//! return the affected id, so a write silently dropped by row-level
//! authorization is detected rather than assumed applied. Failures are
//! per-item: one bad item never aborts the phase.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tidemark_core::coalesce::coalesce;
use tidemark_core::store::ports::WriteBatch;
use tidemark_core::RemoteError;
use tidemark_domain::entity;
use tidemark_domain::{Entity, Filter, OutboxItem, OutboxOp, Result, TableConfig};
use tracing::{debug, info, warn};

use super::engine::SyncEngineDeps;

/// One item that failed to push in this phase.
#[derive(Debug)]
pub(crate) struct PushFailure {
    /// Failed item's queue position.
    pub seq: i64,
    /// Table the item targets.
    pub table: String,
    /// Classified failure.
    pub error: RemoteError,
    /// Whether this failure should reach the user now: persistent errors
    /// immediately, transient ones after three attempts.
    pub surface: bool,
}

/// Result of one push phase.
#[derive(Debug, Default)]
pub(crate) struct PushOutcome {
    /// Items attempted this phase.
    pub attempted: usize,
    /// Items acknowledged and removed.
    pub pushed: usize,
    /// Per-item failures.
    pub failures: Vec<PushFailure>,
    /// Items dropped after exhausting retries, as `(table, count)`.
    pub exhausted: Vec<(String, usize)>,
    /// Latest `updated_at` among pushed rows; seeds the pull cursor.
    pub max_pushed_updated_at: Option<DateTime<Utc>>,
}

impl PushOutcome {
    /// Whether every attempted item was acknowledged.
    pub fn all_succeeded(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Run the push phase for one user.
pub(crate) async fn run_push(deps: &SyncEngineDeps, user_id: &str) -> Result<PushOutcome> {
    let mut outcome = PushOutcome::default();

    outcome.exhausted = deps.outbox.cleanup_exhausted().await?;

    let snapshot = deps.outbox.list_all().await?;
    let reduction = coalesce(&snapshot);
    if !reduction.is_empty() {
        debug!(
            removed = reduction.removed.len(),
            patched = reduction.patches.len(),
            "outbox coalesced"
        );
        deps.outbox.apply_coalesce(&reduction).await?;
    }

    let eligible = deps.outbox.list_eligible(Utc::now()).await?;
    if eligible.is_empty() {
        return Ok(outcome);
    }

    info!(count = eligible.len(), "pushing outbox items");
    outcome.attempted = eligible.len();

    for item in eligible {
        match push_item(deps, user_id, &item).await {
            Ok(pushed_at) => {
                deps.outbox.remove(item.seq).await?;
                outcome.pushed += 1;
                outcome.max_pushed_updated_at = match (outcome.max_pushed_updated_at, pushed_at) {
                    (Some(current), Some(new)) => Some(current.max(new)),
                    (current, new) => current.or(new),
                };
            }
            Err(error) => {
                deps.outbox.increment_retry(item.seq, Utc::now()).await?;
                let retries_after = item.retries + 1;
                let surface = !error.is_transient() || retries_after >= 3;
                warn!(
                    seq = item.seq,
                    table = %item.table,
                    retries = retries_after,
                    error = %error,
                    "outbox item push failed"
                );
                outcome.failures.push(PushFailure {
                    seq: item.seq,
                    table: item.table.clone(),
                    error,
                    surface,
                });
            }
        }
    }

    Ok(outcome)
}

/// Translate one intent into a backend mutation.
///
/// Returns the `updated_at` the backend row now carries, when known.
async fn push_item(
    deps: &SyncEngineDeps,
    user_id: &str,
    item: &OutboxItem,
) -> std::result::Result<Option<DateTime<Utc>>, RemoteError> {
    let table = deps
        .config
        .table(&item.table)
        .ok_or_else(|| RemoteError::Config(format!("table not configured: {}", item.table)))?;

    match item.op {
        OutboxOp::Create => push_create(deps, table, user_id, item).await,
        OutboxOp::Set => push_set(deps, table, user_id, item).await,
        OutboxOp::Increment => push_increment(deps, item).await,
        OutboxOp::Delete => push_delete(deps, item).await,
    }
}

async fn push_create(
    deps: &SyncEngineDeps,
    table: &TableConfig,
    user_id: &str,
    item: &OutboxItem,
) -> std::result::Result<Option<DateTime<Utc>>, RemoteError> {
    let Some(Value::Object(payload)) = &item.value else {
        return Err(RemoteError::Config("create intent without a payload".to_string()));
    };

    let mut row = payload.clone();
    entity::set_device_id(&mut row, deps.device.as_str());
    if !row.contains_key(entity::USER_ID) {
        row.insert(entity::USER_ID.to_string(), Value::String(user_id.to_string()));
    }
    let pushed_at = entity::updated_at(&row);

    match deps.remote.insert_returning_id(&item.table, &row).await {
        Ok(Some(_)) => Ok(pushed_at),
        Ok(None) => {
            Err(RemoteError::PolicyDenied("insert was silently refused".to_string()))
        }
        Err(RemoteError::DuplicateKey(detail)) => {
            if table.is_singleton {
                reconcile_singleton(deps, table, user_id, &item.entity_id, Some(&row)).await?;
                Ok(pushed_at)
            } else {
                debug!(entity_id = %item.entity_id, detail = %detail, "duplicate create treated as success");
                Ok(pushed_at)
            }
        }
        Err(other) => Err(other),
    }
}

async fn push_set(
    deps: &SyncEngineDeps,
    table: &TableConfig,
    user_id: &str,
    item: &OutboxItem,
) -> std::result::Result<Option<DateTime<Utc>>, RemoteError> {
    let mut patch = set_patch(item)?;
    if !patch.contains_key(entity::UPDATED_AT) {
        entity::set_updated_at(&mut patch, Utc::now());
    }
    entity::set_device_id(&mut patch, deps.device.as_str());
    let pushed_at = entity::updated_at(&patch);

    if deps.remote.update_returning_id(&item.table, &item.entity_id, &patch).await?.is_some() {
        return Ok(pushed_at);
    }

    if table.is_singleton {
        if let Some(new_id) =
            reconcile_singleton(deps, table, user_id, &item.entity_id, None).await?
        {
            if deps.remote.update_returning_id(&item.table, &new_id, &patch).await?.is_some() {
                return Ok(pushed_at);
            }
        }
    }

    Err(RemoteError::PolicyDenied("push_blocked: update affected no rows".to_string()))
}

/// Push the current local value as a snapshot. Additive merging across
/// devices is not provided; the intent collapses to a state write here.
async fn push_increment(
    deps: &SyncEngineDeps,
    item: &OutboxItem,
) -> std::result::Result<Option<DateTime<Utc>>, RemoteError> {
    let Some(field) = &item.field else {
        return Err(RemoteError::Config("increment intent without a field".to_string()));
    };

    let local = deps
        .store
        .get(&item.table, &item.entity_id)
        .await
        .map_err(store_error)?;
    let Some(local) = local else {
        // The entity vanished locally; there is nothing left to push.
        debug!(entity_id = %item.entity_id, "increment target gone, dropping intent");
        return Ok(None);
    };

    let target = entity::numeric(&local, field).unwrap_or(0.0);
    let updated_at = entity::updated_at(&local).unwrap_or_else(Utc::now);

    let mut patch = Map::new();
    patch.insert(field.clone(), entity::number(target));
    entity::set_updated_at(&mut patch, updated_at);
    entity::set_device_id(&mut patch, deps.device.as_str());

    match deps.remote.update_returning_id(&item.table, &item.entity_id, &patch).await? {
        Some(_) => Ok(Some(updated_at)),
        None => Err(RemoteError::PolicyDenied("push_blocked: update affected no rows".to_string())),
    }
}

async fn push_delete(
    deps: &SyncEngineDeps,
    item: &OutboxItem,
) -> std::result::Result<Option<DateTime<Utc>>, RemoteError> {
    let now = Utc::now();
    let mut patch = Map::new();
    entity::set_deleted(&mut patch, true);
    entity::set_updated_at(&mut patch, now);
    entity::set_device_id(&mut patch, deps.device.as_str());

    // No affected row means the entity is already gone; deletion is
    // idempotent.
    let _ = deps.remote.update_returning_id(&item.table, &item.entity_id, &patch).await?;
    Ok(Some(now))
}

/// Re-point a singleton entity at the row the backend already holds.
///
/// The backend row is looked up by owner, the pending payload is merged
/// onto it, the local row is re-keyed and every queued item for the stale
/// id is purged.
async fn reconcile_singleton(
    deps: &SyncEngineDeps,
    table: &TableConfig,
    user_id: &str,
    old_id: &str,
    pending_payload: Option<&Entity>,
) -> std::result::Result<Option<String>, RemoteError> {
    let filters = vec![Filter::eq(entity::USER_ID, Value::String(user_id.to_string()))];
    let rows = deps.remote.select(&table.remote_name, &table.columns, None, &filters).await?;

    let Some(backend_row) = rows.into_iter().next() else {
        return Ok(None);
    };
    let Some(new_id) = entity::id(&backend_row).map(str::to_string) else {
        return Ok(None);
    };

    let mut merged = backend_row;
    let local = deps.store.get(&table.remote_name, old_id).await.map_err(store_error)?;
    let overlay = pending_payload.cloned().or(local);
    if let Some(overlay) = overlay {
        for (key, value) in overlay {
            if key == entity::ID {
                continue;
            }
            merged.insert(key, value);
        }
    }
    merged.insert(entity::ID.to_string(), Value::String(new_id.clone()));

    let mut batch = WriteBatch::new();
    batch.hard_delete(&table.remote_name, old_id);
    batch.put(&table.remote_name, merged);
    deps.store.commit(batch).await.map_err(store_error)?;

    let purged =
        deps.outbox.purge_entity(&table.remote_name, old_id).await.map_err(store_error)?;
    info!(
        table = %table.remote_name,
        old_id,
        new_id = %new_id,
        purged,
        "singleton entity reconciled to backend row"
    );

    Ok(Some(new_id))
}

fn set_patch(item: &OutboxItem) -> std::result::Result<Entity, RemoteError> {
    match (&item.field, &item.value) {
        (Some(field), Some(value)) => {
            let mut patch = Map::new();
            patch.insert(field.clone(), value.clone());
            Ok(patch)
        }
        (None, Some(Value::Object(map))) => Ok(map.clone()),
        _ => Err(RemoteError::Config("set intent without a usable payload".to_string())),
    }
}

fn store_error(error: tidemark_domain::EngineError) -> RemoteError {
    RemoteError::Server(format!("local store failure during push: {error}"))
}
