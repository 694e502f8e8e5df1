//! Field-level conflict resolution
//!
//! Merges a local and a remote entity into one row plus an audit trail.
//! Resolution runs in three tiers: soft-deletion dominates, structurally
//! identical values auto-merge, and the remainder resolve per field by
//! pending local intent first and last-write otherwise.
//!
//! The pending operations are passed in as data rather than read through a
//! queue dependency, so the realtime path and the pull path share one
//! resolver without a module cycle.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tidemark_domain::entity;
use tidemark_domain::{
    ConflictResolution, ConflictStrategy, ConflictWinner, Entity, FieldConflictResolution,
    OutboxItem, OutboxOp, TableConfig,
};

/// Fields the resolver manages itself and never treats as conflicting.
/// Soft deletion is settled by the delete-wins tier before the field loop.
const MANAGED_FIELDS: [&str; 6] = [
    entity::ID,
    entity::CREATED_AT,
    entity::VERSION,
    entity::UPDATED_AT,
    entity::DEVICE_ID,
    entity::DELETED,
];

/// Merge `remote` into `local` for one entity of `table`.
///
/// `pending_ops` must already be filtered to the entity being resolved.
/// The resolver never fails; audit persistence is the caller's concern.
pub fn resolve_conflict(
    table: &TableConfig,
    local: Option<&Entity>,
    remote: &Entity,
    pending_ops: &[OutboxItem],
) -> ConflictResolution {
    let Some(local) = local else {
        return ConflictResolution {
            merged_entity: remote.clone(),
            field_resolutions: Vec::new(),
            has_conflicts: false,
        };
    };

    let local_updated = entity::updated_at(local).unwrap_or(DateTime::<Utc>::MIN_UTC);
    let remote_updated = entity::updated_at(remote).unwrap_or(DateTime::<Utc>::MIN_UTC);
    let max_updated = local_updated.max(remote_updated);
    let next_version = entity::version(local).max(entity::version(remote)) + 1;

    if entity::is_deleted(local) || entity::is_deleted(remote) {
        return resolve_deletion(local, remote, local_updated, remote_updated, next_version);
    }

    let remote_wins_entity = entity_winner_is_remote(local, remote, local_updated, remote_updated);

    let mut merged = remote.clone();
    let mut resolutions = Vec::new();

    for key in candidate_fields(table, local, remote) {
        let local_value = local.get(&key).cloned().unwrap_or(Value::Null);
        let remote_value = remote.get(&key).cloned().unwrap_or(Value::Null);

        if local_value == remote_value {
            continue;
        }

        let (winner, strategy) = if pending_targets_field(pending_ops, &key) {
            (ConflictWinner::Local, ConflictStrategy::LocalPending)
        } else if remote_wins_entity {
            // Declared numeric-merge fields fall through here as well; the
            // additive strategy is reserved but resolved last-write.
            (ConflictWinner::Remote, ConflictStrategy::LastWrite)
        } else {
            (ConflictWinner::Local, ConflictStrategy::LastWrite)
        };

        let resolved_value = match winner {
            ConflictWinner::Local => local_value.clone(),
            ConflictWinner::Remote | ConflictWinner::Merged => remote_value.clone(),
        };

        if resolved_value == Value::Null && !field_present(local, remote, winner, &key) {
            merged.remove(&key);
        } else {
            merged.insert(key.clone(), resolved_value.clone());
        }

        resolutions.push(FieldConflictResolution {
            field: key,
            local_value,
            remote_value,
            resolved_value,
            winner,
            strategy,
        });
    }

    entity::set_updated_at(&mut merged, max_updated);
    entity::set_version(&mut merged, next_version);

    let winning_device = if resolutions.iter().any(|r| r.strategy == ConflictStrategy::LastWrite) {
        let side = if remote_wins_entity { remote } else { local };
        entity::device_id(side).map(str::to_string)
    } else {
        entity::device_id(local).map(str::to_string)
    };
    if let Some(device) = winning_device {
        entity::set_device_id(&mut merged, &device);
    }

    let has_conflicts = !resolutions.is_empty();
    ConflictResolution { merged_entity: merged, field_resolutions: resolutions, has_conflicts }
}

/// A soft-deleted side dominates the merge.
fn resolve_deletion(
    local: &Entity,
    remote: &Entity,
    local_updated: DateTime<Utc>,
    remote_updated: DateTime<Utc>,
    next_version: i64,
) -> ConflictResolution {
    let local_deleted = entity::is_deleted(local);
    let remote_deleted = entity::is_deleted(remote);

    let winner = if local_deleted && remote_deleted {
        if remote_updated >= local_updated { ConflictWinner::Remote } else { ConflictWinner::Local }
    } else if local_deleted {
        ConflictWinner::Local
    } else {
        ConflictWinner::Remote
    };

    let mut merged = match winner {
        ConflictWinner::Local => local.clone(),
        ConflictWinner::Remote | ConflictWinner::Merged => remote.clone(),
    };
    entity::set_updated_at(&mut merged, local_updated.max(remote_updated));
    entity::set_version(&mut merged, next_version);

    let resolution = FieldConflictResolution {
        field: entity::DELETED.to_string(),
        local_value: Value::Bool(local_deleted),
        remote_value: Value::Bool(remote_deleted),
        resolved_value: Value::Bool(true),
        winner,
        strategy: ConflictStrategy::DeleteWins,
    };

    ConflictResolution {
        merged_entity: merged,
        field_resolutions: vec![resolution],
        has_conflicts: true,
    }
}

/// Ordered union of application fields from both sides.
fn candidate_fields(table: &TableConfig, local: &Entity, remote: &Entity) -> Vec<String> {
    local
        .keys()
        .chain(remote.keys())
        .filter(|key| !MANAGED_FIELDS.contains(&key.as_str()))
        .filter(|key| !table.exclude_from_conflict.iter().any(|excluded| excluded == *key))
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Whether any pending intent writes the given field.
fn pending_targets_field(pending_ops: &[OutboxItem], field: &str) -> bool {
    pending_ops.iter().any(|op| match op.op {
        OutboxOp::Set | OutboxOp::Increment => {
            if op.field.as_deref() == Some(field) {
                return true;
            }
            op.op == OutboxOp::Set
                && op.field.is_none()
                && matches!(&op.value, Some(Value::Object(map)) if map.contains_key(field))
        }
        OutboxOp::Create | OutboxOp::Delete => false,
    })
}

/// Later `updated_at` wins; ties break on the lower `device_id`.
fn entity_winner_is_remote(
    local: &Entity,
    remote: &Entity,
    local_updated: DateTime<Utc>,
    remote_updated: DateTime<Utc>,
) -> bool {
    if remote_updated != local_updated {
        return remote_updated > local_updated;
    }

    let local_device = entity::device_id(local).unwrap_or("");
    let remote_device = entity::device_id(remote).unwrap_or("");
    remote_device < local_device
}

fn field_present(local: &Entity, remote: &Entity, winner: ConflictWinner, key: &str) -> bool {
    match winner {
        ConflictWinner::Local => local.contains_key(key),
        ConflictWinner::Remote | ConflictWinner::Merged => remote.contains_key(key),
    }
}
