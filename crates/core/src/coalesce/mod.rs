//! Outbox coalescing
//!
//! Pure reduction of an outbox snapshot to a minimal equivalent sequence.
//! The reduction runs over a single snapshot in memory and emits removals
//! plus per-item patches that the queue applies in one batch immediately
//! before each push.
//!
//! Rules, applied per `(table, entity_id)` group:
//! - A group holding both a create and a delete never materialized on the
//!   server; every item in it is dropped.
//! - A delete without a create drops every non-delete item.
//! - A create without a delete absorbs every later set and increment into
//!   its payload.
//! - Within plain groups, increments on one field sum, later sets supersede
//!   earlier writes of the same column, and a set followed by increments on
//!   its field folds into a single numeric write.
//! - No-ops are dropped: zero-delta increments, null or empty sets, and
//!   sets whose only remaining column is `updated_at`.
//!
//! Remaining items keep their sequence numbers, so relative order across
//! entity groups is never disturbed.

use std::collections::HashMap;

use serde_json::{Map, Value};
use tidemark_domain::entity;
use tidemark_domain::{OutboxItem, OutboxOp};

/// Replacement of one outbox item's `field` and `value` columns.
#[derive(Debug, Clone, PartialEq)]
pub struct CoalescePatch {
    /// Sequence number of the patched item.
    pub seq: i64,
    /// New target field.
    pub field: Option<String>,
    /// New payload.
    pub value: Option<Value>,
}

/// Result of coalescing one outbox snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoalesceOutcome {
    /// Sequence numbers of items to drop.
    pub removed: Vec<i64>,
    /// Payload replacements for surviving items.
    pub patches: Vec<CoalescePatch>,
}

impl CoalesceOutcome {
    /// Whether the snapshot was already minimal.
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.patches.is_empty()
    }
}

/// Working copy of an item during reduction.
#[derive(Debug, Clone)]
struct Work {
    seq: i64,
    op: OutboxOp,
    field: Option<String>,
    value: Option<Value>,
}

impl Work {
    fn from_item(item: &OutboxItem) -> Self {
        Self { seq: item.seq, op: item.op, field: item.field.clone(), value: item.value.clone() }
    }

    /// Columns this item writes.
    fn targets(&self) -> Vec<String> {
        if let Some(field) = &self.field {
            return vec![field.clone()];
        }
        match &self.value {
            Some(Value::Object(map)) => map.keys().cloned().collect(),
            _ => Vec::new(),
        }
    }

    fn targets_field(&self, field: &str) -> bool {
        match &self.field {
            Some(own) => own == field,
            None => matches!(&self.value, Some(Value::Object(map)) if map.contains_key(field)),
        }
    }
}

/// Reduce an outbox snapshot. The input must be in sequence order.
pub fn coalesce(items: &[OutboxItem]) -> CoalesceOutcome {
    let mut groups: Vec<Vec<&OutboxItem>> = Vec::new();
    let mut index: HashMap<(String, String), usize> = HashMap::new();

    for item in items {
        let key = (item.table.clone(), item.entity_id.clone());
        match index.get(&key) {
            Some(&at) => groups[at].push(item),
            None => {
                index.insert(key, groups.len());
                groups.push(vec![item]);
            }
        }
    }

    let mut survivors: Vec<Work> = Vec::new();
    for group in &groups {
        survivors.extend(coalesce_group(group));
    }

    diff(items, &survivors)
}

/// Apply an outcome to a snapshot; used by in-memory queues and tests.
pub fn apply_outcome(items: &[OutboxItem], outcome: &CoalesceOutcome) -> Vec<OutboxItem> {
    items
        .iter()
        .filter(|item| !outcome.removed.contains(&item.seq))
        .map(|item| {
            let mut item = item.clone();
            if let Some(patch) = outcome.patches.iter().find(|p| p.seq == item.seq) {
                item.field = patch.field.clone();
                item.value = patch.value.clone();
            }
            item
        })
        .collect()
}

fn coalesce_group(group: &[&OutboxItem]) -> Vec<Work> {
    let has_create = group.iter().any(|i| i.op == OutboxOp::Create);
    let has_delete = group.iter().any(|i| i.op == OutboxOp::Delete);

    let kept = if has_create && has_delete {
        // Created and deleted within one queue window: nothing to push.
        Vec::new()
    } else if has_delete {
        group
            .iter()
            .filter(|i| i.op == OutboxOp::Delete)
            .map(|i| Work::from_item(i))
            .collect()
    } else if has_create {
        fold_into_create(group)
    } else {
        reduce_plain(group)
    };

    drop_noops(kept)
}

/// Absorb later sets and increments into the group's create payload.
fn fold_into_create(group: &[&OutboxItem]) -> Vec<Work> {
    let mut kept: Vec<Work> = Vec::new();
    let mut create_at: Option<usize> = None;

    for item in group {
        match item.op {
            OutboxOp::Create if create_at.is_none() => {
                create_at = Some(kept.len());
                kept.push(Work::from_item(item));
            }
            OutboxOp::Set | OutboxOp::Increment if create_at.is_some() => {
                let at = create_at.unwrap_or(0);
                let payload = match kept[at].value.take() {
                    Some(Value::Object(map)) => map,
                    _ => Map::new(),
                };
                let folded = fold_op_into_payload(payload, item);
                kept[at].value = Some(Value::Object(folded));
            }
            _ => kept.push(Work::from_item(item)),
        }
    }

    kept
}

fn fold_op_into_payload(mut payload: Map<String, Value>, item: &OutboxItem) -> Map<String, Value> {
    match item.op {
        OutboxOp::Set => match (&item.field, &item.value) {
            (Some(field), Some(value)) => {
                let merged = merge_value(payload.remove(field), value.clone());
                payload.insert(field.clone(), merged);
            }
            (None, Some(Value::Object(patch))) => {
                for (key, value) in patch {
                    let merged = merge_value(payload.remove(key), value.clone());
                    payload.insert(key.clone(), merged);
                }
            }
            _ => {}
        },
        OutboxOp::Increment => {
            if let Some(field) = &item.field {
                let base = payload.get(field).and_then(Value::as_f64).unwrap_or(0.0);
                let delta = item.value.as_ref().and_then(Value::as_f64).unwrap_or(0.0);
                payload.insert(field.clone(), entity::number(base + delta));
            }
        }
        OutboxOp::Create | OutboxOp::Delete => {}
    }
    payload
}

/// Field-level reduction for groups holding neither a create nor a delete.
fn reduce_plain(group: &[&OutboxItem]) -> Vec<Work> {
    let mut kept: Vec<Work> = Vec::new();

    for item in group {
        match item.op {
            OutboxOp::Increment => {
                let field = match &item.field {
                    Some(field) => field.clone(),
                    None => {
                        kept.push(Work::from_item(item));
                        continue;
                    }
                };
                let delta = item.value.as_ref().and_then(Value::as_f64).unwrap_or(0.0);

                match kept.iter().rposition(|w| w.targets_field(&field)) {
                    Some(at) if kept[at].op == OutboxOp::Increment => {
                        let base = kept[at].value.as_ref().and_then(Value::as_f64).unwrap_or(0.0);
                        kept[at].value = Some(entity::number(base + delta));
                    }
                    Some(at) if kept[at].op == OutboxOp::Set => {
                        fold_increment_into_set(&mut kept[at], &field, delta);
                    }
                    _ => kept.push(Work::from_item(item)),
                }
            }
            OutboxOp::Set => {
                let incoming = Work::from_item(item);
                for column in incoming.targets() {
                    supersede_column(&mut kept, &column);
                }

                // Consecutive sets on one entity collapse into one patch.
                if let Some(last) = kept.last_mut() {
                    if last.op == OutboxOp::Set {
                        merge_sets(last, &incoming);
                        continue;
                    }
                }
                kept.push(incoming);
            }
            OutboxOp::Create | OutboxOp::Delete => kept.push(Work::from_item(item)),
        }
    }

    kept
}

/// Remove earlier contributions to a column that a later set overwrites.
fn supersede_column(kept: &mut Vec<Work>, column: &str) {
    let mut at = 0;
    while at < kept.len() {
        let remove = {
            let work = &mut kept[at];
            if work.field.as_deref() == Some(column) {
                true
            } else if work.op == OutboxOp::Set && work.field.is_none() {
                match &mut work.value {
                    Some(Value::Object(map)) => {
                        map.remove(column);
                        map.is_empty()
                    }
                    _ => false,
                }
            } else {
                false
            }
        };

        if remove {
            kept.remove(at);
        } else {
            at += 1;
        }
    }
}

fn fold_increment_into_set(set: &mut Work, field: &str, delta: f64) {
    match (&set.field, &mut set.value) {
        (Some(_), value) => {
            let base = value.as_ref().and_then(Value::as_f64).unwrap_or(0.0);
            *value = Some(entity::number(base + delta));
        }
        (None, Some(Value::Object(map))) => {
            let base = map.get(field).and_then(Value::as_f64).unwrap_or(0.0);
            map.insert(field.to_string(), entity::number(base + delta));
        }
        _ => {}
    }
}

/// Collapse a later set into an earlier one, later columns winning.
fn merge_sets(earlier: &mut Work, later: &Work) {
    let mut merged = match earlier {
        Work { field: Some(field), value, .. } => {
            let mut map = Map::new();
            if let Some(value) = value.take() {
                map.insert(field.clone(), value);
            }
            map
        }
        Work { value: Some(Value::Object(map)), .. } => std::mem::take(map),
        _ => Map::new(),
    };

    match (&later.field, &later.value) {
        (Some(field), Some(value)) => {
            let folded = merge_value(merged.remove(field), value.clone());
            merged.insert(field.clone(), folded);
        }
        (None, Some(Value::Object(patch))) => {
            for (key, value) in patch {
                let folded = merge_value(merged.remove(key), value.clone());
                merged.insert(key.clone(), folded);
            }
        }
        _ => {}
    }

    earlier.field = None;
    earlier.value = Some(Value::Object(merged));
}

/// Later value wins; object values merge key-wise.
fn merge_value(old: Option<Value>, new: Value) -> Value {
    match (old, new) {
        (Some(Value::Object(mut base)), Value::Object(patch)) => {
            for (key, value) in patch {
                let merged = merge_value(base.remove(&key), value);
                base.insert(key, merged);
            }
            Value::Object(base)
        }
        (_, new) => new,
    }
}

/// Drop items that would have no effect on the backend.
fn drop_noops(kept: Vec<Work>) -> Vec<Work> {
    kept.into_iter()
        .filter(|work| match work.op {
            OutboxOp::Increment => {
                work.value.as_ref().and_then(Value::as_f64).unwrap_or(0.0) != 0.0
            }
            OutboxOp::Set => match &work.value {
                None | Some(Value::Null) => false,
                Some(Value::Object(map)) => {
                    !map.is_empty() && !(map.len() == 1 && map.contains_key(entity::UPDATED_AT))
                }
                Some(_) => true,
            },
            OutboxOp::Create | OutboxOp::Delete => true,
        })
        .collect()
}

/// Diff the survivors against the original snapshot.
fn diff(items: &[OutboxItem], survivors: &[Work]) -> CoalesceOutcome {
    let surviving: HashMap<i64, &Work> = survivors.iter().map(|w| (w.seq, w)).collect();

    let mut outcome = CoalesceOutcome::default();
    for item in items {
        match surviving.get(&item.seq) {
            None => outcome.removed.push(item.seq),
            Some(work) => {
                if work.field != item.field || work.value != item.value {
                    outcome.patches.push(CoalescePatch {
                        seq: item.seq,
                        field: work.field.clone(),
                        value: work.value.clone(),
                    });
                }
            }
        }
    }

    outcome
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;
    use tidemark_domain::Entity;

    use super::*;

    fn item(seq: i64, entity_id: &str, op: OutboxOp) -> OutboxItem {
        OutboxItem {
            seq,
            table: "tasks".to_string(),
            entity_id: entity_id.to_string(),
            op,
            field: None,
            value: None,
            enqueued_at: Utc::now(),
            retries: 0,
            last_attempt_at: None,
        }
    }

    fn set(seq: i64, entity_id: &str, field: &str, value: Value) -> OutboxItem {
        let mut it = item(seq, entity_id, OutboxOp::Set);
        it.field = Some(field.to_string());
        it.value = Some(value);
        it
    }

    fn set_multi(seq: i64, entity_id: &str, value: Value) -> OutboxItem {
        let mut it = item(seq, entity_id, OutboxOp::Set);
        it.value = Some(value);
        it
    }

    fn increment(seq: i64, entity_id: &str, field: &str, delta: f64) -> OutboxItem {
        let mut it = item(seq, entity_id, OutboxOp::Increment);
        it.field = Some(field.to_string());
        it.value = Some(json!(delta));
        it
    }

    fn create(seq: i64, entity_id: &str, payload: Value) -> OutboxItem {
        let mut it = item(seq, entity_id, OutboxOp::Create);
        it.value = Some(payload);
        it
    }

    fn delete(seq: i64, entity_id: &str) -> OutboxItem {
        item(seq, entity_id, OutboxOp::Delete)
    }

    /// Replay a schedule against an in-memory row the way the backend would
    /// apply pushed operations.
    fn replay(items: &[OutboxItem]) -> Option<Entity> {
        let mut row: Option<Entity> = None;
        for it in items {
            match it.op {
                OutboxOp::Create => {
                    let mut entity = Entity::new();
                    if let Some(Value::Object(map)) = &it.value {
                        entity = map.clone();
                    }
                    row = Some(entity);
                }
                OutboxOp::Delete => {
                    if let Some(entity) = &mut row {
                        entity.insert("deleted".to_string(), json!(true));
                    }
                }
                OutboxOp::Set => {
                    let entity = row.get_or_insert_with(Entity::new);
                    match (&it.field, &it.value) {
                        (Some(field), Some(value)) => {
                            entity.insert(field.clone(), value.clone());
                        }
                        (None, Some(Value::Object(patch))) => {
                            for (key, value) in patch {
                                entity.insert(key.clone(), value.clone());
                            }
                        }
                        _ => {}
                    }
                }
                OutboxOp::Increment => {
                    let entity = row.get_or_insert_with(Entity::new);
                    if let Some(field) = &it.field {
                        let base = entity.get(field).and_then(Value::as_f64).unwrap_or(0.0);
                        let delta = it.value.as_ref().and_then(Value::as_f64).unwrap_or(0.0);
                        entity.insert(field.clone(), entity::number(base + delta));
                    }
                }
            }
        }
        row
    }

    #[test]
    fn fifty_increments_collapse_to_one() {
        let items: Vec<OutboxItem> =
            (0..50).map(|seq| increment(seq, "G", "current", 1.0)).collect();

        let outcome = coalesce(&items);
        let remaining = apply_outcome(&items, &outcome);

        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].op, OutboxOp::Increment);
        assert_eq!(remaining[0].field.as_deref(), Some("current"));
        assert_eq!(remaining[0].value, Some(json!(50)));
    }

    #[test]
    fn create_then_delete_cancels_whole_group() {
        let items =
            vec![create(1, "T", json!({"id": "T", "title": "x"})), delete(2, "T")];

        let outcome = coalesce(&items);
        assert_eq!(outcome.removed, vec![1, 2]);
        assert!(apply_outcome(&items, &outcome).is_empty());
    }

    #[test]
    fn delete_drops_earlier_writes() {
        let items = vec![
            set(1, "E", "title", json!("a")),
            increment(2, "E", "count", 3.0),
            delete(3, "E"),
        ];

        let outcome = coalesce(&items);
        let remaining = apply_outcome(&items, &outcome);

        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].op, OutboxOp::Delete);
    }

    #[test]
    fn sets_and_increments_fold_into_create() {
        let items = vec![
            create(1, "E", json!({"id": "E", "title": "a", "count": 1})),
            set(2, "E", "title", json!("b")),
            increment(3, "E", "count", 4.0),
        ];

        let outcome = coalesce(&items);
        let remaining = apply_outcome(&items, &outcome);

        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].op, OutboxOp::Create);
        assert_eq!(
            remaining[0].value,
            Some(json!({"id": "E", "title": "b", "count": 5}))
        );
    }

    #[test]
    fn consecutive_sets_collapse_last_write_per_column() {
        let items = vec![
            set(1, "E", "title", json!("a")),
            set_multi(2, "E", json!({"title": "b", "notes": "n"})),
        ];

        let outcome = coalesce(&items);
        let remaining = apply_outcome(&items, &outcome);

        assert_eq!(remaining.len(), 1);
        assert!(remaining[0].field.is_none());
        assert_eq!(remaining[0].value, Some(json!({"title": "b", "notes": "n"})));
    }

    #[test]
    fn set_then_increments_fold_numerically() {
        let items = vec![
            set(1, "E", "count", json!(10)),
            increment(2, "E", "count", 2.0),
            increment(3, "E", "count", 3.0),
        ];

        let outcome = coalesce(&items);
        let remaining = apply_outcome(&items, &outcome);

        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].op, OutboxOp::Set);
        assert_eq!(remaining[0].value, Some(json!(15)));
    }

    #[test]
    fn later_set_supersedes_non_adjacent_writes() {
        let items = vec![
            set(1, "E", "title", json!("a")),
            increment(2, "E", "count", 1.0),
            set(3, "E", "title", json!("b")),
        ];

        let outcome = coalesce(&items);
        let remaining = apply_outcome(&items, &outcome);

        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining[0].op, OutboxOp::Increment);
        assert_eq!(remaining[1].value, Some(json!("b")));
    }

    #[test]
    fn zero_delta_and_empty_sets_drop() {
        let items = vec![
            increment(1, "E", "count", 0.0),
            set_multi(2, "E", json!({})),
            set_multi(3, "E", json!({"updated_at": "2025-01-01T00:00:00Z"})),
            set(4, "F", "title", Value::Null),
        ];

        let outcome = coalesce(&items);
        assert_eq!(outcome.removed, vec![1, 2, 3, 4]);
    }

    #[test]
    fn groups_do_not_interfere() {
        let items = vec![
            increment(1, "A", "count", 1.0),
            increment(2, "B", "count", 2.0),
            increment(3, "A", "count", 3.0),
        ];

        let outcome = coalesce(&items);
        let remaining = apply_outcome(&items, &outcome);

        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining[0].entity_id, "A");
        assert_eq!(remaining[0].value, Some(json!(4)));
        assert_eq!(remaining[1].entity_id, "B");
        assert_eq!(remaining[1].value, Some(json!(2)));
    }

    #[test]
    fn coalescing_is_a_fixed_point() {
        let schedules: Vec<Vec<OutboxItem>> = vec![
            (0..10).map(|seq| increment(seq, "G", "n", 1.0)).collect(),
            vec![
                create(1, "E", json!({"id": "E"})),
                set(2, "E", "title", json!("x")),
                increment(3, "E", "n", 2.0),
            ],
            vec![
                set(1, "E", "a", json!(1)),
                set(2, "E", "b", json!(2)),
                increment(3, "E", "a", 5.0),
                set(4, "F", "a", json!("z")),
            ],
        ];

        for schedule in schedules {
            let once = apply_outcome(&schedule, &coalesce(&schedule));
            let twice = coalesce(&once);
            assert!(twice.is_empty(), "second pass changed {once:?}: {twice:?}");
        }
    }

    #[test]
    fn coalescing_preserves_replay_semantics() {
        let schedules: Vec<Vec<OutboxItem>> = vec![
            vec![
                create(1, "E", json!({"id": "E", "count": 1})),
                increment(2, "E", "count", 2.0),
                set(3, "E", "title", json!("t")),
            ],
            vec![
                create(1, "E", json!({"id": "E"})),
                set(2, "E", "a", json!("1")),
                set_multi(3, "E", json!({"a": "2", "b": "3"})),
                increment(4, "E", "n", 7.0),
            ],
            vec![
                set(1, "E", "a", json!(1)),
                increment(2, "E", "a", 2.0),
                set(3, "E", "a", json!(9)),
                increment(4, "E", "a", 1.0),
            ],
        ];

        for schedule in schedules {
            let coalesced = apply_outcome(&schedule, &coalesce(&schedule));
            assert_eq!(
                replay(&schedule),
                replay(&coalesced),
                "replay diverged for {schedule:?} vs {coalesced:?}"
            );
        }
    }
}
