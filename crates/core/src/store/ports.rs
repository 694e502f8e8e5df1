//! Port interfaces for local persistence
//!
//! Every engine write goes through [`LocalStore::commit`] so that a
//! successful local write always implies a queued intent: the batch spans the
//! affected entity tables, the outbox, conflict history and the key-value
//! namespace in one transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tidemark_domain::{ConflictHistoryEntry, Entity, NewOutboxItem, OutboxItem, Result};

use crate::coalesce::CoalesceOutcome;

/// One entity write destined for a local table.
#[derive(Debug, Clone)]
pub struct EntityPut {
    /// Remote table name; the store maps it to the local table.
    pub table: String,
    /// Full row to store.
    pub entity: Entity,
}

/// Atomic unit of local writes.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    /// Entity rows to upsert.
    pub puts: Vec<EntityPut>,
    /// Entity rows to hard-delete, as `(table, entity_id)`.
    pub hard_deletes: Vec<(String, String)>,
    /// Intent operations to enqueue.
    pub enqueues: Vec<NewOutboxItem>,
    /// Outbox sequence numbers to remove.
    pub outbox_removes: Vec<i64>,
    /// Conflict audit rows to append.
    pub history: Vec<ConflictHistoryEntry>,
    /// Key-value entries to set, such as the cursor.
    pub kv_puts: Vec<(String, String)>,
}

impl WriteBatch {
    /// Empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the batch carries no writes at all.
    pub fn is_empty(&self) -> bool {
        self.puts.is_empty()
            && self.hard_deletes.is_empty()
            && self.enqueues.is_empty()
            && self.outbox_removes.is_empty()
            && self.history.is_empty()
            && self.kv_puts.is_empty()
    }

    /// Add an entity upsert.
    pub fn put(&mut self, table: impl Into<String>, entity: Entity) -> &mut Self {
        self.puts.push(EntityPut { table: table.into(), entity });
        self
    }

    /// Add a hard delete.
    pub fn hard_delete(
        &mut self,
        table: impl Into<String>,
        entity_id: impl Into<String>,
    ) -> &mut Self {
        self.hard_deletes.push((table.into(), entity_id.into()));
        self
    }

    /// Add an intent enqueue.
    pub fn enqueue(&mut self, item: NewOutboxItem) -> &mut Self {
        self.enqueues.push(item);
        self
    }

    /// Add an outbox removal.
    pub fn remove_outbox(&mut self, seq: i64) -> &mut Self {
        self.outbox_removes.push(seq);
        self
    }

    /// Add conflict audit rows.
    pub fn append_history(&mut self, entries: Vec<ConflictHistoryEntry>) -> &mut Self {
        self.history.extend(entries);
        self
    }

    /// Add a key-value write.
    pub fn set_kv(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.kv_puts.push((key.into(), value.into()));
        self
    }
}

/// Typed transactional access to the local entity tables.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Fetch one entity by id.
    async fn get(&self, table: &str, id: &str) -> Result<Option<Entity>>;

    /// Fetch every entity in a table, optionally ordered by a field.
    async fn get_all(&self, table: &str, order_by: Option<&str>) -> Result<Vec<Entity>>;

    /// Fetch entities whose field equals the given value.
    async fn query_equals(&self, table: &str, field: &str, value: &Value) -> Result<Vec<Entity>>;

    /// Fetch entities whose field lies in `[low, high]`.
    async fn query_range(
        &self,
        table: &str,
        field: &str,
        low: &Value,
        high: &Value,
    ) -> Result<Vec<Entity>>;

    /// Fetch entities whose `updated_at` is strictly after the given instant.
    async fn updated_after(&self, table: &str, cursor: DateTime<Utc>) -> Result<Vec<Entity>>;

    /// Number of rows in a table.
    async fn count(&self, table: &str) -> Result<u64>;

    /// Hard-delete soft-deleted rows older than the cutoff; returns how many.
    async fn purge_tombstones(&self, table: &str, cutoff: DateTime<Utc>) -> Result<usize>;

    /// Apply a batch of writes in one transaction.
    async fn commit(&self, batch: WriteBatch) -> Result<()>;
}

/// Ordered persistent queue of intent operations.
#[async_trait]
pub trait OutboxQueue: Send + Sync {
    /// Append one intent; returns the assigned sequence number.
    async fn enqueue(&self, item: NewOutboxItem) -> Result<i64>;

    /// Snapshot of the whole queue in sequence order.
    async fn list_all(&self) -> Result<Vec<OutboxItem>>;

    /// Items whose retry backoff has elapsed at `now`, in sequence order.
    async fn list_eligible(&self, now: DateTime<Utc>) -> Result<Vec<OutboxItem>>;

    /// Items referencing one entity, in sequence order.
    async fn pending_for_entity(&self, table: &str, entity_id: &str) -> Result<Vec<OutboxItem>>;

    /// Remove one item after the backend acknowledged its effect.
    async fn remove(&self, seq: i64) -> Result<()>;

    /// Record a failed push attempt.
    async fn increment_retry(&self, seq: i64, now: DateTime<Utc>) -> Result<()>;

    /// Apply a coalescer outcome, removals and patches, in one transaction.
    async fn apply_coalesce(&self, outcome: &CoalesceOutcome) -> Result<()>;

    /// Drop items that exhausted their retries; returns per-table counts.
    async fn cleanup_exhausted(&self) -> Result<Vec<(String, usize)>>;

    /// Remove every item referencing one entity.
    async fn purge_entity(&self, table: &str, entity_id: &str) -> Result<usize>;

    /// Remove every item; returns how many were dropped.
    async fn clear(&self) -> Result<usize>;

    /// Whether the queue holds no items.
    async fn is_empty(&self) -> Result<bool>;
}

/// Append-only conflict audit store.
#[async_trait]
pub trait ConflictHistoryStore: Send + Sync {
    /// Append audit rows.
    async fn append(&self, entries: &[ConflictHistoryEntry]) -> Result<()>;

    /// Audit rows for one entity, newest last.
    async fn list_for_entity(&self, table: &str, entity_id: &str)
        -> Result<Vec<ConflictHistoryEntry>>;

    /// Drop audit rows older than the cutoff; returns how many.
    async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}

/// Small persistent key-value namespace for the cursor and device id.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read a value.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a value.
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Remove a value.
    async fn remove(&self, key: &str) -> Result<()>;
}
