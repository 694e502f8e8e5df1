//! Consumer-facing data API
//!
//! Reads and writes go against the local store instantly; every mutation
//! commits the entity row and its intent operation in one transaction, so a
//! write is never observable without a queued push. Mutations stamp the
//! engine-managed fields, shield the entity behind the recently-modified
//! guard and nudge the sync engine.
//!
//! Reads can opt into a remote fallback that fires only when the local
//! result is empty and the device is online; fetched rows are cached
//! locally without enqueueing intent.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tidemark_domain::entity;
use tidemark_domain::{
    EngineConfig, EngineError, Entity, NewOutboxItem, OutboxOp, Result, TableConfig,
};
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::device::DeviceIdentity;
use crate::guard::RecentGuard;
use crate::observer::SyncNudge;
use crate::remote::ports::RemoteAdapter;
use crate::store::ports::{LocalStore, WriteBatch};

/// One mutation inside a [`DataApi::batch`] call.
#[derive(Debug, Clone)]
pub enum BatchOp {
    /// Create an entity.
    Create {
        /// Remote table name.
        table: String,
        /// Initial payload; an `id` is generated when absent.
        data: Entity,
    },
    /// Merge fields into an entity.
    Update {
        /// Remote table name.
        table: String,
        /// Target entity id.
        id: String,
        /// Fields to merge.
        fields: Entity,
    },
    /// Soft-delete an entity.
    Delete {
        /// Remote table name.
        table: String,
        /// Target entity id.
        id: String,
    },
    /// Add a delta to a numeric field.
    Increment {
        /// Remote table name.
        table: String,
        /// Target entity id.
        id: String,
        /// Numeric field name.
        field: String,
        /// Delta to add.
        delta: f64,
    },
}

/// CRUD and query surface over the local store.
pub struct DataApi {
    config: Arc<EngineConfig>,
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteAdapter>,
    device: DeviceIdentity,
    recently_modified: Arc<RecentGuard>,
    online: watch::Receiver<bool>,
    nudge: Arc<dyn SyncNudge>,
}

impl DataApi {
    /// Assemble the API over its collaborators.
    pub fn new(
        config: Arc<EngineConfig>,
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteAdapter>,
        device: DeviceIdentity,
        recently_modified: Arc<RecentGuard>,
        online: watch::Receiver<bool>,
        nudge: Arc<dyn SyncNudge>,
    ) -> Self {
        Self { config, store, remote, device, recently_modified, online, nudge }
    }

    /// Create an entity, generating an id when absent, and queue its push.
    pub async fn create(&self, table: &str, data: Entity) -> Result<Entity> {
        self.table_config(table)?;
        let now = Utc::now();

        let (stored, intent) = self.prepare_create(table, data, now);

        let mut batch = WriteBatch::new();
        batch.put(table, stored.clone()).enqueue(intent);
        self.store.commit(batch).await?;

        self.finish_write(std::slice::from_ref(&stored));
        Ok(stored)
    }

    /// Merge fields into an entity; `None` when the entity does not exist.
    pub async fn update(&self, table: &str, id: &str, fields: Entity) -> Result<Option<Entity>> {
        self.table_config(table)?;
        let now = Utc::now();

        let Some(current) = self.store.get(table, id).await? else {
            return Ok(None);
        };

        let (stored, intent) = Self::prepare_update(table, id, &current, fields, now, &self.device);

        let mut batch = WriteBatch::new();
        batch.put(table, stored.clone()).enqueue(intent);
        self.store.commit(batch).await?;

        self.finish_write(std::slice::from_ref(&stored));
        Ok(Some(stored))
    }

    /// Soft-delete an entity and queue the deletion. Missing rows are a
    /// no-op.
    pub async fn delete(&self, table: &str, id: &str) -> Result<()> {
        self.table_config(table)?;
        let now = Utc::now();

        let Some(current) = self.store.get(table, id).await? else {
            return Ok(());
        };

        let (stored, intent) = Self::prepare_delete(table, id, &current, now, &self.device);

        let mut batch = WriteBatch::new();
        batch.put(table, stored.clone()).enqueue(intent);
        self.store.commit(batch).await?;

        self.finish_write(std::slice::from_ref(&stored));
        Ok(())
    }

    /// Add a delta to a numeric field inside one transaction; `None` when
    /// the entity does not exist. Extra fields, when given, queue as a
    /// separate set.
    pub async fn increment(
        &self,
        table: &str,
        id: &str,
        field: &str,
        delta: f64,
        extra_fields: Option<Entity>,
    ) -> Result<Option<Entity>> {
        self.table_config(table)?;
        let now = Utc::now();

        let Some(current) = self.store.get(table, id).await? else {
            return Ok(None);
        };

        let (stored, intents) =
            Self::prepare_increment(table, id, &current, field, delta, extra_fields, now, &self.device);

        let mut batch = WriteBatch::new();
        batch.put(table, stored.clone());
        for intent in intents {
            batch.enqueue(intent);
        }
        self.store.commit(batch).await?;

        self.finish_write(std::slice::from_ref(&stored));
        Ok(Some(stored))
    }

    /// Run several mutations in one transaction with one shared timestamp,
    /// then nudge the engine once.
    pub async fn batch(&self, ops: Vec<BatchOp>) -> Result<Vec<Option<Entity>>> {
        let now = Utc::now();
        let mut batch = WriteBatch::new();
        let mut results = Vec::with_capacity(ops.len());
        let mut written: Vec<Entity> = Vec::new();

        for op in ops {
            match op {
                BatchOp::Create { table, data } => {
                    self.table_config(&table)?;
                    let (stored, intent) = self.prepare_create(&table, data, now);
                    batch.put(&table, stored.clone()).enqueue(intent);
                    written.push(stored.clone());
                    results.push(Some(stored));
                }
                BatchOp::Update { table, id, fields } => {
                    self.table_config(&table)?;
                    match self.store.get(&table, &id).await? {
                        None => results.push(None),
                        Some(current) => {
                            let (stored, intent) = Self::prepare_update(
                                &table, &id, &current, fields, now, &self.device,
                            );
                            batch.put(&table, stored.clone()).enqueue(intent);
                            written.push(stored.clone());
                            results.push(Some(stored));
                        }
                    }
                }
                BatchOp::Delete { table, id } => {
                    self.table_config(&table)?;
                    match self.store.get(&table, &id).await? {
                        None => results.push(None),
                        Some(current) => {
                            let (stored, intent) =
                                Self::prepare_delete(&table, &id, &current, now, &self.device);
                            batch.put(&table, stored.clone()).enqueue(intent);
                            written.push(stored.clone());
                            results.push(Some(stored));
                        }
                    }
                }
                BatchOp::Increment { table, id, field, delta } => {
                    self.table_config(&table)?;
                    match self.store.get(&table, &id).await? {
                        None => results.push(None),
                        Some(current) => {
                            let (stored, intents) = Self::prepare_increment(
                                &table, &id, &current, &field, delta, None, now, &self.device,
                            );
                            batch.put(&table, stored.clone());
                            for intent in intents {
                                batch.enqueue(intent);
                            }
                            written.push(stored.clone());
                            results.push(Some(stored));
                        }
                    }
                }
            }
        }

        if !batch.is_empty() {
            self.store.commit(batch).await?;
            self.finish_write(&written);
        }

        Ok(results)
    }

    /// Fetch one entity, optionally falling back to the backend when the
    /// local row is absent and the device is online.
    pub async fn get(&self, table: &str, id: &str, remote_fallback: bool) -> Result<Option<Entity>> {
        self.table_config(table)?;

        if let Some(found) = self.store.get(table, id).await? {
            return Ok(Some(found));
        }

        if remote_fallback {
            let filters =
                vec![tidemark_domain::Filter::eq(entity::ID, Value::String(id.to_string()))];
            let fetched = self.fetch_and_cache(table, &filters).await?;
            return Ok(fetched.into_iter().next());
        }

        Ok(None)
    }

    /// Fetch every entity in a table, optionally ordered by a field, with
    /// optional remote fallback on an empty local result.
    pub async fn get_all(
        &self,
        table: &str,
        order_by: Option<&str>,
        remote_fallback: bool,
    ) -> Result<Vec<Entity>> {
        self.table_config(table)?;

        let found = self.store.get_all(table, order_by).await?;
        if !found.is_empty() || !remote_fallback {
            return Ok(found);
        }

        self.fetch_and_cache(table, &[]).await
    }

    /// Fetch entities whose field equals the value, with optional remote
    /// fallback on an empty local result.
    pub async fn query_equals(
        &self,
        table: &str,
        field: &str,
        value: &Value,
        remote_fallback: bool,
    ) -> Result<Vec<Entity>> {
        self.table_config(table)?;

        let found = self.store.query_equals(table, field, value).await?;
        if !found.is_empty() || !remote_fallback {
            return Ok(found);
        }

        let filters = vec![tidemark_domain::Filter::eq(field, value.clone())];
        self.fetch_and_cache(table, &filters).await
    }

    /// Fetch entities whose field lies in `[low, high]`, with optional
    /// remote fallback on an empty local result.
    pub async fn query_range(
        &self,
        table: &str,
        field: &str,
        low: &Value,
        high: &Value,
        remote_fallback: bool,
    ) -> Result<Vec<Entity>> {
        self.table_config(table)?;

        let found = self.store.query_range(table, field, low, high).await?;
        if !found.is_empty() || !remote_fallback {
            return Ok(found);
        }

        let filters = vec![
            tidemark_domain::Filter::gte(field, low.clone()),
            tidemark_domain::Filter::lte(field, high.clone()),
        ];
        self.fetch_and_cache(table, &filters).await
    }

    /// Fetch the entity matching `index_field == value`, creating it from
    /// the defaults when absent. `check_remote` consults the backend before
    /// creating.
    pub async fn get_or_create(
        &self,
        table: &str,
        index_field: &str,
        value: &Value,
        defaults: Entity,
        check_remote: bool,
    ) -> Result<Entity> {
        self.table_config(table)?;

        let found = self.query_equals(table, index_field, value, check_remote).await?;
        if let Some(existing) = found.into_iter().next() {
            return Ok(existing);
        }

        let mut data = defaults;
        data.insert(index_field.to_string(), value.clone());
        self.create(table, data).await
    }

    fn table_config(&self, table: &str) -> Result<&TableConfig> {
        self.config
            .table(table)
            .ok_or_else(|| EngineError::InvalidInput(format!("table not configured: {table}")))
    }

    fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    /// Backend fetch for fallback reads; soft-deleted rows are excluded and
    /// live rows are cached locally without queueing intent.
    async fn fetch_and_cache(
        &self,
        table: &str,
        filters: &[tidemark_domain::Filter],
    ) -> Result<Vec<Entity>> {
        if !self.is_online() {
            return Ok(Vec::new());
        }

        let columns = self.table_config(table)?.columns.clone();
        let rows = match self.remote.select(table, &columns, None, filters).await {
            Ok(rows) => rows,
            Err(err) => {
                warn!(table, error = %err, "remote fallback fetch failed");
                return Ok(Vec::new());
            }
        };

        let live: Vec<Entity> =
            rows.into_iter().filter(|row| !entity::is_deleted(row)).collect();

        if !live.is_empty() {
            let mut batch = WriteBatch::new();
            for row in &live {
                batch.put(table, row.clone());
            }
            self.store.commit(batch).await?;
            debug!(table, count = live.len(), "cached remote fallback rows");
        }

        Ok(live)
    }

    fn prepare_create(
        &self,
        table: &str,
        mut data: Entity,
        now: DateTime<Utc>,
    ) -> (Entity, NewOutboxItem) {
        let id = match entity::id(&data) {
            Some(existing) => existing.to_string(),
            None => {
                let generated = Uuid::new_v4().to_string();
                data.insert(entity::ID.to_string(), Value::String(generated.clone()));
                generated
            }
        };

        if !data.contains_key(entity::CREATED_AT) {
            data.insert(entity::CREATED_AT.to_string(), Value::String(now.to_rfc3339()));
        }
        entity::set_updated_at(&mut data, now);
        entity::set_device_id(&mut data, self.device.as_str());
        if !data.contains_key(entity::DELETED) {
            entity::set_deleted(&mut data, false);
        }

        let intent = NewOutboxItem::new(table, &id, OutboxOp::Create)
            .with_value(Value::Object(data.clone()));
        (data, intent)
    }

    fn prepare_update(
        table: &str,
        id: &str,
        current: &Entity,
        fields: Entity,
        now: DateTime<Utc>,
        device: &DeviceIdentity,
    ) -> (Entity, NewOutboxItem) {
        let mut stored = current.clone();
        for (key, value) in &fields {
            stored.insert(key.clone(), value.clone());
        }
        entity::set_updated_at(&mut stored, now);
        entity::set_device_id(&mut stored, device.as_str());

        let intent = if fields.len() == 1 {
            let (field, value) = fields
                .iter()
                .next()
                .map(|(k, v)| (k.clone(), v.clone()))
                .unwrap_or_default();
            NewOutboxItem::new(table, id, OutboxOp::Set).with_field(field).with_value(value)
        } else {
            let mut payload = fields;
            entity::set_updated_at(&mut payload, now);
            NewOutboxItem::new(table, id, OutboxOp::Set).with_value(Value::Object(payload))
        };

        (stored, intent)
    }

    fn prepare_delete(
        table: &str,
        id: &str,
        current: &Entity,
        now: DateTime<Utc>,
        device: &DeviceIdentity,
    ) -> (Entity, NewOutboxItem) {
        let mut stored = current.clone();
        entity::set_deleted(&mut stored, true);
        entity::set_updated_at(&mut stored, now);
        entity::set_device_id(&mut stored, device.as_str());

        (stored, NewOutboxItem::new(table, id, OutboxOp::Delete))
    }

    #[allow(clippy::too_many_arguments)]
    fn prepare_increment(
        table: &str,
        id: &str,
        current: &Entity,
        field: &str,
        delta: f64,
        extra_fields: Option<Entity>,
        now: DateTime<Utc>,
        device: &DeviceIdentity,
    ) -> (Entity, Vec<NewOutboxItem>) {
        let mut stored = current.clone();
        let base = entity::numeric(&stored, field).unwrap_or(0.0);
        stored.insert(field.to_string(), entity::number(base + delta));
        entity::set_updated_at(&mut stored, now);
        entity::set_device_id(&mut stored, device.as_str());

        let mut intents = vec![NewOutboxItem::new(table, id, OutboxOp::Increment)
            .with_field(field)
            .with_value(entity::number(delta))];

        if let Some(mut extra) = extra_fields {
            if !extra.is_empty() {
                for (key, value) in &extra {
                    stored.insert(key.clone(), value.clone());
                }
                entity::set_updated_at(&mut extra, now);
                intents.push(
                    NewOutboxItem::new(table, id, OutboxOp::Set).with_value(Value::Object(extra)),
                );
            }
        }

        (stored, intents)
    }

    fn finish_write(&self, written: &[Entity]) {
        for row in written {
            if let Some(id) = entity::id(row) {
                self.recently_modified.mark(id);
            }
        }
        self.nudge.nudge();
    }
}
