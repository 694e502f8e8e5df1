//! Shared fixtures for the infra integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tidemark_core::observer::ImmediateDelete;
use tidemark_core::remote::ports::ChannelSubscription;
use tidemark_core::store::ports::{
    ConflictHistoryStore, KeyValueStore, LocalStore, OutboxQueue,
};
use tidemark_core::{AuthGate, DataApi, DeviceIdentity, RecentGuard, RemoteAdapter, RemoteResult};
use tidemark_domain::entity;
use tidemark_domain::{
    EngineConfig, Entity, Filter, FilterOp, Session, TableConfig,
};
use tidemark_infra::{
    DbManager, EgressCounter, RealtimeManager, SqliteHistoryRepository, SqliteKvRepository,
    SqliteLocalStore, SqliteOutboxRepository, SyncEngine,
};
use tokio::sync::watch;

/// Device id used by every harness.
pub const LOCAL_DEVICE: &str = "device-local";
/// User id the mock backend authenticates by default.
pub const TEST_USER: &str = "u-1";

/// Scripted in-memory backend.
pub struct MockRemote {
    rows: Mutex<HashMap<String, BTreeMap<String, Entity>>>,
    user: Mutex<Option<String>>,
    /// Updates return no rows, as a row-level-authorization denial would.
    pub deny_updates: AtomicBool,
    /// Inserts return an empty representation.
    pub silent_insert_drop: AtomicBool,
    /// Inserts fail with a unique-constraint violation.
    pub duplicate_on_insert: AtomicBool,
    pub insert_calls: AtomicUsize,
    pub update_calls: AtomicUsize,
    pub select_calls: AtomicUsize,
    channels: Mutex<Vec<tokio::sync::mpsc::Sender<tidemark_domain::ChannelMessage>>>,
}

impl MockRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            rows: Mutex::new(HashMap::new()),
            user: Mutex::new(Some(TEST_USER.to_string())),
            deny_updates: AtomicBool::new(false),
            silent_insert_drop: AtomicBool::new(false),
            duplicate_on_insert: AtomicBool::new(false),
            insert_calls: AtomicUsize::new(0),
            update_calls: AtomicUsize::new(0),
            select_calls: AtomicUsize::new(0),
            channels: Mutex::new(Vec::new()),
        })
    }

    /// Push a change event through the most recent live subscription.
    pub async fn emit(&self, message: tidemark_domain::ChannelMessage) {
        let sender = self.channels.lock().last().cloned();
        if let Some(sender) = sender {
            sender.send(message).await.expect("subscription alive");
        }
    }

    /// Seed a backend row directly.
    pub fn seed(&self, table: &str, row: Entity) {
        let id = entity::id(&row).expect("seed row has id").to_string();
        self.rows.lock().entry(table.to_string()).or_default().insert(id, row);
    }

    /// Current backend row, if any.
    pub fn row(&self, table: &str, id: &str) -> Option<Entity> {
        self.rows.lock().get(table).and_then(|rows| rows.get(id)).cloned()
    }

    /// Number of rows the backend holds for a table.
    pub fn row_count(&self, table: &str) -> usize {
        self.rows.lock().get(table).map_or(0, BTreeMap::len)
    }

    /// Replace the authenticated user; `None` reads as signed out.
    pub fn set_user(&self, user: Option<&str>) {
        *self.user.lock() = user.map(str::to_string);
    }

    /// Drop every backend row of a table out of band.
    pub fn wipe(&self, table: &str) {
        self.rows.lock().remove(table);
    }

    fn matches(row: &Entity, filter: &Filter) -> bool {
        let actual = row.get(&filter.field).unwrap_or(&Value::Null);
        match filter.op {
            FilterOp::Eq => actual == &filter.value,
            FilterOp::Lt => compare(actual, &filter.value).is_some_and(std::cmp::Ordering::is_lt),
            FilterOp::Lte => compare(actual, &filter.value).is_some_and(std::cmp::Ordering::is_le),
            FilterOp::Gt => compare(actual, &filter.value).is_some_and(std::cmp::Ordering::is_gt),
            FilterOp::Gte => compare(actual, &filter.value).is_some_and(std::cmp::Ordering::is_ge),
        }
    }
}

fn compare(left: &Value, right: &Value) -> Option<std::cmp::Ordering> {
    match (left, right) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Number(a), Value::Number(b)) => a.as_f64().partial_cmp(&b.as_f64()),
        _ => None,
    }
}

#[async_trait]
impl RemoteAdapter for MockRemote {
    async fn select(
        &self,
        table: &str,
        _columns: &str,
        updated_after: Option<DateTime<Utc>>,
        filters: &[Filter],
    ) -> RemoteResult<Vec<Entity>> {
        self.select_calls.fetch_add(1, Ordering::SeqCst);

        let rows = self.rows.lock();
        let mut selected: Vec<Entity> = rows
            .get(table)
            .map(|table_rows| {
                table_rows
                    .values()
                    .filter(|row| {
                        updated_after.map_or(true, |cursor| {
                            entity::updated_at(row).is_some_and(|at| at > cursor)
                        })
                    })
                    .filter(|row| filters.iter().all(|f| Self::matches(row, f)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        selected.sort_by(|a, b| {
            entity::updated_at(a)
                .cmp(&entity::updated_at(b))
                .then_with(|| entity::id(a).cmp(&entity::id(b)))
        });
        Ok(selected)
    }

    async fn insert_returning_id(&self, table: &str, row: &Entity) -> RemoteResult<Option<String>> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);

        if self.duplicate_on_insert.load(Ordering::SeqCst) {
            return Err(tidemark_core::RemoteError::DuplicateKey("duplicate key".to_string()));
        }
        if self.silent_insert_drop.load(Ordering::SeqCst) {
            return Ok(None);
        }

        let id = entity::id(row).map(str::to_string);
        if let Some(id) = &id {
            self.rows.lock().entry(table.to_string()).or_default().insert(id.clone(), row.clone());
        }
        Ok(id)
    }

    async fn update_returning_id(
        &self,
        table: &str,
        id: &str,
        patch: &Entity,
    ) -> RemoteResult<Option<String>> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);

        if self.deny_updates.load(Ordering::SeqCst) {
            return Ok(None);
        }

        let mut rows = self.rows.lock();
        let Some(row) = rows.get_mut(table).and_then(|table_rows| table_rows.get_mut(id)) else {
            return Ok(None);
        };
        for (key, value) in patch {
            row.insert(key.clone(), value.clone());
        }
        Ok(Some(id.to_string()))
    }

    async fn delete_where(&self, table: &str, filters: &[Filter]) -> RemoteResult<Vec<String>> {
        let mut rows = self.rows.lock();
        let Some(table_rows) = rows.get_mut(table) else {
            return Ok(Vec::new());
        };

        let doomed: Vec<String> = table_rows
            .iter()
            .filter(|(_, row)| filters.iter().all(|f| Self::matches(row, f)))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &doomed {
            table_rows.remove(id);
        }
        Ok(doomed)
    }

    async fn session(&self) -> RemoteResult<Option<Session>> {
        Ok(self
            .user
            .lock()
            .clone()
            .map(|user_id| Session { user_id, expires_at: None }))
    }

    async fn refresh_session(&self) -> RemoteResult<Option<Session>> {
        self.session().await
    }

    async fn validate_user(&self) -> RemoteResult<Option<String>> {
        Ok(self.user.lock().clone())
    }

    async fn subscribe(
        &self,
        _channel: &str,
        _tables: &[String],
    ) -> RemoteResult<ChannelSubscription> {
        let (tx, rx) = tokio::sync::mpsc::channel(16);
        self.channels.lock().push(tx);
        Ok(ChannelSubscription::new(rx))
    }
}

/// Fully wired engine over an in-memory database and the mock backend.
pub struct Harness {
    pub config: Arc<EngineConfig>,
    pub db: Arc<DbManager>,
    pub store: Arc<SqliteLocalStore>,
    pub outbox: Arc<SqliteOutboxRepository>,
    pub history: Arc<SqliteHistoryRepository>,
    pub kv: Arc<SqliteKvRepository>,
    pub remote: Arc<MockRemote>,
    pub auth: Arc<AuthGate>,
    pub realtime: Arc<RealtimeManager>,
    pub engine: Arc<SyncEngine>,
    pub api: DataApi,
    pub recently_modified: Arc<RecentGuard>,
    pub recently_processed: Arc<RecentGuard>,
    pub online_tx: Arc<watch::Sender<bool>>,
}

impl Harness {
    /// Stored cursor for the default user.
    pub async fn cursor(&self) -> Option<DateTime<Utc>> {
        let key = format!("lastSyncCursor_{TEST_USER}");
        let raw = KeyValueStore::get(self.kv.as_ref(), &key).await.expect("kv readable");
        raw.as_deref()
            .and_then(|value| DateTime::parse_from_rfc3339(value).ok())
            .map(|parsed| parsed.with_timezone(&Utc))
    }

    /// Current outbox snapshot.
    pub async fn outbox_items(&self) -> Vec<tidemark_domain::OutboxItem> {
        self.outbox.list_all().await.expect("outbox readable")
    }

    /// Local row by table and id.
    pub async fn local_row(&self, table: &str, id: &str) -> Option<Entity> {
        LocalStore::get(self.store.as_ref(), table, id).await.expect("store readable")
    }
}

/// Build a harness that starts online.
pub async fn harness() -> Harness {
    harness_with(true).await
}

/// Build a harness with the given initial connectivity.
pub async fn harness_with(online: bool) -> Harness {
    let config = Arc::new(EngineConfig {
        prefix: "tidemark-test".to_string(),
        tables: vec![
            TableConfig::new("tasks"),
            TableConfig::new("goals"),
            TableConfig::new("profile").singleton(),
        ],
        ..EngineConfig::default()
    });

    let db = Arc::new(DbManager::in_memory().expect("in-memory database"));
    db.run_migrations(&config).expect("migrations apply");

    let store = Arc::new(SqliteLocalStore::new(Arc::clone(&db), Arc::clone(&config)));
    let outbox = Arc::new(SqliteOutboxRepository::new(Arc::clone(&db)));
    let history = Arc::new(SqliteHistoryRepository::new(Arc::clone(&db)));
    let kv = Arc::new(SqliteKvRepository::new(Arc::clone(&db)));
    let remote = MockRemote::new();

    let (online_tx, online_rx) = watch::channel(online);
    let online_tx = Arc::new(online_tx);
    let device = DeviceIdentity::fixed(LOCAL_DEVICE);
    let recently_modified = Arc::new(RecentGuard::new());
    let recently_processed = Arc::new(RecentGuard::new());

    let auth = Arc::new(AuthGate::new(Arc::clone(&remote) as Arc<dyn RemoteAdapter>));

    let realtime = RealtimeManager::new(tidemark_infra::realtime::RealtimeDeps {
        config: Arc::clone(&config),
        remote: Arc::clone(&remote) as Arc<dyn RemoteAdapter>,
        store: Arc::clone(&store) as Arc<dyn LocalStore>,
        outbox: Arc::clone(&outbox) as Arc<dyn OutboxQueue>,
        history: Arc::clone(&history) as Arc<dyn ConflictHistoryStore>,
        device: device.clone(),
        recently_processed: Arc::clone(&recently_processed),
        delete_observer: Arc::new(ImmediateDelete),
        online: online_rx.clone(),
    });

    let engine = SyncEngine::new(tidemark_infra::sync::SyncEngineDeps {
        config: Arc::clone(&config),
        store: Arc::clone(&store) as Arc<dyn LocalStore>,
        outbox: Arc::clone(&outbox) as Arc<dyn OutboxQueue>,
        history: Arc::clone(&history) as Arc<dyn ConflictHistoryStore>,
        kv: Arc::clone(&kv) as Arc<dyn KeyValueStore>,
        remote: Arc::clone(&remote) as Arc<dyn RemoteAdapter>,
        auth: Arc::clone(&auth),
        device: device.clone(),
        recently_modified: Arc::clone(&recently_modified),
        recently_processed: Arc::clone(&recently_processed),
        realtime: Arc::clone(&realtime),
        online: online_rx.clone(),
        egress: Arc::new(EgressCounter::new()),
    });

    let api = DataApi::new(
        Arc::clone(&config),
        Arc::clone(&store) as Arc<dyn LocalStore>,
        Arc::clone(&remote) as Arc<dyn RemoteAdapter>,
        device,
        Arc::clone(&recently_modified),
        online_rx,
        engine.handle(),
    );

    Harness {
        config,
        db,
        store,
        outbox,
        history,
        kv,
        remote,
        auth,
        realtime,
        engine,
        api,
        recently_modified,
        recently_processed,
        online_tx,
    }
}

/// Entity literal helper.
pub fn obj(value: Value) -> Entity {
    match value {
        Value::Object(map) => map,
        _ => Entity::new(),
    }
}
