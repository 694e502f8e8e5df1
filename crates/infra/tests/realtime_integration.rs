//! Realtime pipeline behavior over the real store adapters.

mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use support::{harness, obj, LOCAL_DEVICE};
use tidemark_core::observer::DeletePendingObserver;
use tidemark_core::store::ports::{
    ConflictHistoryStore, LocalStore, OutboxQueue, WriteBatch,
};
use tidemark_domain::entity;
use tidemark_domain::{ChangeEvent, ChangeEventType, NewOutboxItem, OutboxOp, SyncTrigger};

fn update_event(table: &str, new: serde_json::Value) -> ChangeEvent {
    ChangeEvent {
        table: table.to_string(),
        event_type: ChangeEventType::Update,
        new: Some(obj(new)),
        old: None,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn own_echo_never_writes_locally() {
    let fx = harness().await;

    let event = update_event(
        "tasks",
        json!({
            "id": "e-1", "title": "echo", "deleted": false,
            "updated_at": "2025-01-01T00:00:01Z", "device_id": LOCAL_DEVICE
        }),
    );
    fx.realtime.process_event(event).await.expect("event processed");

    assert!(fx.local_row("tasks", "e-1").await.is_none(), "echo suppressed");
}

#[tokio::test(flavor = "multi_thread")]
async fn realtime_then_poll_applies_exactly_once() {
    let fx = harness().await;

    let row = json!({
        "id": "e-1", "title": "from-remote", "deleted": false,
        "updated_at": "2025-01-01T00:00:05Z", "device_id": "other-device",
        "user_id": support::TEST_USER, "_version": 3
    });
    fx.remote.seed("tasks", obj(row.clone()));

    fx.realtime.process_event(update_event("tasks", row.clone())).await.expect("applied");
    let applied = fx.local_row("tasks", "e-1").await.expect("row applied");
    assert_eq!(applied.get("title"), Some(&json!("from-remote")));

    // The poll fires inside the dedup window and returns the same row.
    fx.engine.run_full_sync(SyncTrigger::Manual, true, false).await.expect("pull");

    let after_pull = fx.local_row("tasks", "e-1").await.expect("row kept");
    assert_eq!(after_pull, applied, "pull made no additional write");

    let cursor = fx.cursor().await.expect("cursor advanced");
    assert_eq!(cursor.to_rfc3339(), "2025-01-01T00:00:05+00:00");
}

#[tokio::test(flavor = "multi_thread")]
async fn newer_remote_row_overwrites_when_nothing_pends() {
    let fx = harness().await;

    let mut batch = WriteBatch::new();
    batch.put(
        "tasks",
        obj(json!({
            "id": "e-1", "title": "old", "deleted": false,
            "updated_at": "2025-01-01T00:00:01Z", "device_id": "other"
        })),
    );
    LocalStore::commit(fx.store.as_ref(), batch).await.expect("seed local");

    let event = update_event(
        "tasks",
        json!({
            "id": "e-1", "title": "new", "deleted": false,
            "updated_at": "2025-01-01T00:00:09Z", "device_id": "third"
        }),
    );
    fx.realtime.process_event(event).await.expect("processed");

    let row = fx.local_row("tasks", "e-1").await.expect("row present");
    assert_eq!(row.get("title"), Some(&json!("new")));
}

#[tokio::test(flavor = "multi_thread")]
async fn stale_remote_row_is_ignored() {
    let fx = harness().await;

    let mut batch = WriteBatch::new();
    batch.put(
        "tasks",
        obj(json!({
            "id": "e-1", "title": "current", "deleted": false,
            "updated_at": "2025-01-01T00:00:09Z", "device_id": "other"
        })),
    );
    LocalStore::commit(fx.store.as_ref(), batch).await.expect("seed local");

    let event = update_event(
        "tasks",
        json!({
            "id": "e-1", "title": "stale", "deleted": false,
            "updated_at": "2025-01-01T00:00:01Z", "device_id": "third"
        }),
    );
    fx.realtime.process_event(event).await.expect("processed");

    let row = fx.local_row("tasks", "e-1").await.expect("row present");
    assert_eq!(row.get("title"), Some(&json!("current")));
}

#[tokio::test(flavor = "multi_thread")]
async fn pending_intent_shields_field_and_records_history() {
    let fx = harness().await;

    let mut batch = WriteBatch::new();
    batch.put(
        "tasks",
        obj(json!({
            "id": "e-1", "title": "A", "deleted": false, "_version": 1,
            "updated_at": "2025-01-01T00:00:02Z", "device_id": "d1"
        })),
    );
    batch.enqueue(
        NewOutboxItem::new("tasks", "e-1", OutboxOp::Set)
            .with_field("title")
            .with_value(json!("A")),
    );
    LocalStore::commit(fx.store.as_ref(), batch).await.expect("seed local");

    let event = update_event(
        "tasks",
        json!({
            "id": "e-1", "title": "B", "deleted": false, "_version": 1,
            "updated_at": "2025-01-01T00:00:03Z", "device_id": "d2"
        }),
    );
    fx.realtime.process_event(event).await.expect("processed");

    let row = fx.local_row("tasks", "e-1").await.expect("row present");
    assert_eq!(row.get("title"), Some(&json!("A")), "pending local write wins");
    assert_eq!(entity::version(&row), 2, "merge bumped the version");

    let history = ConflictHistoryStore::list_for_entity(fx.history.as_ref(), "tasks", "e-1")
        .await
        .expect("history readable");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].field, "title");
}

#[tokio::test(flavor = "multi_thread")]
async fn hard_delete_awaits_observer_then_removes() {
    struct CountingObserver {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DeletePendingObserver for CountingObserver {
        async fn on_delete_pending(&self, _table: &str, _entity_id: &str) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    let fx = harness().await;
    let observer = Arc::new(CountingObserver { calls: AtomicUsize::new(0) });

    // A dedicated manager with the counting observer.
    let realtime = tidemark_infra::RealtimeManager::new(tidemark_infra::realtime::RealtimeDeps {
        config: Arc::clone(&fx.config),
        remote: Arc::clone(&fx.remote) as Arc<dyn tidemark_core::RemoteAdapter>,
        store: Arc::clone(&fx.store) as Arc<dyn LocalStore>,
        outbox: Arc::clone(&fx.outbox) as Arc<dyn OutboxQueue>,
        history: Arc::clone(&fx.history) as Arc<dyn ConflictHistoryStore>,
        device: tidemark_core::DeviceIdentity::fixed(LOCAL_DEVICE),
        recently_processed: Arc::clone(&fx.recently_processed),
        delete_observer: Arc::clone(&observer) as Arc<dyn DeletePendingObserver>,
        online: fx.online_tx.subscribe(),
    });

    let mut batch = WriteBatch::new();
    batch.put(
        "tasks",
        obj(json!({
            "id": "e-1", "title": "doomed", "deleted": false,
            "updated_at": "2025-01-01T00:00:01Z", "device_id": "other"
        })),
    );
    LocalStore::commit(fx.store.as_ref(), batch).await.expect("seed local");

    let event = ChangeEvent {
        table: "tasks".to_string(),
        event_type: ChangeEventType::Delete,
        new: None,
        old: Some(obj(json!({"id": "e-1"}))),
    };
    realtime.process_event(event).await.expect("processed");

    assert_eq!(observer.calls.load(Ordering::SeqCst), 1, "observer consulted first");
    assert!(fx.local_row("tasks", "e-1").await.is_none(), "row removed");
}

#[tokio::test(flavor = "multi_thread")]
async fn soft_delete_transition_applies_tombstone() {
    let fx = harness().await;

    let mut batch = WriteBatch::new();
    batch.put(
        "tasks",
        obj(json!({
            "id": "e-1", "title": "alive", "deleted": false,
            "updated_at": "2025-01-01T00:00:01Z", "device_id": "other"
        })),
    );
    LocalStore::commit(fx.store.as_ref(), batch).await.expect("seed local");

    let event = update_event(
        "tasks",
        json!({
            "id": "e-1", "title": "alive", "deleted": true,
            "updated_at": "2025-01-01T00:00:08Z", "device_id": "other"
        }),
    );
    fx.realtime.process_event(event).await.expect("processed");

    let row = fx.local_row("tasks", "e-1").await.expect("tombstone kept");
    assert!(entity::is_deleted(&row));
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_delivery_inside_window_is_dropped() {
    let fx = harness().await;

    let row = json!({
        "id": "e-1", "title": "v1", "deleted": false,
        "updated_at": "2025-01-01T00:00:05Z", "device_id": "other"
    });
    fx.realtime.process_event(update_event("tasks", row.clone())).await.expect("first");

    // At-least-once delivery repeats the same event immediately; a newer
    // variant inside the window is also dropped.
    let newer = json!({
        "id": "e-1", "title": "v2", "deleted": false,
        "updated_at": "2025-01-01T00:00:06Z", "device_id": "other"
    });
    fx.realtime.process_event(update_event("tasks", newer)).await.expect("second");

    let stored = fx.local_row("tasks", "e-1").await.expect("row present");
    assert_eq!(stored.get("title"), Some(&json!("v1")), "window suppressed the duplicate");
}
