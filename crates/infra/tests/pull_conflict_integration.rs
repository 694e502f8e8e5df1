//! Conflict handling on the polling path.

mod support;

use serde_json::json;
use support::{harness, obj, TEST_USER};
use tidemark_core::store::ports::{ConflictHistoryStore, LocalStore, WriteBatch};
use tidemark_domain::entity;
use tidemark_domain::{ConflictStrategy, NewOutboxItem, OutboxOp, SyncTrigger};

async fn seed_local(fx: &support::Harness, row: serde_json::Value, pending_title: Option<&str>) {
    let mut batch = WriteBatch::new();
    let row = obj(row);
    let id = entity::id(&row).expect("id").to_string();
    batch.put("tasks", row);
    if let Some(value) = pending_title {
        batch.enqueue(
            NewOutboxItem::new("tasks", &id, OutboxOp::Set)
                .with_field("title")
                .with_value(json!(value)),
        );
    }
    LocalStore::commit(fx.store.as_ref(), batch).await.expect("seed local");
}

#[tokio::test(flavor = "multi_thread")]
async fn newer_remote_overwrites_without_pending_ops() {
    let fx = harness().await;

    seed_local(
        &fx,
        json!({
            "id": "E", "title": "A", "deleted": false, "_version": 1,
            "updated_at": "2025-01-01T00:00:02Z", "device_id": "d1"
        }),
        None,
    )
    .await;

    fx.remote.seed(
        "tasks",
        obj(json!({
            "id": "E", "title": "B", "deleted": false, "_version": 1,
            "updated_at": "2025-01-01T00:00:03Z", "device_id": "d2", "user_id": TEST_USER
        })),
    );

    fx.engine.run_full_sync(SyncTrigger::Manual, true, false).await.expect("sync");

    let row = fx.local_row("tasks", "E").await.expect("row present");
    assert_eq!(row.get("title"), Some(&json!("B")), "newer remote wins outright");
}

#[tokio::test(flavor = "multi_thread")]
async fn pending_local_write_survives_pull() {
    let fx = harness().await;

    seed_local(
        &fx,
        json!({
            "id": "E", "title": "A", "deleted": false, "_version": 1,
            "updated_at": "2025-01-01T00:00:02Z", "device_id": "d1"
        }),
        Some("A"),
    )
    .await;

    // The pending set cannot push: the backend has no such row yet and the
    // push is blocked; the pull still arrives with a newer remote title.
    fx.remote.deny_updates.store(true, std::sync::atomic::Ordering::SeqCst);
    fx.remote.seed(
        "tasks",
        obj(json!({
            "id": "E", "title": "B", "deleted": false, "_version": 1,
            "updated_at": "2025-01-01T00:00:03Z", "device_id": "d2", "user_id": TEST_USER
        })),
    );

    fx.engine.run_full_sync(SyncTrigger::Manual, true, false).await.expect("sync");

    let row = fx.local_row("tasks", "E").await.expect("row present");
    assert_eq!(row.get("title"), Some(&json!("A")), "pending intent shields the field");
    assert_eq!(entity::version(&row), 2);

    let history = ConflictHistoryStore::list_for_entity(fx.history.as_ref(), "tasks", "E")
        .await
        .expect("history readable");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].strategy, ConflictStrategy::LocalPending);
}

#[tokio::test(flavor = "multi_thread")]
async fn remote_tombstone_dominates_pending_edits() {
    let fx = harness().await;

    seed_local(
        &fx,
        json!({
            "id": "E", "title": "A", "deleted": false, "_version": 1,
            "updated_at": "2025-01-01T00:00:02Z", "device_id": "d1"
        }),
        Some("A"),
    )
    .await;
    fx.remote.deny_updates.store(true, std::sync::atomic::Ordering::SeqCst);

    fx.remote.seed(
        "tasks",
        obj(json!({
            "id": "E", "title": "A", "deleted": true, "_version": 1,
            "updated_at": "2025-01-01T00:00:04Z", "device_id": "d2", "user_id": TEST_USER
        })),
    );

    fx.engine.run_full_sync(SyncTrigger::Manual, true, false).await.expect("sync");

    let row = fx.local_row("tasks", "E").await.expect("row present");
    assert!(entity::is_deleted(&row), "deletion dominates the merge");

    let history = ConflictHistoryStore::list_for_entity(fx.history.as_ref(), "tasks", "E")
        .await
        .expect("history readable");
    assert_eq!(history[0].strategy, ConflictStrategy::DeleteWins);
}

#[tokio::test(flavor = "multi_thread")]
async fn fresh_local_write_is_shielded_from_pull() {
    let fx = harness().await;

    // A write through the data API marks the entity recently modified. The
    // push is held back so the poll races the fresh write.
    fx.remote.silent_insert_drop.store(true, std::sync::atomic::Ordering::SeqCst);
    let created = fx.api.create("tasks", obj(json!({"title": "mine"}))).await.expect("create");
    let id = entity::id(&created).expect("id").to_string();

    // A remote row with a newer timestamp arrives via poll right away.
    fx.remote.seed(
        "tasks",
        obj(json!({
            "id": id, "title": "theirs", "deleted": false,
            "updated_at": "2099-01-01T00:00:00Z", "device_id": "d2", "user_id": TEST_USER
        })),
    );

    fx.engine.run_full_sync(SyncTrigger::Manual, true, false).await.expect("sync");

    let row = fx.local_row("tasks", &id).await.expect("row present");
    assert_eq!(
        row.get("title"),
        Some(&json!("mine")),
        "recently-modified guard shields the fresh write"
    );
}
