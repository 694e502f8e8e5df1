//! Realtime subscription manager.
//!
//! Holds at most one multiplexed change-stream subscription per user and
//! applies incoming rows through the conflict resolver. Echoes of this
//! device's own writes are dropped, and every processed entity is recorded
//! in the dedup guard so a poll returning the same row inside the window is
//! not applied twice.
//!
//! Reconnection uses exponential backoff with a scheduling flag so that an
//! error and a close arriving for one disconnection never stack timers.
//! While offline no reconnect is scheduled; the network monitor restarts
//! the subscription on the online transition.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tidemark_core::conflict::resolve_conflict;
use tidemark_core::observer::{DeletePendingObserver, Observers};
use tidemark_core::remote::ports::RemoteAdapter;
use tidemark_core::store::ports::{ConflictHistoryStore, LocalStore, OutboxQueue, WriteBatch};
use tidemark_core::{DeviceIdentity, RecentGuard};
use tidemark_domain::constants::REALTIME_MAX_BACKOFF_EXPONENT;
use tidemark_domain::entity;
use tidemark_domain::{
    ChangeEvent, ChangeEventType, ChannelMessage, ConflictHistoryEntry, ConnectionState,
    EngineConfig, Entity, Result,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One remote change applied locally, delivered to data observers.
#[derive(Debug, Clone)]
pub struct RemoteChange {
    /// Remote table name.
    pub table: String,
    /// Entity the change applies to.
    pub entity_id: String,
    /// Application fields whose values changed; never empty.
    pub changed_fields: Vec<String>,
    /// Row now stored locally; absent after a hard delete.
    pub row: Option<Entity>,
}

/// Collaborators of the realtime manager.
pub struct RealtimeDeps {
    /// Engine configuration.
    pub config: Arc<EngineConfig>,
    /// Backend adapter providing the change stream.
    pub remote: Arc<dyn RemoteAdapter>,
    /// Local store receiving applied rows.
    pub store: Arc<dyn LocalStore>,
    /// Outbox consulted for pending intents during resolution.
    pub outbox: Arc<dyn OutboxQueue>,
    /// Conflict audit sink; appends are best-effort.
    pub history: Arc<dyn ConflictHistoryStore>,
    /// This device's identity for echo suppression.
    pub device: DeviceIdentity,
    /// Dedup guard shared with the pull path.
    pub recently_processed: Arc<RecentGuard>,
    /// UI hook awaited before deletions disappear.
    pub delete_observer: Arc<dyn DeletePendingObserver>,
    /// Online flag owned by the network monitor.
    pub online: watch::Receiver<bool>,
}

/// Singleton change-stream consumer for one user.
pub struct RealtimeManager {
    deps: RealtimeDeps,
    remote_changes: Arc<Observers<RemoteChange>>,
    state_tx: watch::Sender<ConnectionState>,
    user_id: Mutex<Option<String>>,
    reconnect_attempts: AtomicU32,
    reconnect_scheduled: AtomicBool,
    cancellation: Mutex<CancellationToken>,
    task_handle: Mutex<Option<JoinHandle<()>>>,
}

impl RealtimeManager {
    /// Build a manager in the disconnected state.
    pub fn new(deps: RealtimeDeps) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new(Self {
            deps,
            remote_changes: Arc::new(Observers::new()),
            state_tx,
            user_id: Mutex::new(None),
            reconnect_attempts: AtomicU32::new(0),
            reconnect_scheduled: AtomicBool::new(false),
            cancellation: Mutex::new(CancellationToken::new()),
            task_handle: Mutex::new(None),
        })
    }

    /// Observers notified after a remote change lands locally.
    pub fn remote_changes(&self) -> &Arc<Observers<RemoteChange>> {
        &self.remote_changes
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Watch handle for the connection state.
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Reconnect attempts since the last successful subscribe.
    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::Relaxed)
    }

    /// User the manager is subscribed for, if any.
    pub fn current_user(&self) -> Option<String> {
        self.user_id.lock().clone()
    }

    /// Start or restart the subscription for a user.
    ///
    /// Starting for the user already connected is a no-op; otherwise any
    /// existing subscription is torn down first.
    pub fn start(self: &Arc<Self>, user_id: &str) {
        if self.state() == ConnectionState::Connected
            && self.current_user().as_deref() == Some(user_id)
        {
            debug!(user_id, "realtime already connected for user");
            return;
        }

        self.cancel_task();
        *self.user_id.lock() = Some(user_id.to_string());
        self.reconnect_attempts.store(0, Ordering::Relaxed);
        self.reconnect_scheduled.store(false, Ordering::Relaxed);

        let token = CancellationToken::new();
        *self.cancellation.lock() = token.clone();

        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            manager.run(token).await;
        });
        *self.task_handle.lock() = Some(handle);

        info!(user_id, "realtime manager started");
    }

    /// Tear down the subscription but remember the user; called on offline.
    pub fn pause(&self) {
        self.cancel_task();
        self.reconnect_attempts.store(0, Ordering::Relaxed);
        self.reconnect_scheduled.store(false, Ordering::Relaxed);
        self.set_state(ConnectionState::Disconnected);
        debug!("realtime manager paused");
    }

    /// Tear down the subscription and forget the user; called on logout.
    pub fn stop(&self) {
        self.pause();
        *self.user_id.lock() = None;
        self.deps.recently_processed.clear();
        info!("realtime manager stopped");
    }

    fn cancel_task(&self) {
        self.cancellation.lock().cancel();
        if let Some(handle) = self.task_handle.lock().take() {
            handle.abort();
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                self.set_state(ConnectionState::Disconnected);
                return;
            }
            let Some(user) = self.current_user() else {
                self.set_state(ConnectionState::Disconnected);
                return;
            };

            self.set_state(ConnectionState::Connecting);
            let channel_name = format!("{}:{}", self.deps.config.prefix, user);
            let tables = self.deps.config.remote_names();

            match self.deps.remote.subscribe(&channel_name, &tables).await {
                Ok(mut subscription) => {
                    self.set_state(ConnectionState::Connected);
                    self.reconnect_attempts.store(0, Ordering::Relaxed);
                    self.reconnect_scheduled.store(false, Ordering::Relaxed);
                    info!(channel = %channel_name, "change stream subscribed");

                    loop {
                        tokio::select! {
                            () = cancel.cancelled() => {
                                self.set_state(ConnectionState::Disconnected);
                                return;
                            }
                            message = subscription.recv() => match message {
                                Some(ChannelMessage::Event(event)) => {
                                    // One bad event never stops the stream.
                                    if let Err(error) = self.process_event(event).await {
                                        warn!(error = %error, "realtime event processing failed");
                                    }
                                }
                                Some(ChannelMessage::Error(reason)) => {
                                    warn!(reason = %reason, "change stream errored");
                                    break;
                                }
                                Some(ChannelMessage::Closed) | None => {
                                    debug!("change stream closed");
                                    break;
                                }
                            }
                        }
                    }
                }
                Err(error) => {
                    warn!(error = %error, "change stream subscription failed");
                }
            }

            if cancel.is_cancelled() {
                self.set_state(ConnectionState::Disconnected);
                return;
            }
            if !*self.deps.online.borrow() {
                // Offline: no timer; the online transition restarts us.
                self.set_state(ConnectionState::Disconnected);
                return;
            }
            if self.reconnect_scheduled.swap(true, Ordering::SeqCst) {
                continue;
            }

            self.set_state(ConnectionState::Error);
            let exponent = self
                .reconnect_attempts
                .fetch_add(1, Ordering::SeqCst)
                .min(REALTIME_MAX_BACKOFF_EXPONENT);
            let delay = std::time::Duration::from_secs(1_u64 << exponent);
            debug!(delay_secs = delay.as_secs(), "scheduling change stream reconnect");

            tokio::select! {
                () = cancel.cancelled() => {
                    self.reconnect_scheduled.store(false, Ordering::SeqCst);
                    self.set_state(ConnectionState::Disconnected);
                    return;
                }
                () = tokio::time::sleep(delay) => {}
            }
            self.reconnect_scheduled.store(false, Ordering::SeqCst);
        }
    }

    /// Apply one incoming change per the event pipeline.
    pub async fn process_event(&self, event: ChangeEvent) -> Result<()> {
        let Some(entity_id) = event.entity_id().map(str::to_string) else {
            warn!(table = %event.table, "change event without entity id dropped");
            return Ok(());
        };

        if let Some(new) = &event.new {
            if entity::device_id(new) == Some(self.deps.device.as_str()) {
                debug!(entity_id = %entity_id, "own echo dropped");
                return Ok(());
            }
        }

        if self.deps.recently_processed.contains(&entity_id) {
            debug!(entity_id = %entity_id, "duplicate delivery inside dedup window dropped");
            return Ok(());
        }

        if self.deps.config.table(&event.table).is_none() {
            warn!(table = %event.table, "change event for unconfigured table dropped");
            return Ok(());
        }

        match event.event_type {
            ChangeEventType::Insert | ChangeEventType::Update => {
                let Some(new) = event.new else {
                    warn!(entity_id = %entity_id, "upsert event without a new row dropped");
                    return Ok(());
                };
                self.apply_upsert(&event.table, &entity_id, new).await
            }
            ChangeEventType::Delete => self.apply_hard_delete(&event.table, &entity_id, event.old).await,
        }
    }

    async fn apply_upsert(&self, table: &str, entity_id: &str, new: Entity) -> Result<()> {
        let local = self.deps.store.get(table, entity_id).await?;

        // A remote tombstone arriving over a live local row gets the UI a
        // chance to animate before the row flips.
        if entity::is_deleted(&new) && local.as_ref().is_some_and(|row| !entity::is_deleted(row)) {
            self.deps.delete_observer.on_delete_pending(table, entity_id).await;

            let mut batch = WriteBatch::new();
            batch.put(table, new.clone());
            self.deps.store.commit(batch).await?;

            self.deps.recently_processed.mark(entity_id);
            self.remote_changes.notify(&RemoteChange {
                table: table.to_string(),
                entity_id: entity_id.to_string(),
                changed_fields: vec![entity::DELETED.to_string()],
                row: Some(new),
            });
            return Ok(());
        }

        let changed_fields = diff_fields(local.as_ref(), &new);

        let (applied, history) = match &local {
            None => (Some(new.clone()), Vec::new()),
            Some(local_row) => {
                let pending = self.deps.outbox.pending_for_entity(table, entity_id).await?;
                if pending.is_empty() {
                    if entity::updated_at(&new) > entity::updated_at(local_row) {
                        (Some(new.clone()), Vec::new())
                    } else {
                        (None, Vec::new())
                    }
                } else {
                    let Some(table_config) = self.deps.config.table(table) else {
                        return Ok(());
                    };
                    let resolution =
                        resolve_conflict(table_config, Some(local_row), &new, &pending);
                    let at = chrono::Utc::now();
                    let history: Vec<ConflictHistoryEntry> = resolution
                        .field_resolutions
                        .iter()
                        .map(|r| ConflictHistoryEntry::from_resolution(table, entity_id, r, at))
                        .collect();
                    (Some(resolution.merged_entity), history)
                }
            }
        };

        if let Some(row) = applied {
            let mut batch = WriteBatch::new();
            batch.put(table, row.clone());
            self.deps.store.commit(batch).await?;

            if !history.is_empty() {
                if let Err(error) = self.deps.history.append(&history).await {
                    warn!(error = %error, "conflict history append failed");
                }
            }

            self.deps.recently_processed.mark(entity_id);
            if !changed_fields.is_empty() {
                self.remote_changes.notify(&RemoteChange {
                    table: table.to_string(),
                    entity_id: entity_id.to_string(),
                    changed_fields,
                    row: Some(row),
                });
            }
        } else {
            self.deps.recently_processed.mark(entity_id);
        }

        Ok(())
    }

    async fn apply_hard_delete(
        &self,
        table: &str,
        entity_id: &str,
        old: Option<Entity>,
    ) -> Result<()> {
        self.deps.delete_observer.on_delete_pending(table, entity_id).await;

        let mut batch = WriteBatch::new();
        batch.hard_delete(table, entity_id);
        self.deps.store.commit(batch).await?;

        self.deps.recently_processed.mark(entity_id);
        self.remote_changes.notify(&RemoteChange {
            table: table.to_string(),
            entity_id: entity_id.to_string(),
            changed_fields: old
                .as_ref()
                .map(|row| row.keys().cloned().collect())
                .unwrap_or_else(|| vec![entity::ID.to_string()]),
            row: None,
        });

        Ok(())
    }
}

impl Drop for RealtimeManager {
    fn drop(&mut self) {
        let token = self.cancellation.lock();
        if !token.is_cancelled() {
            warn!("RealtimeManager dropped while running; cancelling");
            token.cancel();
        }
    }
}

/// Application fields whose values differ, `updated_at` and `_version`
/// excluded.
fn diff_fields(local: Option<&Entity>, new: &Entity) -> Vec<String> {
    let Some(local) = local else {
        return new
            .keys()
            .filter(|key| key.as_str() != entity::UPDATED_AT && key.as_str() != entity::VERSION)
            .cloned()
            .collect();
    };

    let mut fields: Vec<String> = Vec::new();
    for key in local.keys().chain(new.keys()) {
        if key == entity::UPDATED_AT || key == entity::VERSION || fields.contains(key) {
            continue;
        }
        if local.get(key) != new.get(key) {
            fields.push(key.clone());
        }
    }
    fields
}
