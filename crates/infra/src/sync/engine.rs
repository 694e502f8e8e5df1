//! Sync engine orchestration.
//!
//! Owns the push/pull cycle, the non-queueing sync lock with its watchdog,
//! debounced and periodic scheduling, startup hydration, and the
//! diagnostics window. Every cycle runs push before pull; both phases are
//! wrapped in timeouts and the lock is released on every exit path.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tidemark_core::observer::{Observers, SyncNudge};
use tidemark_core::store::ports::{
    ConflictHistoryStore, KeyValueStore, LocalStore, OutboxQueue, WriteBatch,
};
use tidemark_core::{AuthGate, DeviceIdentity, RecentGuard, RemoteAdapter};
use tidemark_domain::constants::{
    CONFLICT_HISTORY_RETENTION_DAYS, PULL_MAX_ATTEMPTS, PULL_TIMEOUT_SECS, PUSH_TIMEOUT_SECS,
    SYNC_LOCK_STALE_SECS, SYNC_STATS_WINDOW, SYNC_WATCHDOG_INTERVAL_SECS,
    TOMBSTONE_SWEEP_INTERVAL_SECS,
};
use tidemark_domain::entity;
use tidemark_domain::{
    ConnectionState, DiagnosticsSnapshot, EngineConfig, EngineError, NewOutboxItem, OutboxOp,
    Result, SyncCycleStats, SyncErrorDetail, SyncStatus, SyncStatusReport, SyncTrigger,
};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::pull::{cursor_key, run_pull};
use super::push::run_push;
use super::sweeper::TombstoneSweeper;
use crate::api::EgressCounter;
use crate::realtime::RealtimeManager;

/// Collaborators of the sync engine.
pub struct SyncEngineDeps {
    /// Engine configuration.
    pub config: Arc<EngineConfig>,
    /// Local store.
    pub store: Arc<dyn LocalStore>,
    /// Outbox queue.
    pub outbox: Arc<dyn OutboxQueue>,
    /// Conflict audit store; pruned with the sweep.
    pub history: Arc<dyn ConflictHistoryStore>,
    /// Key-value namespace holding the cursor.
    pub kv: Arc<dyn KeyValueStore>,
    /// Backend adapter.
    pub remote: Arc<dyn RemoteAdapter>,
    /// Session gate.
    pub auth: Arc<AuthGate>,
    /// This device's identity.
    pub device: DeviceIdentity,
    /// Guard shielding fresh local writes from the pull.
    pub recently_modified: Arc<RecentGuard>,
    /// Guard deduplicating realtime against the pull.
    pub recently_processed: Arc<RecentGuard>,
    /// Realtime manager; consulted for push-only decisions and diagnostics.
    pub realtime: Arc<RealtimeManager>,
    /// Online flag owned by the network monitor.
    pub online: watch::Receiver<bool>,
    /// Backend egress accounting.
    pub egress: Arc<EgressCounter>,
}

/// Non-queueing lock serializing sync cycles and hydration.
struct SyncLock {
    held_since: Mutex<Option<Instant>>,
}

impl SyncLock {
    fn new() -> Self {
        Self { held_since: Mutex::new(None) }
    }

    /// Try to take the lock; a held lock returns `false` immediately.
    fn try_acquire(&self) -> bool {
        let mut held = self.held_since.lock();
        if held.is_some() {
            return false;
        }
        *held = Some(Instant::now());
        true
    }

    fn release(&self) {
        *self.held_since.lock() = None;
    }

    fn held_ms(&self) -> Option<i64> {
        self.held_since.lock().map(|since| i64::try_from(since.elapsed().as_millis()).unwrap_or(i64::MAX))
    }

    /// Force-release when held longer than the stale threshold.
    fn force_release_if_stale(&self, max_age: Duration) -> bool {
        let mut held = self.held_since.lock();
        match *held {
            Some(since) if since.elapsed() >= max_age => {
                *held = None;
                true
            }
            _ => false,
        }
    }
}

/// Nudge handle given to the data API; wakes the debounce task.
pub struct SyncHandle {
    notify: Arc<Notify>,
}

impl SyncNudge for SyncHandle {
    fn nudge(&self) {
        self.notify.notify_one();
    }
}

/// Push/pull orchestrator.
pub struct SyncEngine {
    deps: SyncEngineDeps,
    sweeper: TombstoneSweeper,
    lock: SyncLock,
    status_observers: Arc<Observers<SyncStatusReport>>,
    complete_observers: Arc<Observers<SyncCycleStats>>,
    stats: Mutex<VecDeque<SyncCycleStats>>,
    last_error: Mutex<Option<SyncErrorDetail>>,
    last_successful_sync: Mutex<Option<Instant>>,
    last_sweep: Mutex<Option<Instant>>,
    debounce_notify: Arc<Notify>,
    cancellation: Mutex<CancellationToken>,
    task_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncEngine {
    /// Build an engine; background tasks start with [`Self::start`].
    pub fn new(deps: SyncEngineDeps) -> Arc<Self> {
        let sweeper = TombstoneSweeper::new(
            Arc::clone(&deps.config),
            Arc::clone(&deps.store),
            Arc::clone(&deps.remote),
        );

        Arc::new(Self {
            deps,
            sweeper,
            lock: SyncLock::new(),
            status_observers: Arc::new(Observers::new()),
            complete_observers: Arc::new(Observers::new()),
            stats: Mutex::new(VecDeque::with_capacity(SYNC_STATS_WINDOW)),
            last_error: Mutex::new(None),
            last_successful_sync: Mutex::new(None),
            last_sweep: Mutex::new(None),
            debounce_notify: Arc::new(Notify::new()),
            cancellation: Mutex::new(CancellationToken::new()),
            task_handles: Mutex::new(Vec::new()),
        })
    }

    /// Handle wired into the data API to request debounced syncs.
    pub fn handle(&self) -> Arc<SyncHandle> {
        Arc::new(SyncHandle { notify: Arc::clone(&self.debounce_notify) })
    }

    /// Observers notified on status changes.
    pub fn status_observers(&self) -> &Arc<Observers<SyncStatusReport>> {
        &self.status_observers
    }

    /// Observers notified after each completed cycle.
    pub fn complete_observers(&self) -> &Arc<Observers<SyncCycleStats>> {
        &self.complete_observers
    }

    /// Instant of the last fully successful cycle.
    pub fn last_successful_sync_at(&self) -> Option<Instant> {
        *self.last_successful_sync.lock()
    }

    /// Spawn the debounce, interval and watchdog tasks.
    pub fn start(self: &Arc<Self>) {
        let token = CancellationToken::new();
        *self.cancellation.lock() = token.clone();

        let mut handles = self.task_handles.lock();
        handles.push(tokio::spawn(Arc::clone(self).debounce_loop(token.clone())));
        handles.push(tokio::spawn(Arc::clone(self).interval_loop(token.clone())));
        handles.push(tokio::spawn(Arc::clone(self).watchdog_loop(token)));

        info!("sync engine started");
    }

    /// Cancel and drop the background tasks.
    pub fn stop(&self) {
        self.cancellation.lock().cancel();
        for handle in self.task_handles.lock().drain(..) {
            handle.abort();
        }
        info!("sync engine stopped");
    }

    /// Request a debounced sync; called after every local write.
    pub fn schedule_debounced_sync(&self) {
        self.debounce_notify.notify_one();
    }

    /// Mark the engine offline; called by the network monitor.
    pub fn publish_offline(&self) {
        self.publish_status(SyncStatus::Offline, "Device is offline", None, false);
    }

    /// Point-in-time diagnostic snapshot.
    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            connection_state: self.deps.realtime.state(),
            last_error: self.last_error.lock().clone(),
            reconnect_attempts: self.deps.realtime.reconnect_attempts(),
            lock_held_ms: self.lock.held_ms(),
            sync_stats: self.stats.lock().iter().cloned().collect(),
            egress_bytes: self.deps.egress.total(),
            recently_modified_size: self.deps.recently_modified.len(),
            recently_processed_size: self.deps.recently_processed.len(),
        }
    }

    /// Forget per-user state on logout: cursor, session cache, realtime.
    pub async fn handle_logout(&self, user_id: &str) -> Result<()> {
        self.deps.kv.remove(&cursor_key(user_id)).await?;
        self.deps.auth.reset();
        self.deps.realtime.stop();
        info!(user_id, "logout cleanup complete");
        Ok(())
    }

    /// Run one full cycle: auth gating, push, pull, sweep, notify.
    #[instrument(skip(self))]
    pub async fn run_full_sync(
        &self,
        trigger: SyncTrigger,
        quiet: bool,
        skip_pull: bool,
    ) -> Result<()> {
        if !*self.deps.online.borrow() {
            self.publish_status(SyncStatus::Offline, "Device is offline", None, false);
            return Ok(());
        }

        if self.deps.auth.needs_validation() {
            debug!("sync deferred until credentials revalidate");
            return Ok(());
        }

        let Some(user_id) = self.deps.auth.user_id().await else {
            let detail = SyncErrorDetail {
                message: "not_signed_in".to_string(),
                detail: "no authenticated user; writes would be silently dropped".to_string(),
            };
            self.publish_status(SyncStatus::Error, "Not signed in", Some(detail), false);
            return Ok(());
        };

        if !self.lock.try_acquire() {
            debug!("sync cycle already running");
            return Ok(());
        }

        let result = self.run_cycle(&user_id, trigger, quiet, skip_pull).await;
        self.lock.release();

        if let Err(error) = &result {
            let detail = SyncErrorDetail {
                message: "sync_failed".to_string(),
                detail: error.to_string(),
            };
            self.publish_status(SyncStatus::Error, "Sync failed", Some(detail), false);
        }

        result
    }

    /// Probe every configured table for the engine-managed columns.
    ///
    /// A mismatch is a fatal setup error: it is surfaced once and syncing is
    /// withheld, but the engine keeps running so the application can
    /// reconfigure.
    pub async fn validate_remote_schema(&self) -> Result<()> {
        // A far-future cursor keeps the probe result empty; only the column
        // references are exercised.
        let probe_cursor = Utc::now() + chrono::Duration::days(365 * 100);

        for table in &self.deps.config.tables {
            let probe = self
                .deps
                .remote
                .select(
                    &table.remote_name,
                    "id,updated_at,device_id,deleted",
                    Some(probe_cursor),
                    &[],
                )
                .await;

            if let Err(error) = probe {
                if error.is_transient() {
                    return Err(EngineError::Network(format!("schema probe failed: {error}")));
                }
                return Err(EngineError::Config(format!(
                    "backend table {} is missing engine columns: {error}",
                    table.remote_name
                )));
            }
        }

        Ok(())
    }

    /// Hydrate on startup: bulk pull into an empty store, otherwise repair
    /// drift, then run a full cycle.
    ///
    /// The remote schema is probed first; a mismatch surfaces as a fatal
    /// setup error and hydration is withheld.
    pub async fn hydrate(&self) -> Result<()> {
        if !*self.deps.online.borrow() {
            return Ok(());
        }
        let Some(user_id) = self.deps.auth.user_id().await else {
            return Ok(());
        };

        if let Err(error) = self.validate_remote_schema().await {
            let detail = SyncErrorDetail {
                message: "schema_mismatch".to_string(),
                detail: error.to_string(),
            };
            self.publish_status(
                SyncStatus::Error,
                "Backend schema does not match the configuration",
                Some(detail),
                false,
            );
            return Ok(());
        }

        if !self.lock.try_acquire() {
            return Ok(());
        }
        let result = self.hydrate_locked(&user_id).await;
        self.lock.release();
        result?;

        self.run_full_sync(SyncTrigger::Startup, true, false).await
    }

    async fn hydrate_locked(&self, user_id: &str) -> Result<()> {
        let mut all_empty = true;
        for table in &self.deps.config.tables {
            if self.deps.store.count(&table.remote_name).await? > 0 {
                all_empty = false;
                break;
            }
        }

        if all_empty {
            return self.bulk_hydrate(user_id).await;
        }

        let cursor = self.stored_cursor(user_id).await?;
        let max_age = chrono::Duration::days(i64::from(self.deps.config.tombstone_max_age_days));
        let stale = cursor.map_or(true, |c| Utc::now() - c > max_age);

        if stale {
            debug!("cursor stale; running full reconciliation pull");
            run_pull(&self.deps, user_id, None).await?;
        } else if self.deps.outbox.is_empty().await? {
            self.reconcile_orphans(cursor).await?;
        }

        Ok(())
    }

    /// Initial bulk pull into an empty store.
    ///
    /// The cursor is set to the newest `updated_at` among the pulled rows,
    /// never to the current clock, so writes landing during the query are
    /// picked up by the next pull.
    async fn bulk_hydrate(&self, user_id: &str) -> Result<()> {
        let mut batch = WriteBatch::new();
        let mut max_seen: Option<DateTime<Utc>> = None;
        let mut pulled = 0_usize;

        for table in &self.deps.config.tables {
            let rows = self
                .deps
                .remote
                .select(&table.remote_name, &table.columns, None, &[])
                .await
                .map_err(|e| EngineError::Network(format!("hydration select failed: {e}")))?;

            for row in rows {
                if let Some(at) = entity::updated_at(&row) {
                    max_seen = Some(max_seen.map_or(at, |current| current.max(at)));
                }
                if entity::is_deleted(&row) {
                    continue;
                }
                batch.put(&table.remote_name, row);
                pulled += 1;
            }
        }

        if let Some(max_seen) = max_seen {
            batch.set_kv(cursor_key(user_id), max_seen.to_rfc3339());
        }
        self.deps.store.commit(batch).await?;

        info!(pulled, "hydrated empty local store");
        Ok(())
    }

    /// Re-enqueue rows written past the cursor while the outbox was empty.
    async fn reconcile_orphans(&self, cursor: Option<DateTime<Utc>>) -> Result<()> {
        let cursor = cursor.unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut requeued = 0_usize;

        for table in &self.deps.config.tables {
            let orphans = self.deps.store.updated_after(&table.remote_name, cursor).await?;
            for row in orphans {
                let Some(id) = entity::id(&row).map(str::to_string) else {
                    continue;
                };
                let item = if entity::is_deleted(&row) {
                    NewOutboxItem::new(&table.remote_name, &id, OutboxOp::Delete)
                } else {
                    NewOutboxItem::new(&table.remote_name, &id, OutboxOp::Create)
                        .with_value(serde_json::Value::Object(row))
                };
                self.deps.outbox.enqueue(item).await?;
                requeued += 1;
            }
        }

        if requeued > 0 {
            warn!(requeued, "re-enqueued orphaned local writes");
        }
        Ok(())
    }

    async fn run_cycle(
        &self,
        user_id: &str,
        trigger: SyncTrigger,
        quiet: bool,
        skip_pull: bool,
    ) -> Result<()> {
        let started = Instant::now();
        if !quiet {
            self.publish_status(SyncStatus::Syncing, "Syncing", None, false);
        }

        let push_timeout = Duration::from_secs(PUSH_TIMEOUT_SECS);
        let push_outcome = tokio::time::timeout(push_timeout, run_push(&self.deps, user_id))
            .await
            .map_err(|_| EngineError::Timeout(push_timeout))??;
        debug!(
            attempted = push_outcome.attempted,
            pushed = push_outcome.pushed,
            "push phase finished"
        );

        if !push_outcome.exhausted.is_empty() {
            let summary: Vec<String> = push_outcome
                .exhausted
                .iter()
                .map(|(table, count)| format!("{table}: {count}"))
                .collect();
            let detail = SyncErrorDetail {
                message: "changes_discarded".to_string(),
                detail: format!("items dropped after repeated failures ({})", summary.join(", ")),
            };
            self.publish_status(
                SyncStatus::Error,
                "Some changes could not be uploaded and were discarded",
                Some(detail),
                false,
            );
        }

        let mut pulled = 0_usize;
        if !skip_pull {
            pulled = self.run_pull_with_retries(user_id, &push_outcome).await?;
        }

        self.maybe_sweep().await;

        let stats = SyncCycleStats {
            trigger,
            pushed_items: push_outcome.pushed,
            pulled_records: pulled,
            duration_ms: i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX),
            at: Utc::now(),
        };
        {
            let mut window = self.stats.lock();
            if window.len() == SYNC_STATS_WINDOW {
                window.pop_front();
            }
            window.push_back(stats.clone());
        }
        self.complete_observers.notify(&stats);

        let surfaced: Vec<_> = push_outcome.failures.iter().filter(|f| f.surface).collect();
        if surfaced.is_empty() {
            *self.last_error.lock() = None;
            *self.last_successful_sync.lock() = Some(Instant::now());
            self.publish_status(SyncStatus::Idle, "Up to date", None, quiet);
        } else {
            let first = surfaced[0];
            let detail = SyncErrorDetail {
                message: "push_blocked".to_string(),
                detail: format!(
                    "{} item(s) failed; first (seq {} on {}): {}",
                    surfaced.len(),
                    first.seq,
                    first.table,
                    first.error
                ),
            };
            self.publish_status(
                SyncStatus::Error,
                "Some changes could not be uploaded",
                Some(detail),
                false,
            );
        }

        Ok(())
    }

    async fn run_pull_with_retries(
        &self,
        user_id: &str,
        push_outcome: &super::push::PushOutcome,
    ) -> Result<usize> {
        let cursor = self.effective_cursor(user_id, push_outcome.max_pushed_updated_at).await?;
        let pull_timeout = Duration::from_secs(PULL_TIMEOUT_SECS);
        let max_attempts = if push_outcome.all_succeeded() { PULL_MAX_ATTEMPTS } else { 1 };

        let mut attempt = 0_u32;
        loop {
            attempt += 1;
            let result =
                tokio::time::timeout(pull_timeout, run_pull(&self.deps, user_id, cursor)).await;

            let error = match result {
                Ok(Ok(outcome)) => {
                    if let Some(advanced) = outcome.cursor_advanced_to {
                        debug!(cursor = %advanced, "pull advanced the cursor");
                    }
                    return Ok(outcome.pulled);
                }
                Ok(Err(error)) => error,
                Err(_) => EngineError::Timeout(pull_timeout),
            };

            if attempt >= max_attempts {
                return Err(error);
            }
            warn!(attempt, error = %error, "pull attempt failed; retrying");
            tokio::time::sleep(Duration::from_secs(1 << (attempt - 1))).await;
        }
    }

    async fn effective_cursor(
        &self,
        user_id: &str,
        post_push: Option<DateTime<Utc>>,
    ) -> Result<Option<DateTime<Utc>>> {
        let stored = self.stored_cursor(user_id).await?;
        Ok(match (stored, post_push) {
            (Some(stored), Some(pushed)) => Some(stored.max(pushed)),
            (stored, pushed) => stored.or(pushed),
        })
    }

    async fn stored_cursor(&self, user_id: &str) -> Result<Option<DateTime<Utc>>> {
        let raw = self.deps.kv.get(&cursor_key(user_id)).await?;
        Ok(raw
            .as_deref()
            .and_then(|value| DateTime::parse_from_rfc3339(value).ok())
            .map(|parsed| parsed.with_timezone(&Utc)))
    }

    /// Run the tombstone sweep when a day has passed since the last one.
    async fn maybe_sweep(&self) {
        let due = {
            let last = self.last_sweep.lock();
            last.map_or(true, |at| {
                at.elapsed() >= Duration::from_secs(TOMBSTONE_SWEEP_INTERVAL_SECS)
            })
        };
        if !due {
            return;
        }
        *self.last_sweep.lock() = Some(Instant::now());

        if let Err(error) = self.sweeper.sweep_once().await {
            warn!(error = %error, "tombstone sweep failed");
        }

        let history_cutoff =
            Utc::now() - chrono::Duration::days(i64::from(CONFLICT_HISTORY_RETENTION_DAYS));
        match self.deps.history.prune_older_than(history_cutoff).await {
            Ok(pruned) if pruned > 0 => debug!(pruned, "conflict history pruned"),
            Ok(_) => {}
            Err(error) => warn!(error = %error, "conflict history prune failed"),
        }
    }

    fn publish_status(
        &self,
        status: SyncStatus,
        message: &str,
        error: Option<SyncErrorDetail>,
        quiet: bool,
    ) {
        if let Some(detail) = &error {
            *self.last_error.lock() = Some(detail.clone());
        }
        if quiet && status != SyncStatus::Error {
            return;
        }
        let report = SyncStatusReport {
            status,
            message: message.to_string(),
            last_error: error.or_else(|| self.last_error.lock().clone()),
        };
        self.status_observers.notify(&report);
    }

    async fn debounce_loop(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = self.debounce_notify.notified() => {}
            }

            // Every further nudge restarts the window.
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = tokio::time::sleep(self.deps.config.sync_debounce) => break,
                    () = self.debounce_notify.notified() => {}
                }
            }

            let skip_pull = self.deps.realtime.state() == ConnectionState::Connected;
            if let Err(error) = self.run_full_sync(SyncTrigger::Debounce, true, skip_pull).await {
                warn!(error = %error, "debounced sync failed");
            }
        }
    }

    async fn interval_loop(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(self.deps.config.sync_interval) => {
                    if let Err(error) = self.run_full_sync(SyncTrigger::Interval, true, false).await {
                        warn!(error = %error, "periodic sync failed");
                    }
                }
            }
        }
    }

    async fn watchdog_loop(self: Arc<Self>, cancel: CancellationToken) {
        let interval = Duration::from_secs(SYNC_WATCHDOG_INTERVAL_SECS);
        let stale_after = Duration::from_secs(SYNC_LOCK_STALE_SECS);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(interval) => {
                    if self.lock.force_release_if_stale(stale_after) {
                        warn!("stale sync lock force-released");
                        if *self.deps.online.borrow() {
                            if let Err(error) =
                                self.run_full_sync(SyncTrigger::Manual, true, false).await
                            {
                                warn!(error = %error, "watchdog retry failed");
                            }
                        }
                    }
                }
            }
        }
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        let token = self.cancellation.lock();
        if !token.is_cancelled() {
            warn!("SyncEngine dropped while running; cancelling tasks");
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_is_non_queueing() {
        let lock = SyncLock::new();

        assert!(lock.try_acquire());
        assert!(!lock.try_acquire(), "held lock rejects immediately");

        lock.release();
        assert!(lock.try_acquire());
    }

    #[test]
    fn stale_lock_is_force_released() {
        let lock = SyncLock::new();
        assert!(lock.try_acquire());

        assert!(!lock.force_release_if_stale(Duration::from_secs(60)));
        assert!(lock.force_release_if_stale(Duration::ZERO));
        assert!(lock.try_acquire(), "lock reusable after force release");
    }

    #[test]
    fn held_ms_reported_only_while_held() {
        let lock = SyncLock::new();
        assert!(lock.held_ms().is_none());

        assert!(lock.try_acquire());
        assert!(lock.held_ms().is_some());

        lock.release();
        assert!(lock.held_ms().is_none());
    }
}
