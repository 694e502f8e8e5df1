//! Online/offline and visibility transitions.
//!
//! Owns the reactive online flag the rest of the engine watches. Going
//! offline pauses realtime and marks the auth gate; coming back online
//! revalidates credentials under a timeout, restarts realtime and runs a
//! quiet sync unless one completed recently. A definitive validation
//! failure invokes the auth-kicked hook and wipes the outbox so no work is
//! uploaded under a different identity.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tidemark_core::observer::Observers;
use tidemark_core::store::ports::OutboxQueue;
use tidemark_core::{AuthGate, RemoteAdapter};
use tidemark_domain::constants::ONLINE_VALIDATION_TIMEOUT_SECS;
use tidemark_domain::{ConnectionState, EngineConfig, SyncTrigger};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::realtime::RealtimeManager;
use crate::sync::SyncEngine;

type AuthKickedHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Collaborators of the network monitor.
pub struct NetworkMonitorDeps {
    /// Engine configuration.
    pub config: Arc<EngineConfig>,
    /// Session gate.
    pub auth: Arc<AuthGate>,
    /// Backend adapter used for reconnect validation.
    pub remote: Arc<dyn RemoteAdapter>,
    /// Realtime manager paused and restarted on transitions.
    pub realtime: Arc<RealtimeManager>,
    /// Sync engine nudged after reconnects.
    pub engine: Arc<SyncEngine>,
    /// Outbox wiped when the user is kicked.
    pub outbox: Arc<dyn OutboxQueue>,
}

/// Connectivity and visibility monitor.
pub struct NetworkMonitor {
    deps: NetworkMonitorDeps,
    online_tx: Arc<watch::Sender<bool>>,
    reconnect_observers: Observers<()>,
    disconnect_observers: Observers<()>,
    auth_kicked: Mutex<Option<AuthKickedHook>>,
}

impl NetworkMonitor {
    /// Build a monitor over the online flag's sender half.
    ///
    /// The matching receivers are handed to the realtime manager, the sync
    /// engine and the data API before this constructor runs.
    pub fn new(deps: NetworkMonitorDeps, online_tx: Arc<watch::Sender<bool>>) -> Self {
        Self {
            deps,
            online_tx,
            reconnect_observers: Observers::new(),
            disconnect_observers: Observers::new(),
            auth_kicked: Mutex::new(None),
        }
    }

    /// Current online flag.
    pub fn is_online(&self) -> bool {
        *self.online_tx.borrow()
    }

    /// Fresh receiver for the online flag.
    pub fn online_receiver(&self) -> watch::Receiver<bool> {
        self.online_tx.subscribe()
    }

    /// Register the hook invoked when credentials are definitively rejected.
    pub fn set_auth_kicked_hook(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        *self.auth_kicked.lock() = Some(Arc::new(hook));
    }

    /// Register a reconnect callback.
    pub fn on_reconnect(
        &self,
        callback: impl Fn(&()) + Send + Sync + 'static,
    ) -> tidemark_core::observer::ObserverId {
        self.reconnect_observers.register(callback)
    }

    /// Register a disconnect callback.
    pub fn on_disconnect(
        &self,
        callback: impl Fn(&()) + Send + Sync + 'static,
    ) -> tidemark_core::observer::ObserverId {
        self.disconnect_observers.register(callback)
    }

    /// Record the offline transition.
    pub fn set_offline(&self) {
        if !self.is_online() {
            return;
        }
        info!("network offline");

        self.online_tx.send_replace(false);
        self.deps.auth.mark_offline();
        self.deps.realtime.pause();
        self.deps.engine.publish_offline();
        self.disconnect_observers.notify(&());
    }

    /// Record the online transition and revalidate credentials.
    pub async fn set_online(&self) {
        if self.is_online() {
            return;
        }
        info!("network online");
        self.online_tx.send_replace(true);

        let validation_timeout = Duration::from_secs(ONLINE_VALIDATION_TIMEOUT_SECS);
        let validated =
            tokio::time::timeout(validation_timeout, self.deps.remote.validate_user()).await;

        match validated {
            Ok(Ok(Some(user_id))) => {
                self.deps.auth.mark_validated();
                self.deps.realtime.start(&user_id);

                let cooldown = self.deps.config.online_reconnect_cooldown;
                let cooled_down = self
                    .deps
                    .engine
                    .last_successful_sync_at()
                    .map_or(true, |at| at.elapsed() >= cooldown);
                if cooled_down {
                    if let Err(error) =
                        self.deps.engine.run_full_sync(SyncTrigger::Reconnect, true, false).await
                    {
                        warn!(error = %error, "reconnect sync failed");
                    }
                } else {
                    debug!("reconnect sync skipped inside cooldown");
                }

                self.reconnect_observers.notify(&());
            }
            Ok(Ok(None)) => self.kick("signed_out").await,
            Ok(Err(error)) if !error.is_transient() => {
                warn!(error = %error, "reconnect validation rejected");
                self.kick("auth_rejected").await;
            }
            Ok(Err(error)) => {
                // Transient failure: stay online, the periodic sync retries.
                warn!(error = %error, "reconnect validation failed transiently");
            }
            Err(_) => {
                warn!(
                    timeout_secs = validation_timeout.as_secs(),
                    "reconnect validation timed out"
                );
            }
        }
    }

    /// React to tab visibility: returning after a long absence while the
    /// change stream is down schedules a quiet debounced sync.
    pub fn handle_visibility(&self, visible: bool, hidden_for: Duration) {
        if !visible {
            return;
        }
        if hidden_for < self.deps.config.visibility_sync_min_away {
            return;
        }
        if self.deps.realtime.state() == ConnectionState::Connected {
            return;
        }

        debug!(hidden_secs = hidden_for.as_secs(), "visibility returned, scheduling sync");
        self.deps.engine.schedule_debounced_sync();
    }

    /// Credentials are gone for good: notify the app and drop queued work
    /// so nothing is uploaded under a new identity.
    async fn kick(&self, reason: &str) {
        warn!(reason, "user kicked; clearing outbox");

        if let Some(hook) = self.auth_kicked.lock().clone() {
            hook(reason);
        }

        match self.deps.outbox.clear().await {
            Ok(dropped) if dropped > 0 => {
                warn!(dropped, "outbox cleared after auth kick");
            }
            Ok(_) => {}
            Err(error) => warn!(error = %error, "outbox clear failed"),
        }
        self.deps.auth.reset();
        self.deps.realtime.stop();
    }
}
