//! Session validation gate
//!
//! Caches the authenticated user identity and decides when the backend must
//! be consulted again: after an hour, after session expiry, and after the
//! device was offline. Without a confirmed identity the engine does not
//! push, because row-level authorization would silently drop the writes.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tidemark_domain::constants::AUTH_REVALIDATION_INTERVAL_SECS;
use tidemark_domain::Session;
use tracing::{debug, warn};

use crate::observer::Observers;
use crate::remote::ports::RemoteAdapter;

/// Auth lifecycle notification delivered to registered observers.
#[derive(Debug, Clone)]
pub struct AuthStateEvent {
    /// What happened: `signed_in`, `validated`, `signed_out`.
    pub event: String,
    /// Session in effect after the change, when one exists.
    pub session: Option<Session>,
}

#[derive(Debug, Clone)]
struct CachedIdentity {
    user_id: String,
    session: Session,
    validated_at: DateTime<Utc>,
}

#[derive(Default)]
struct AuthState {
    was_offline: bool,
    validated: bool,
    cached: Option<CachedIdentity>,
}

/// Gate between the sync engine and the backend session.
pub struct AuthGate {
    remote: Arc<dyn RemoteAdapter>,
    state: Mutex<AuthState>,
    observers: Observers<AuthStateEvent>,
}

impl AuthGate {
    /// Gate over the given adapter with an empty cache.
    pub fn new(remote: Arc<dyn RemoteAdapter>) -> Self {
        Self { remote, state: Mutex::new(AuthState::default()), observers: Observers::new() }
    }

    /// Observers notified on auth lifecycle changes.
    pub fn observers(&self) -> &Observers<AuthStateEvent> {
        &self.observers
    }

    /// True while the device has been offline and credentials have not been
    /// revalidated since coming back.
    pub fn needs_validation(&self) -> bool {
        let state = self.state.lock();
        state.was_offline && !state.validated
    }

    /// Record the offline transition.
    pub fn mark_offline(&self) {
        let mut state = self.state.lock();
        state.was_offline = true;
        state.validated = false;
    }

    /// Record a successful credential validation after reconnecting.
    pub fn mark_validated(&self) {
        let session = {
            let mut state = self.state.lock();
            state.was_offline = false;
            state.validated = true;
            state.cached.as_ref().map(|cached| cached.session.clone())
        };
        self.observers.notify(&AuthStateEvent { event: "validated".to_string(), session });
    }

    /// Clear every cached fact; used on logout and wipe.
    pub fn reset(&self) {
        *self.state.lock() = AuthState::default();
        self.observers
            .notify(&AuthStateEvent { event: "signed_out".to_string(), session: None });
    }

    /// Authenticated user id, served from cache while fresh.
    ///
    /// The cache is good for one hour while the session is unexpired.
    /// Otherwise the session is refreshed when expired and the user is
    /// network-validated; any failure invalidates the cache and yields
    /// `None`.
    pub async fn user_id(&self) -> Option<String> {
        let now = Utc::now();

        let cached = self.state.lock().cached.clone();
        if let Some(cached) = &cached {
            let age = now.signed_duration_since(cached.validated_at).num_seconds();
            if !cached.session.is_expired(now) && age < AUTH_REVALIDATION_INTERVAL_SECS {
                return Some(cached.user_id.clone());
            }
        }

        let had_identity = cached.is_some();
        match self.revalidate(cached, now).await {
            Some(identity) => {
                let user_id = identity.user_id.clone();
                let session = identity.session.clone();
                self.state.lock().cached = Some(identity);
                if !had_identity {
                    self.observers.notify(&AuthStateEvent {
                        event: "signed_in".to_string(),
                        session: Some(session),
                    });
                }
                Some(user_id)
            }
            None => {
                self.state.lock().cached = None;
                None
            }
        }
    }

    async fn revalidate(
        &self,
        cached: Option<CachedIdentity>,
        now: DateTime<Utc>,
    ) -> Option<CachedIdentity> {
        let mut session = match self.remote.session().await {
            Ok(session) => session,
            Err(err) => {
                warn!(error = %err, "session lookup failed");
                None
            }
        };

        let expired = session.as_ref().map_or(true, |s| s.is_expired(now))
            || cached.as_ref().is_some_and(|c| c.session.is_expired(now));
        if expired {
            match self.remote.refresh_session().await {
                Ok(refreshed) => {
                    if refreshed.is_some() {
                        debug!("session refreshed");
                        session = refreshed;
                    }
                }
                Err(err) => {
                    warn!(error = %err, "session refresh failed");
                }
            }
        }

        match self.remote.validate_user().await {
            Ok(Some(user_id)) => {
                let session = session
                    .unwrap_or(Session { user_id: user_id.clone(), expires_at: None });
                Some(CachedIdentity { user_id, session, validated_at: now })
            }
            Ok(None) => {
                debug!("no authenticated user");
                None
            }
            Err(err) => {
                warn!(error = %err, "user validation failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::Duration;
    use tidemark_domain::{Entity, Filter};

    use super::*;
    use crate::remote::errors::RemoteResult;
    use crate::remote::ports::ChannelSubscription;

    struct MockRemote {
        session: Mutex<Option<Session>>,
        user: Mutex<Option<String>>,
        validate_calls: AtomicUsize,
        refresh_calls: AtomicUsize,
    }

    impl MockRemote {
        fn new(session: Option<Session>, user: Option<&str>) -> Self {
            Self {
                session: Mutex::new(session),
                user: Mutex::new(user.map(str::to_string)),
                validate_calls: AtomicUsize::new(0),
                refresh_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl RemoteAdapter for MockRemote {
        async fn select(
            &self,
            _table: &str,
            _columns: &str,
            _updated_after: Option<DateTime<Utc>>,
            _filters: &[Filter],
        ) -> RemoteResult<Vec<Entity>> {
            Ok(Vec::new())
        }

        async fn insert_returning_id(
            &self,
            _table: &str,
            _row: &Entity,
        ) -> RemoteResult<Option<String>> {
            Ok(None)
        }

        async fn update_returning_id(
            &self,
            _table: &str,
            _id: &str,
            _patch: &Entity,
        ) -> RemoteResult<Option<String>> {
            Ok(None)
        }

        async fn delete_where(
            &self,
            _table: &str,
            _filters: &[Filter],
        ) -> RemoteResult<Vec<String>> {
            Ok(Vec::new())
        }

        async fn session(&self) -> RemoteResult<Option<Session>> {
            Ok(self.session.lock().clone())
        }

        async fn refresh_session(&self) -> RemoteResult<Option<Session>> {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.session.lock().clone())
        }

        async fn validate_user(&self) -> RemoteResult<Option<String>> {
            self.validate_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.user.lock().clone())
        }

        async fn subscribe(
            &self,
            _channel: &str,
            _tables: &[String],
        ) -> RemoteResult<ChannelSubscription> {
            let (_tx, rx) = tokio::sync::mpsc::channel(1);
            Ok(ChannelSubscription::new(rx))
        }
    }

    fn live_session(user: &str) -> Session {
        Session { user_id: user.to_string(), expires_at: Some(Utc::now() + Duration::hours(2)) }
    }

    #[tokio::test]
    async fn caches_user_id_across_calls() {
        let remote = Arc::new(MockRemote::new(Some(live_session("u-1")), Some("u-1")));
        let gate = AuthGate::new(Arc::clone(&remote) as Arc<dyn RemoteAdapter>);

        assert_eq!(gate.user_id().await.as_deref(), Some("u-1"));
        assert_eq!(gate.user_id().await.as_deref(), Some("u-1"));

        assert_eq!(remote.validate_calls.load(Ordering::SeqCst), 1, "second call hits cache");
    }

    #[tokio::test]
    async fn expired_session_triggers_refresh() {
        let expired = Session {
            user_id: "u-1".to_string(),
            expires_at: Some(Utc::now() - Duration::minutes(5)),
        };
        let remote = Arc::new(MockRemote::new(Some(expired), Some("u-1")));
        let gate = AuthGate::new(Arc::clone(&remote) as Arc<dyn RemoteAdapter>);

        assert_eq!(gate.user_id().await.as_deref(), Some("u-1"));
        assert_eq!(remote.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_user_invalidates_cache() {
        let remote = Arc::new(MockRemote::new(Some(live_session("u-1")), None));
        let gate = AuthGate::new(Arc::clone(&remote) as Arc<dyn RemoteAdapter>);

        assert!(gate.user_id().await.is_none());
    }

    #[tokio::test]
    async fn offline_flag_requires_validation() {
        let remote = Arc::new(MockRemote::new(Some(live_session("u-1")), Some("u-1")));
        let gate = AuthGate::new(remote as Arc<dyn RemoteAdapter>);

        assert!(!gate.needs_validation());

        gate.mark_offline();
        assert!(gate.needs_validation());

        gate.mark_validated();
        assert!(!gate.needs_validation());
    }

    #[tokio::test]
    async fn observers_receive_lifecycle_events() {
        let remote = Arc::new(MockRemote::new(Some(live_session("u-1")), Some("u-1")));
        let gate = AuthGate::new(remote as Arc<dyn RemoteAdapter>);

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        gate.observers().register(move |change: &AuthStateEvent| {
            sink.lock().push(change.event.clone());
        });

        gate.user_id().await;
        gate.mark_validated();
        gate.reset();

        assert_eq!(*events.lock(), vec!["signed_in", "validated", "signed_out"]);
    }

    #[tokio::test]
    async fn reset_clears_cached_identity() {
        let remote = Arc::new(MockRemote::new(Some(live_session("u-1")), Some("u-1")));
        let gate = AuthGate::new(Arc::clone(&remote) as Arc<dyn RemoteAdapter>);

        assert!(gate.user_id().await.is_some());
        gate.reset();

        *remote.user.lock() = None;
        assert!(gate.user_id().await.is_none(), "reset discards the cached id");
    }
}
