//! Port interface for the backend adapter
//!
//! The adapter is a thin contract over the concrete backend. Calls never
//! time out on their own; callers wrap them in `tokio::time::timeout`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tidemark_domain::{ChannelMessage, Entity, Filter, Session};
use tokio::sync::mpsc;

use super::errors::RemoteResult;

/// Live change-stream subscription.
///
/// Dropping the subscription closes the channel; the producing task observes
/// the closed receiver and tears the transport down.
pub struct ChannelSubscription {
    events: mpsc::Receiver<ChannelMessage>,
}

impl ChannelSubscription {
    /// Wrap a receiver produced by an adapter's subscription task.
    pub fn new(events: mpsc::Receiver<ChannelMessage>) -> Self {
        Self { events }
    }

    /// Next message, or `None` once the producer has gone away.
    pub async fn recv(&mut self) -> Option<ChannelMessage> {
        self.events.recv().await
    }
}

impl std::fmt::Debug for ChannelSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSubscription").finish_non_exhaustive()
    }
}

/// Thin contract over the backend used by push, pull and realtime.
#[async_trait]
pub trait RemoteAdapter: Send + Sync {
    /// Select rows, optionally restricted to `updated_at > updated_after`,
    /// ordered by `(updated_at, id)` ascending.
    async fn select(
        &self,
        table: &str,
        columns: &str,
        updated_after: Option<DateTime<Utc>>,
        filters: &[Filter],
    ) -> RemoteResult<Vec<Entity>>;

    /// Insert a row. `Ok(None)` means row-level authorization silently
    /// refused the write; callers treat this distinct from an error.
    async fn insert_returning_id(&self, table: &str, row: &Entity) -> RemoteResult<Option<String>>;

    /// Patch a row by id. `Ok(None)` means no row was updated.
    async fn update_returning_id(
        &self,
        table: &str,
        id: &str,
        patch: &Entity,
    ) -> RemoteResult<Option<String>>;

    /// Delete rows matching the filters; returns the deleted ids. Used only
    /// by the tombstone sweeper.
    async fn delete_where(&self, table: &str, filters: &[Filter]) -> RemoteResult<Vec<String>>;

    /// Currently cached session, if any.
    async fn session(&self) -> RemoteResult<Option<Session>>;

    /// Refresh the session with the backend.
    async fn refresh_session(&self) -> RemoteResult<Option<Session>>;

    /// Network-validated user id, or `None` when the user is signed out.
    async fn validate_user(&self) -> RemoteResult<Option<String>>;

    /// Open one multiplexed change-stream subscription covering the given
    /// tables, with at-least-once delivery.
    async fn subscribe(&self, channel: &str, tables: &[String])
        -> RemoteResult<ChannelSubscription>;
}
