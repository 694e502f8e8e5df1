//! # Tidemark Core
//!
//! Pure engine logic layer - no infrastructure dependencies.
//!
//! This crate contains:
//! - Port/adapter interfaces (traits) for the local store and the backend
//! - The outbox coalescer and the field-level conflict resolver
//! - The data API, auth gate, TTL guards and device identity
//!
//! ## Architecture Principles
//! - Only depends on `tidemark-domain`
//! - No database, HTTP, or platform code
//! - All external dependencies via traits
//! - Pure, testable engine logic

pub mod auth;
pub mod coalesce;
pub mod conflict;
pub mod data;
pub mod device;
pub mod guard;
pub mod observer;
pub mod remote;
pub mod store;

// Re-export specific items to avoid ambiguity
pub use auth::{AuthGate, AuthStateEvent};
pub use coalesce::{coalesce, CoalesceOutcome, CoalescePatch};
pub use conflict::resolve_conflict;
pub use data::{BatchOp, DataApi};
pub use device::DeviceIdentity;
pub use guard::RecentGuard;
pub use observer::{DeletePendingObserver, Observers, SyncNudge};
pub use remote::errors::{RemoteError, RemoteErrorCategory, RemoteResult};
pub use remote::ports::{ChannelSubscription, RemoteAdapter};
pub use store::ports::{
    ConflictHistoryStore, EntityPut, KeyValueStore, LocalStore, OutboxQueue, WriteBatch,
};
