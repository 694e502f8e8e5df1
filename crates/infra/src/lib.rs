//! # Tidemark Infra
//!
//! Adapters and background services for the Tidemark sync engine.
//!
//! This crate contains:
//! - SQLite-backed implementations of the store ports
//! - The REST backend adapter and the websocket change-stream client
//! - The sync engine, realtime manager, network monitor and tombstone
//!   sweeper
//!
//! Background services follow one lifecycle idiom: `start()` spawns a task
//! tracked by a join handle, `stop()` cancels through a token and joins with
//! a timeout, and dropping a running service cancels it.

pub mod api;
pub mod database;
pub mod net;
pub mod realtime;
pub mod sync;

pub use api::{ApiClient, ApiClientConfig, EgressCounter, RestRemoteAdapter};
pub use database::{
    DbManager, SqliteHistoryRepository, SqliteKvRepository, SqliteLocalStore,
    SqliteOutboxRepository,
};
pub use net::NetworkMonitor;
pub use realtime::RealtimeManager;
pub use sync::{SyncEngine, SyncHandle, TombstoneSweeper};
