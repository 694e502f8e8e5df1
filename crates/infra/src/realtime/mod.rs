//! Realtime change-stream consumption

mod manager;

pub use manager::{RealtimeDeps, RealtimeManager, RemoteChange};
