//! Connectivity monitoring

mod monitor;

pub use monitor::{NetworkMonitor, NetworkMonitorDeps};
