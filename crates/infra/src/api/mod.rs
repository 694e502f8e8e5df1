//! Backend REST and change-stream adapters

mod adapter;
mod channel;
mod client;

pub use adapter::RestRemoteAdapter;
pub use client::{ApiClient, ApiClientConfig, EgressCounter};
