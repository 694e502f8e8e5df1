//! # Tidemark Domain
//!
//! Business domain types and models for the Tidemark sync engine.
//!
//! This crate contains:
//! - Entity payload helpers and engine-managed field names
//! - Outbox, conflict-history and change-stream types
//! - Configuration structures
//! - Domain error types and Result definitions
//! - Domain constants
//!
//! ## Architecture
//! - No dependencies on other Tidemark crates
//! - Only external dependencies allowed
//! - Pure domain models and data structures

pub mod config;
pub mod constants;
pub mod errors;
pub mod types;

// Re-export commonly used items
pub use config::*;
pub use errors::*;
pub use types::*;
