//! Error types used throughout the engine

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for Tidemark
#[derive(Error, Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "message")]
pub enum EngineError {
    /// Local database failure.
    #[error("Database error: {0}")]
    Database(String),

    /// The local store is closed, upgrading or missing required tables.
    #[error("Local store unavailable: {0}")]
    StoreUnavailable(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network failure reaching the backend.
    #[error("Network error: {0}")]
    Network(String),

    /// Authentication or session failure.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// A referenced entity or record does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Caller supplied invalid data.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// An operation exceeded its deadline.
    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Unexpected internal failure.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for Tidemark operations
pub type Result<T> = std::result::Result<T, EngineError>;
