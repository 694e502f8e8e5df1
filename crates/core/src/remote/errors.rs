//! Remote-call error types
//!
//! Provides error classification for backend operations with retry metadata.
//! Transient errors recover through outbox backoff; persistent errors are
//! surfaced immediately.

use thiserror::Error;

/// Categories of remote errors for retry logic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorCategory {
    /// Authentication errors (401, 403); surfaced, session refresh attempted
    Authentication,
    /// Rate limiting errors (429); retry with backoff
    RateLimit,
    /// Server errors (5xx); retryable
    Server,
    /// Client errors (4xx except auth); non-retryable
    Client,
    /// Network/connection/timeout errors; retryable
    Network,
    /// Row-level authorization silently refused the write; non-retryable
    Policy,
    /// Unique-constraint violation; handled by the push intent mapping
    Duplicate,
    /// Configuration errors; non-retryable
    Config,
}

/// Remote operation errors
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    /// Session invalid, expired or revoked.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Backend asked the caller to slow down.
    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    /// Backend-side failure.
    #[error("Server error: {0}")]
    Server(String),

    /// Request rejected by the backend.
    #[error("Client error: {0}")]
    Client(String),

    /// Connection-level failure.
    #[error("Network error: {0}")]
    Network(String),

    /// The caller-side timeout fired.
    #[error("Timeout after {0:?}")]
    Timeout(std::time::Duration),

    /// Row-level authorization dropped the write without an error status.
    #[error("Push blocked by row-level authorization: {0}")]
    PolicyDenied(String),

    /// A unique constraint rejected an insert.
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// Adapter misconfiguration.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl RemoteError {
    /// Get the error category for this error
    pub fn category(&self) -> RemoteErrorCategory {
        match self {
            Self::Auth(_) => RemoteErrorCategory::Authentication,
            Self::RateLimit(_) => RemoteErrorCategory::RateLimit,
            Self::Server(_) => RemoteErrorCategory::Server,
            Self::Client(_) => RemoteErrorCategory::Client,
            Self::Network(_) | Self::Timeout(_) => RemoteErrorCategory::Network,
            Self::PolicyDenied(_) => RemoteErrorCategory::Policy,
            Self::DuplicateKey(_) => RemoteErrorCategory::Duplicate,
            Self::Config(_) => RemoteErrorCategory::Config,
        }
    }

    /// Whether retrying with outbox backoff can recover this error.
    ///
    /// Client errors whose message reads as a temporary condition are treated
    /// as transient as well, matching how backends word overload responses.
    pub fn is_transient(&self) -> bool {
        match self.category() {
            RemoteErrorCategory::RateLimit
            | RemoteErrorCategory::Server
            | RemoteErrorCategory::Network => true,
            RemoteErrorCategory::Client => {
                let message = self.to_string().to_ascii_lowercase();
                message.contains("unavailable")
                    || message.contains("temporarily")
                    || message.contains("offline")
            }
            RemoteErrorCategory::Authentication
            | RemoteErrorCategory::Policy
            | RemoteErrorCategory::Duplicate
            | RemoteErrorCategory::Config => false,
        }
    }

    /// Classify an HTTP status code with its body text.
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            401 | 403 => Self::Auth(format!("status {status}: {body}")),
            409 => Self::DuplicateKey(body.to_string()),
            429 => Self::RateLimit(body.to_string()),
            500..=599 => Self::Server(format!("status {status}: {body}")),
            _ => Self::Client(format!("status {status}: {body}")),
        }
    }
}

/// Result alias for remote operations
pub type RemoteResult<T> = std::result::Result<T, RemoteError>;
