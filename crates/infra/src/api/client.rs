//! HTTP client wrapper for the backend REST surface.
//!
//! Thin layer over `reqwest` adding bearer authentication, response-size
//! accounting and status classification. The client applies no timeout of
//! its own; callers wrap requests in `tokio::time::timeout`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use reqwest::{Method, RequestBuilder, StatusCode};
use tidemark_core::{RemoteError, RemoteResult};
use tracing::debug;

/// Approximate count of bytes received from the backend.
#[derive(Debug, Default)]
pub struct EgressCounter {
    bytes: AtomicU64,
}

impl EgressCounter {
    /// Fresh counter at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record received bytes.
    pub fn add(&self, bytes: u64) {
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Total bytes recorded so far.
    pub fn total(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

/// Configuration for the backend client.
#[derive(Debug, Clone)]
pub struct ApiClientConfig {
    /// Base URL of the REST surface, without a trailing slash.
    pub base_url: String,
    /// Initial bearer token, when already authenticated.
    pub bearer_token: Option<String>,
}

impl Default for ApiClientConfig {
    fn default() -> Self {
        Self { base_url: "http://localhost:3000".to_string(), bearer_token: None }
    }
}

/// Backend HTTP client.
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
    token: RwLock<Option<String>>,
    egress: Arc<EgressCounter>,
}

impl ApiClient {
    /// Build a client from configuration.
    pub fn new(config: ApiClientConfig) -> RemoteResult<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| RemoteError::Config(format!("http client build failed: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: RwLock::new(config.bearer_token),
            egress: Arc::new(EgressCounter::new()),
        })
    }

    /// Replace the bearer token after login or refresh.
    pub fn set_bearer_token(&self, token: Option<String>) {
        *self.token.write() = token;
    }

    /// Shared egress counter for diagnostics.
    pub fn egress(&self) -> Arc<EgressCounter> {
        Arc::clone(&self.egress)
    }

    /// Base URL without a trailing slash.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Start a request against a path under the base URL.
    pub fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{path}", self.base_url);
        let mut builder = self.client.request(method, url);
        if let Some(token) = self.token.read().as_deref() {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    /// Send a request and return the success body, classifying failures.
    pub async fn send(&self, builder: RequestBuilder) -> RemoteResult<(StatusCode, String)> {
        let response = builder.send().await.map_err(classify_reqwest_error)?;

        let status = response.status();
        let body = response.text().await.map_err(classify_reqwest_error)?;
        self.egress.add(body.len() as u64);

        if status.is_success() {
            debug!(status = %status, bytes = body.len(), "backend response");
            Ok((status, body))
        } else {
            Err(RemoteError::from_status(status.as_u16(), &body))
        }
    }
}

fn classify_reqwest_error(err: reqwest::Error) -> RemoteError {
    if err.is_connect() || err.is_request() {
        RemoteError::Network(err.to_string())
    } else if err.is_timeout() {
        RemoteError::Timeout(std::time::Duration::from_secs(0))
    } else {
        RemoteError::Network(err.to_string())
    }
}
