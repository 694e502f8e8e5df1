//! Stable device identity
//!
//! Every engine instance carries a per-installation UUID used for echo
//! suppression on the change stream and for conflict tie-breaking. The id is
//! persisted in the key-value namespace and survives restarts.

use tidemark_domain::constants::DEVICE_ID_KEY;
use tidemark_domain::Result;
use tracing::debug;
use uuid::Uuid;

use crate::store::ports::KeyValueStore;

/// Stable per-installation identifier.
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    id: String,
}

impl DeviceIdentity {
    /// Load the persisted id, creating and persisting one on first use.
    pub async fn load_or_create(kv: &dyn KeyValueStore) -> Result<Self> {
        if let Some(existing) = kv.get(DEVICE_ID_KEY).await? {
            return Ok(Self { id: existing });
        }

        let id = Uuid::new_v4().to_string();
        kv.set(DEVICE_ID_KEY, &id).await?;
        debug!(device_id = %id, "created device identity");
        Ok(Self { id })
    }

    /// Fixed identity; used by tests.
    pub fn fixed(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    /// The identifier string.
    pub fn as_str(&self) -> &str {
        &self.id
    }
}

impl std::fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.id)
    }
}
