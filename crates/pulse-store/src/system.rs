//! Plain-JSON settings files under the data directory.

use crate::crypto::write_atomic;
use crate::error::{StoreError, StoreResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const SYSTEM_FILE: &str = "system.json";
pub const THRESHOLDS_FILE: &str = "thresholds.json";
pub const OVERRIDES_FILE: &str = "overrides.json";
pub const WEBHOOKS_FILE: &str = "webhooks.json";

/// Process-wide runtime settings (`system.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SystemSettings {
    pub poll_interval_secs: u64,
    pub upstream_timeout_secs: u64,
    pub listen_port: u16,
    pub discovery_enabled: bool,
    pub discovery_subnet: Option<String>,
    pub discovery_interval_secs: u64,
    pub update_channel: String,
    pub auto_update: bool,
}

impl Default for SystemSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10,
            upstream_timeout_secs: 10,
            listen_port: 7655,
            discovery_enabled: true,
            discovery_subnet: None,
            discovery_interval_secs: 300,
            update_channel: "stable".into(),
            auto_update: false,
        }
    }
}

/// Webhook notifier targets (`webhooks.json`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WebhookSettings {
    pub urls: Vec<String>,
}

/// Load a JSON settings file, falling back to `Default` when the file is
/// absent. A present-but-malformed file is an error, not a silent reset.
pub fn load_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> StoreResult<T> {
    if !path.exists() {
        return Ok(T::default());
    }
    let bytes = std::fs::read(path).map_err(|e| StoreError::io(path, e))?;
    serde_json::from_slice(&bytes).map_err(|e| StoreError::Config {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

/// Serialize and atomically replace a JSON settings file.
pub fn save_json<T: Serialize>(path: &Path, value: &T) -> StoreResult<()> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|e| StoreError::Config {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    write_atomic(path, &bytes)
}
