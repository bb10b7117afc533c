//! Encrypted persistence of the configured node list.

use crate::crypto::{self, KEY_LEN};
use crate::error::{StoreError, StoreResult};
use pulse_common::types::{Capabilities, NodeConfig, NodeKind};
use serde::Serialize;
use std::path::{Path, PathBuf};

const NODES_FILE: &str = "nodes.enc";
const KEY_FILE: &str = ".encryption.key";

/// Loads and saves `nodes.enc` under the data directory.
pub struct NodeStore {
    path: PathBuf,
    key: [u8; KEY_LEN],
}

impl NodeStore {
    /// Open the store, creating the encryption key on first start. A key
    /// that exists but cannot be read or has the wrong length is fatal.
    pub fn open(data_dir: &Path) -> StoreResult<Self> {
        let key = crypto::load_or_create_key(&data_dir.join(KEY_FILE))?;
        Ok(Self {
            path: data_dir.join(NODES_FILE),
            key,
        })
    }

    /// Load the node list. A missing file is an empty fleet; an unreadable
    /// or undecryptable file is an error; the caller must not treat it as
    /// empty and overwrite the operator's config.
    pub fn load(&self) -> StoreResult<Vec<NodeConfig>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let blob = std::fs::read(&self.path).map_err(|e| StoreError::io(&self.path, e))?;
        let plaintext = crypto::open(&self.key, &blob)?;
        serde_json::from_slice(&plaintext).map_err(|e| StoreError::Config {
            path: self.path.display().to_string(),
            reason: e.to_string(),
        })
    }

    /// Encrypt and atomically replace the node list.
    pub fn save(&self, nodes: &[NodeConfig]) -> StoreResult<()> {
        let plaintext = serde_json::to_vec(nodes).map_err(|e| StoreError::Config {
            path: self.path.display().to_string(),
            reason: e.to_string(),
        })?;
        let blob = crypto::seal(&self.key, &plaintext)?;
        crypto::write_atomic(&self.path, &blob)
    }
}

/// Redacted view of a node for the REST layer: shows that credentials are
/// configured without revealing them.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeView {
    pub id: String,
    pub kind: NodeKind,
    pub name: String,
    pub url: String,
    pub has_password: bool,
    pub has_token: bool,
    pub verify_tls: bool,
    pub capabilities: Capabilities,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,
}

impl From<&NodeConfig> for NodeView {
    fn from(node: &NodeConfig) -> Self {
        Self {
            id: node.id.clone(),
            kind: node.kind,
            name: node.name.clone(),
            url: node.url.clone(),
            has_password: node.has_password(),
            has_token: node.has_token(),
            verify_tls: node.verify_tls,
            capabilities: node.capabilities.clone(),
            cluster_name: node.cluster_name.clone(),
        }
    }
}
