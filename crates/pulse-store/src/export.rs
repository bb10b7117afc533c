//! Sealed config export/import: a passphrase-derived AES-256-GCM bundle
//! for moving a node list between installs.

use crate::crypto::NONCE_LEN;
use crate::error::{StoreError, StoreResult};
use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::Engine;
use chrono::{DateTime, Utc};
use pbkdf2::pbkdf2_hmac;
use pulse_common::types::NodeConfig;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

pub const BUNDLE_VERSION: u32 = 1;
const PBKDF2_ITERATIONS: u32 = 100_000;
const SALT_LEN: usize = 16;

/// The JSON envelope handed to `POST /api/config/export` consumers.
/// `data` is base64 of `salt(16B) | nonce(12B) | ciphertext || tag`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportBundle {
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub data: String,
}

fn derive_key(passphrase: &str, salt: &[u8]) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, PBKDF2_ITERATIONS, &mut key);
    key
}

pub fn export_nodes(nodes: &[NodeConfig], passphrase: &str) -> StoreResult<ExportBundle> {
    let plaintext = serde_json::to_vec(nodes).map_err(|e| StoreError::Config {
        path: "export".into(),
        reason: e.to_string(),
    })?;

    let mut salt = [0u8; SALT_LEN];
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    rand::thread_rng().fill_bytes(&mut nonce);

    let key = derive_key(passphrase, &salt);
    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|e| StoreError::Crypto(format!("bad derived key: {e}")))?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext.as_slice())
        .map_err(|_| StoreError::Crypto("bundle encryption failed".into()))?;

    let mut payload = Vec::with_capacity(SALT_LEN + NONCE_LEN + ciphertext.len());
    payload.extend_from_slice(&salt);
    payload.extend_from_slice(&nonce);
    payload.extend_from_slice(&ciphertext);

    Ok(ExportBundle {
        version: BUNDLE_VERSION,
        created_at: Utc::now(),
        data: base64::engine::general_purpose::STANDARD.encode(payload),
    })
}

/// Decrypt a bundle. Node IDs are regenerated so an import never collides
/// with an existing fleet.
pub fn import_nodes(bundle: &ExportBundle, passphrase: &str) -> StoreResult<Vec<NodeConfig>> {
    if bundle.version != BUNDLE_VERSION {
        return Err(StoreError::Config {
            path: "import".into(),
            reason: format!("unsupported bundle version {}", bundle.version),
        });
    }

    let payload = base64::engine::general_purpose::STANDARD
        .decode(&bundle.data)
        .map_err(|e| StoreError::Config {
            path: "import".into(),
            reason: format!("bad base64: {e}"),
        })?;
    if payload.len() < SALT_LEN + NONCE_LEN + 16 {
        return Err(StoreError::Crypto("bundle too short".into()));
    }

    let (salt, rest) = payload.split_at(SALT_LEN);
    let (nonce, ciphertext) = rest.split_at(NONCE_LEN);
    let key = derive_key(passphrase, salt);
    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|e| StoreError::Crypto(format!("bad derived key: {e}")))?;
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| StoreError::Crypto("wrong passphrase or corrupt bundle".into()))?;

    let mut nodes: Vec<NodeConfig> =
        serde_json::from_slice(&plaintext).map_err(|e| StoreError::Config {
            path: "import".into(),
            reason: e.to_string(),
        })?;
    for node in &mut nodes {
        node.id = pulse_common::id::short_id();
    }
    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_common::types::{Capabilities, NodeKind};

    fn sample_nodes() -> Vec<NodeConfig> {
        vec![NodeConfig {
            id: "n1".into(),
            kind: NodeKind::Pve,
            name: "pve1".into(),
            url: "https://pve1:8006".into(),
            user: Some("monitor@pam".into()),
            password: Some("pw".into()),
            token_name: None,
            token_secret: None,
            verify_tls: true,
            capabilities: Capabilities::default(),
            timeout_secs: Some(15),
            cluster_name: None,
            cluster_endpoints: Vec::new(),
        }]
    }

    #[test]
    fn export_import_restores_equivalent_nodes() {
        let bundle = export_nodes(&sample_nodes(), "hunter2").unwrap();
        let imported = import_nodes(&bundle, "hunter2").unwrap();
        assert_eq!(imported.len(), 1);
        assert_eq!(imported[0].name, "pve1");
        assert_eq!(imported[0].password.as_deref(), Some("pw"));
        assert_ne!(imported[0].id, "n1", "IDs are regenerated on import");
    }

    #[test]
    fn wrong_passphrase_is_rejected() {
        let bundle = export_nodes(&sample_nodes(), "hunter2").unwrap();
        let err = import_nodes(&bundle, "hunter3").unwrap_err();
        assert!(matches!(err, StoreError::Crypto(_)));
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let mut bundle = export_nodes(&sample_nodes(), "hunter2").unwrap();
        bundle.version = 99;
        let err = import_nodes(&bundle, "hunter2").unwrap_err();
        assert!(matches!(err, StoreError::Config { .. }));
    }
}
