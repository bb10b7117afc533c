//! AES-256-GCM sealing with the fixed blob layout
//! `version(1B) | nonce(12B) | ciphertext || tag(16B)`.

use crate::error::{StoreError, StoreResult};
use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use rand::RngCore;
use std::fs;
use std::io::Write;
use std::path::Path;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const BLOB_VERSION: u8 = 1;

/// Encrypt `plaintext` under `key` with a fresh random nonce.
pub fn seal(key: &[u8; KEY_LEN], plaintext: &[u8]) -> StoreResult<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| StoreError::Crypto(format!("bad key length: {e}")))?;
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| StoreError::Crypto("encryption failed".into()))?;

    let mut blob = Vec::with_capacity(1 + NONCE_LEN + ciphertext.len());
    blob.push(BLOB_VERSION);
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

/// Decrypt a blob produced by [`seal`]. Any mismatch in version, length,
/// or authentication tag is a [`StoreError::Crypto`].
pub fn open(key: &[u8; KEY_LEN], blob: &[u8]) -> StoreResult<Vec<u8>> {
    if blob.len() < 1 + NONCE_LEN + 16 {
        return Err(StoreError::Crypto("blob too short".into()));
    }
    if blob[0] != BLOB_VERSION {
        return Err(StoreError::Crypto(format!(
            "unsupported blob version {}",
            blob[0]
        )));
    }
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| StoreError::Crypto(format!("bad key length: {e}")))?;
    let nonce = Nonce::from_slice(&blob[1..1 + NONCE_LEN]);
    cipher
        .decrypt(nonce, &blob[1 + NONCE_LEN..])
        .map_err(|_| StoreError::Crypto("decryption failed (wrong key or corrupt data)".into()))
}

/// Read the machine-local key, generating one with 0600 permissions on
/// first start.
pub fn load_or_create_key(path: &Path) -> StoreResult<[u8; KEY_LEN]> {
    if path.exists() {
        let bytes = fs::read(path).map_err(|e| StoreError::io(path, e))?;
        let key: [u8; KEY_LEN] = bytes.as_slice().try_into().map_err(|_| {
            StoreError::Crypto(format!(
                "{} holds {} bytes, expected {KEY_LEN}",
                path.display(),
                bytes.len()
            ))
        })?;
        return Ok(key);
    }

    let mut key = [0u8; KEY_LEN];
    rand::thread_rng().fill_bytes(&mut key);

    let mut file = fs::File::create(path).map_err(|e| StoreError::io(path, e))?;
    file.write_all(&key).map_err(|e| StoreError::io(path, e))?;
    file.sync_all().map_err(|e| StoreError::io(path, e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .map_err(|e| StoreError::io(path, e))?;
    }
    tracing::info!(path = %path.display(), "generated new encryption key");
    Ok(key)
}

/// Write `contents` to `path` atomically: tmp file in the same directory,
/// fsync, rename over the target.
pub fn write_atomic(path: &Path, contents: &[u8]) -> StoreResult<()> {
    let tmp = path.with_extension(match path.extension() {
        Some(ext) => format!("{}.tmp", ext.to_string_lossy()),
        None => "tmp".to_string(),
    });
    let mut file = fs::File::create(&tmp).map_err(|e| StoreError::io(&tmp, e))?;
    file.write_all(contents).map_err(|e| StoreError::io(&tmp, e))?;
    file.sync_all().map_err(|e| StoreError::io(&tmp, e))?;
    drop(file);
    fs::rename(&tmp, path).map_err(|e| StoreError::io(path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip_is_byte_identical() {
        let key = [7u8; KEY_LEN];
        let plaintext = br#"[{"id":"n1","kind":"pve"}]"#;
        let blob = seal(&key, plaintext).unwrap();
        assert_eq!(blob[0], BLOB_VERSION);
        let opened = open(&key, &blob).unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn wrong_key_is_rejected() {
        let blob = seal(&[7u8; KEY_LEN], b"secret").unwrap();
        let err = open(&[8u8; KEY_LEN], &blob).unwrap_err();
        assert!(matches!(err, StoreError::Crypto(_)));
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let key = [7u8; KEY_LEN];
        let mut blob = seal(&key, b"secret").unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0xff;
        assert!(open(&key, &blob).is_err());
    }

    #[test]
    fn unknown_version_is_rejected() {
        let key = [7u8; KEY_LEN];
        let mut blob = seal(&key, b"secret").unwrap();
        blob[0] = 9;
        assert!(open(&key, &blob).is_err());
    }

    #[test]
    fn key_is_created_once_with_restrictive_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".encryption.key");
        let first = load_or_create_key(&path).unwrap();
        let second = load_or_create_key(&path).unwrap();
        assert_eq!(first, second);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn atomic_write_replaces_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.enc");
        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"second");
        assert!(!path.with_extension("enc.tmp").exists());
    }
}
