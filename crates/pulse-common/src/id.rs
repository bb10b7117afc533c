use sha2::{Digest, Sha256};

/// Generate a short random identifier (12 hex chars) for node configs
/// and subscriber handles.
pub fn short_id() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 6];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Stable alert identity: the same (resource, metric, level) triple always
/// hashes to the same ID, so acknowledgements survive re-evaluation and
/// process restarts.
pub fn alert_id(resource: &str, metric: &str, level: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(resource.as_bytes());
    hasher.update(b"|");
    hasher.update(metric.as_bytes());
    hasher.update(b"|");
    hasher.update(level.as_bytes());
    let digest = hasher.finalize();
    digest[..6].iter().map(|b| format!("{b:02x}")).collect()
}
