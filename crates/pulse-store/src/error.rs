#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O failure on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Decryption or key failure. Fatal at startup: the store refuses to
    /// silently replace an unreadable config.
    #[error("crypto failure: {0}")]
    Crypto(String),

    #[error("invalid config in {path}: {reason}")]
    Config { path: String, reason: String },
}

impl StoreError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
