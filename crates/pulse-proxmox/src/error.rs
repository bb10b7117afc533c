use std::time::Duration;

/// Upstream error taxonomy.
///
/// Only `Transient` is retried; everything else is reported to the caller
/// on the first occurrence.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Timeout, 5xx, DNS failure, connection reset.
    #[error("transient upstream failure: {reason}")]
    Transient { reason: String },

    /// 401/403. The message never carries credentials.
    #[error("authentication rejected (HTTP {status})")]
    Auth { status: u16 },

    /// 404.
    #[error("not found: {path}")]
    NotFound { path: String },

    /// Malformed response body.
    #[error("malformed response for {path}: {reason}")]
    Parse { path: String, reason: String },

    /// Any other 4xx.
    #[error("request rejected (HTTP {status}): {body}")]
    Permanent { status: u16, body: String },
}

impl ApiError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ApiError::Transient { .. })
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, ApiError::Auth { .. })
    }

    pub(crate) fn from_reqwest(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            ApiError::Transient {
                reason: format!("timeout after {timeout:?}"),
            }
        } else {
            // connect errors, DNS failures, resets
            ApiError::Transient {
                reason: err.to_string(),
            }
        }
    }

    pub(crate) fn from_status(status: u16, path: &str, body: String) -> Self {
        match status {
            401 | 403 => ApiError::Auth { status },
            404 => ApiError::NotFound {
                path: path.to_string(),
            },
            500..=599 => ApiError::Transient {
                reason: format!("HTTP {status} on {path}"),
            },
            _ => ApiError::Permanent { status, body },
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
