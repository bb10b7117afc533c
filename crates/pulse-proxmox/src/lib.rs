//! Authenticated, deadline-bounded HTTP clients for PVE and PBS.
//!
//! One logical client per `(node, endpoint)`. All operations are read-only
//! and idempotent. Transport failures are classified into the retryable
//! [`ApiError::Transient`] and the non-retryable rest; retries happen
//! inside each call with exponential backoff and full jitter, so callers
//! see at most one result per invocation.

pub mod auth;
pub mod error;
pub mod http;
pub mod pbs;
pub mod pve;

pub use auth::Credentials;
pub use error::{ApiError, ApiResult};
pub use http::ClientConfig;
pub use pbs::PbsClient;
pub use pve::PveClient;
