//! Shared transport: request execution, auth header injection, retries,
//! rate limiting, and the per-endpoint concurrency cap.

use crate::auth::{parse_ticket, token_header, Credentials, Ticket};
use crate::error::{ApiError, ApiResult};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use pulse_common::types::{NodeConfig, NodeKind};
use rand::Rng;
use serde::de::DeserializeOwned;
use std::num::NonZeroU32;
use std::time::Duration;
use tokio::sync::{RwLock, Semaphore};

/// Default per-call deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
/// Concurrent in-flight calls per endpoint.
pub const DEFAULT_MAX_CONCURRENT: usize = 8;

const RETRY_BASE_MS: u64 = 500;
const RETRY_CAP_MS: u64 = 10_000;
const MAX_ATTEMPTS: u32 = 3;

/// General API budget per the documented upstream limits.
const GENERAL_PER_MINUTE: u32 = 500;
/// Ticket issuance is limited much harder upstream.
const AUTH_PER_MINUTE: u32 = 10;

/// Everything needed to talk to one `(node, endpoint)` pair.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub kind: NodeKind,
    pub credentials: Option<Credentials>,
    pub verify_tls: bool,
    pub timeout: Duration,
    pub max_concurrent: usize,
}

impl ClientConfig {
    pub fn from_node(node: &NodeConfig) -> Self {
        Self {
            base_url: node.url.clone(),
            kind: node.kind,
            credentials: Credentials::from_node(node),
            verify_tls: node.verify_tls,
            timeout: node
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_TIMEOUT),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
        }
    }

    /// Same node, different endpoint. Used when failing over to another
    /// cluster member.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

/// Low-level transport shared by [`crate::PveClient`] and [`crate::PbsClient`].
pub(crate) struct Transport {
    http: reqwest::Client,
    config: ClientConfig,
    ticket: RwLock<Option<Ticket>>,
    permits: Semaphore,
    general_limit: DefaultDirectRateLimiter,
    auth_limit: DefaultDirectRateLimiter,
}

impl Transport {
    pub fn new(config: ClientConfig) -> ApiResult<Self> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(!config.verify_tls)
            .timeout(config.timeout)
            .build()
            .map_err(|e| ApiError::Transient {
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        let general_quota = Quota::per_minute(NonZeroU32::new(GENERAL_PER_MINUTE).unwrap())
            .allow_burst(NonZeroU32::new(32).unwrap());
        let auth_quota = Quota::per_minute(NonZeroU32::new(AUTH_PER_MINUTE).unwrap());

        Ok(Self {
            http,
            permits: Semaphore::new(config.max_concurrent.max(1)),
            config,
            ticket: RwLock::new(None),
            general_limit: RateLimiter::direct(general_quota),
            auth_limit: RateLimiter::direct(auth_quota),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/api2/json/{}",
            self.config.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// GET `path` and return the raw JSON body. Transient failures are
    /// retried with exponential backoff and full jitter; a 401 under
    /// ticket auth triggers exactly one refresh-and-retry.
    pub async fn get_json(&self, path: &str) -> ApiResult<serde_json::Value> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.execute(path).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < MAX_ATTEMPTS => {
                    let delay = backoff_delay(attempt);
                    tracing::debug!(
                        path,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient upstream failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// GET `path` and decode the `data` envelope into `T`.
    pub async fn get_data<T: DeserializeOwned>(&self, path: &str) -> ApiResult<T> {
        let body = self.get_json(path).await?;
        let data = body.get("data").cloned().ok_or_else(|| ApiError::Parse {
            path: path.to_string(),
            reason: "missing data envelope".into(),
        })?;
        serde_json::from_value(data).map_err(|e| ApiError::Parse {
            path: path.to_string(),
            reason: e.to_string(),
        })
    }

    async fn execute(&self, path: &str) -> ApiResult<serde_json::Value> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ApiError::Transient {
                reason: "client shutting down".into(),
            })?;
        self.general_limit.until_ready().await;

        let response = self.send_authenticated(path).await?;

        // One refresh-and-retry on 401 under ticket auth; token rejection
        // is reported immediately.
        if response.status().as_u16() == 401
            && matches!(self.config.credentials, Some(Credentials::Password { .. }))
        {
            self.login().await?;
            let retried = self.send_authenticated(path).await?;
            return self.read_body(path, retried).await;
        }

        self.read_body(path, response).await
    }

    async fn send_authenticated(&self, path: &str) -> ApiResult<reqwest::Response> {
        let mut req = self.http.get(self.url(path));

        match &self.config.credentials {
            Some(Credentials::Token { token_name, secret }) => {
                req = req.header(
                    "Authorization",
                    token_header(self.config.kind, token_name, secret),
                );
            }
            Some(Credentials::Password { .. }) => {
                self.ensure_ticket().await?;
                let guard = self.ticket.read().await;
                if let Some(ticket) = guard.as_ref() {
                    req = req
                        .header("Cookie", ticket.cookie_header(self.config.kind))
                        .header("CSRFPreventionToken", ticket.csrf_token.clone());
                }
            }
            None => {}
        }

        req.send()
            .await
            .map_err(|e| ApiError::from_reqwest(e, self.config.timeout))
    }

    async fn read_body(
        &self,
        path: &str,
        response: reqwest::Response,
    ) -> ApiResult<serde_json::Value> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::from_status(status.as_u16(), path, body));
        }
        response.json().await.map_err(|e| ApiError::Parse {
            path: path.to_string(),
            reason: e.to_string(),
        })
    }

    async fn ensure_ticket(&self) -> ApiResult<()> {
        {
            let guard = self.ticket.read().await;
            if let Some(ticket) = guard.as_ref() {
                if !ticket.is_stale(chrono::Utc::now()) {
                    return Ok(());
                }
            }
        }
        self.login().await
    }

    async fn login(&self) -> ApiResult<()> {
        let (user, password) = match &self.config.credentials {
            Some(Credentials::Password { user, password }) => (user.clone(), password.clone()),
            _ => return Ok(()),
        };

        self.auth_limit.until_ready().await;

        let path = "access/ticket";
        let response = self
            .http
            .post(self.url(path))
            .form(&[("username", user.as_str()), ("password", password.as_str())])
            .send()
            .await
            .map_err(|e| ApiError::from_reqwest(e, self.config.timeout))?;

        let status = response.status();
        if !status.is_success() {
            // Never echo the body here; it can contain the username.
            return Err(ApiError::Auth {
                status: status.as_u16(),
            });
        }

        let body: serde_json::Value = response.json().await.map_err(|e| ApiError::Parse {
            path: path.to_string(),
            reason: e.to_string(),
        })?;
        let ticket = parse_ticket(&body, path)?;
        *self.ticket.write().await = Some(ticket);
        tracing::debug!(endpoint = %self.config.base_url, "ticket refreshed");
        Ok(())
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let exp = RETRY_BASE_MS.saturating_mul(1u64 << (attempt - 1).min(10));
    let upper = exp.min(RETRY_CAP_MS);
    Duration::from_millis(rand::thread_rng().gen_range(0..=upper))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_stays_under_cap() {
        for attempt in 1..=10 {
            let d = backoff_delay(attempt);
            assert!(d <= Duration::from_millis(RETRY_CAP_MS));
        }
    }

    #[test]
    fn url_joins_without_double_slash() {
        let config = ClientConfig {
            base_url: "https://pve1:8006/".into(),
            kind: NodeKind::Pve,
            credentials: None,
            verify_tls: false,
            timeout: DEFAULT_TIMEOUT,
            max_concurrent: 4,
        };
        let t = Transport::new(config).unwrap();
        assert_eq!(t.url("/nodes"), "https://pve1:8006/api2/json/nodes");
    }
}
