//! Authentication state: API token headers or ticket + CSRF with refresh.

use crate::error::{ApiError, ApiResult};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use pulse_common::types::NodeKind;
use serde::Deserialize;

/// How a client authenticates against its endpoint.
#[derive(Debug, Clone)]
pub enum Credentials {
    /// `PVEAPIToken=user@realm!tokenid=secret` (PBS uses the same scheme
    /// with its own prefix). Stateless, no refresh needed.
    Token { token_name: String, secret: String },
    /// Username + password exchanged for a ticket; the ticket expires after
    /// two hours and is refreshed proactively after one.
    Password { user: String, password: String },
}

impl Credentials {
    /// Build from a node config, preferring the token when both are set.
    pub fn from_node(node: &pulse_common::types::NodeConfig) -> Option<Self> {
        if let (Some(token_name), Some(secret)) = (&node.token_name, &node.token_secret) {
            return Some(Credentials::Token {
                token_name: token_name.clone(),
                secret: secret.clone(),
            });
        }
        if let (Some(user), Some(password)) = (&node.user, &node.password) {
            return Some(Credentials::Password {
                user: user.clone(),
                password: password.clone(),
            });
        }
        None
    }
}

/// A ticket obtained from `access/ticket`, with its CSRF companion.
#[derive(Debug, Clone)]
pub struct Ticket {
    pub ticket: String,
    pub csrf_token: String,
    pub obtained_at: DateTime<Utc>,
}

impl Ticket {
    /// Proxmox tickets last two hours; refresh after one to stay clear of
    /// the boundary.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        now - self.obtained_at > ChronoDuration::hours(1)
    }

    pub fn cookie_header(&self, kind: NodeKind) -> String {
        match kind {
            NodeKind::Pve => format!("PVEAuthCookie={}", self.ticket),
            NodeKind::Pbs => format!("PBSAuthCookie={}", self.ticket),
        }
    }
}

/// Authorization header value for token auth.
pub fn token_header(kind: NodeKind, token_name: &str, secret: &str) -> String {
    match kind {
        NodeKind::Pve => format!("PVEAPIToken={token_name}={secret}"),
        NodeKind::Pbs => format!("PBSAPIToken={token_name}:{secret}"),
    }
}

#[derive(Deserialize)]
pub(crate) struct TicketResponse {
    pub ticket: String,
    #[serde(rename = "CSRFPreventionToken")]
    pub csrf_token: Option<String>,
}

pub(crate) fn parse_ticket(body: &serde_json::Value, path: &str) -> ApiResult<Ticket> {
    let data = body.get("data").ok_or_else(|| ApiError::Parse {
        path: path.to_string(),
        reason: "missing data envelope".into(),
    })?;
    let resp: TicketResponse =
        serde_json::from_value(data.clone()).map_err(|e| ApiError::Parse {
            path: path.to_string(),
            reason: e.to_string(),
        })?;
    Ok(Ticket {
        ticket: resp.ticket,
        csrf_token: resp.csrf_token.unwrap_or_default(),
        obtained_at: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_header_formats_per_kind() {
        assert_eq!(
            token_header(NodeKind::Pve, "monitor@pam!pulse", "s3cret"),
            "PVEAPIToken=monitor@pam!pulse=s3cret"
        );
        assert_eq!(
            token_header(NodeKind::Pbs, "monitor@pbs!pulse", "s3cret"),
            "PBSAPIToken=monitor@pbs!pulse:s3cret"
        );
    }

    #[test]
    fn ticket_staleness_window() {
        let now = Utc::now();
        let fresh = Ticket {
            ticket: "t".into(),
            csrf_token: "c".into(),
            obtained_at: now - ChronoDuration::minutes(30),
        };
        assert!(!fresh.is_stale(now));
        let stale = Ticket {
            obtained_at: now - ChronoDuration::minutes(90),
            ..fresh
        };
        assert!(stale.is_stale(now));
    }
}
