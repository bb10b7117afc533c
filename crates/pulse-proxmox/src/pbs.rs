//! Typed read operations against the PBS API.

use crate::error::ApiResult;
use crate::http::{ClientConfig, Transport};
use crate::pve::VersionInfo;
use pulse_common::lenient;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct PbsDatastoreUsage {
    pub store: String,
    #[serde(default, deserialize_with = "lenient::opt_u64_or_string")]
    pub used: Option<u64>,
    #[serde(default, deserialize_with = "lenient::opt_u64_or_string")]
    pub total: Option<u64>,
    #[serde(default, deserialize_with = "lenient::opt_u64_or_string")]
    pub avail: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PbsVerification {
    #[serde(default)]
    pub state: Option<String>,
}

/// One backup group snapshot in a datastore. `backup-id` arrives as a
/// string even when it is a numeric vmid.
#[derive(Debug, Clone, Deserialize)]
pub struct PbsSnapshot {
    #[serde(rename = "backup-id", deserialize_with = "lenient::string_or_number")]
    pub backup_id: String,
    #[serde(rename = "backup-time", deserialize_with = "lenient::i64_or_string")]
    pub backup_time: i64,
    #[serde(rename = "backup-type", default)]
    pub backup_type: String,
    #[serde(default, deserialize_with = "lenient::opt_u64_or_string")]
    pub size: Option<u64>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_bool_or_int")]
    pub protected: Option<bool>,
    #[serde(default)]
    pub verification: Option<PbsVerification>,
    #[serde(default)]
    pub comment: Option<String>,
    /// Present when the archive is encrypted client-side.
    #[serde(default, rename = "crypt-mode")]
    pub crypt_mode: Option<String>,
    #[serde(default, rename = "backup-ns")]
    pub namespace: Option<String>,
}

impl PbsSnapshot {
    pub fn vmid(&self) -> Option<u64> {
        self.backup_id.trim().parse().ok()
    }

    pub fn is_lxc(&self) -> bool {
        self.backup_type == "ct"
    }

    pub fn verified(&self) -> Option<bool> {
        self.verification
            .as_ref()
            .and_then(|v| v.state.as_deref())
            .map(|s| s == "ok")
    }

    pub fn encrypted(&self) -> Option<bool> {
        self.crypt_mode.as_deref().map(|m| m != "none")
    }
}

/// A sync/verify/prune job with its last-run outcome.
#[derive(Debug, Clone, Deserialize)]
pub struct PbsJob {
    pub id: String,
    #[serde(default)]
    pub store: Option<String>,
    #[serde(default, rename = "last-run-state")]
    pub last_run_state: Option<String>,
    #[serde(default, rename = "last-run-endtime", deserialize_with = "lenient::opt_u64_or_string")]
    pub last_run_endtime: Option<u64>,
}

/// Read-only client for one PBS endpoint.
pub struct PbsClient {
    transport: Transport,
}

impl PbsClient {
    pub fn new(config: ClientConfig) -> ApiResult<Self> {
        Ok(Self {
            transport: Transport::new(config)?,
        })
    }

    pub fn base_url(&self) -> &str {
        self.transport.base_url()
    }

    pub async fn version(&self) -> ApiResult<VersionInfo> {
        self.transport.get_data("version").await
    }

    pub async fn list_datastores(&self) -> ApiResult<Vec<PbsDatastoreUsage>> {
        self.transport.get_data("status/datastore-usage").await
    }

    pub async fn list_snapshots(
        &self,
        datastore: &str,
        namespace: Option<&str>,
    ) -> ApiResult<Vec<PbsSnapshot>> {
        let path = match namespace {
            Some(ns) if !ns.is_empty() => {
                format!("admin/datastore/{datastore}/snapshots?ns={ns}")
            }
            _ => format!("admin/datastore/{datastore}/snapshots"),
        };
        self.transport.get_data(&path).await
    }

    pub async fn list_sync_jobs(&self) -> ApiResult<Vec<PbsJob>> {
        self.transport.get_data("admin/sync").await
    }

    pub async fn list_verify_jobs(&self) -> ApiResult<Vec<PbsJob>> {
        self.transport.get_data("admin/verify").await
    }

    pub async fn list_prune_jobs(&self) -> ApiResult<Vec<PbsJob>> {
        self.transport.get_data("admin/prune").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Credentials;
    use crate::http::DEFAULT_TIMEOUT;
    use pulse_common::types::NodeKind;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(server: &MockServer) -> ClientConfig {
        ClientConfig {
            base_url: server.uri(),
            kind: NodeKind::Pbs,
            credentials: Some(Credentials::Token {
                token_name: "monitor@pbs!pulse".into(),
                secret: "s3cret".into(),
            }),
            verify_tls: false,
            timeout: DEFAULT_TIMEOUT,
            max_concurrent: 4,
        }
    }

    #[tokio::test]
    async fn datastore_usage_decodes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api2/json/status/datastore-usage"))
            .and(header("Authorization", "PBSAPIToken=monitor@pbs!pulse:s3cret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"store": "backup-01", "used": 1000, "total": "4000", "avail": 3000}]
            })))
            .mount(&server)
            .await;

        let client = PbsClient::new(config(&server)).unwrap();
        let stores = client.list_datastores().await.unwrap();
        assert_eq!(stores[0].store, "backup-01");
        assert_eq!(stores[0].total, Some(4000));
    }

    #[tokio::test]
    async fn snapshots_accept_string_vmid_and_namespace() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api2/json/admin/datastore/backup-01/snapshots"))
            .and(query_param("ns", "prod"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{
                    "backup-id": "101",
                    "backup-time": 1700000000,
                    "backup-type": "vm",
                    "size": 12345,
                    "protected": 1,
                    "verification": {"state": "ok"}
                }]
            })))
            .mount(&server)
            .await;

        let client = PbsClient::new(config(&server)).unwrap();
        let snaps = client.list_snapshots("backup-01", Some("prod")).await.unwrap();
        assert_eq!(snaps[0].vmid(), Some(101));
        assert_eq!(snaps[0].verified(), Some(true));
        assert_eq!(snaps[0].protected, Some(true));
        assert!(!snaps[0].is_lxc());
    }
}
