//! Typed read operations against the PVE API.
//!
//! Wire structs stay close to the upstream field names and tolerate the
//! string/number drift between PVE releases; normalization into the merged
//! snapshot model happens in the poll engine.

use crate::error::ApiResult;
use crate::http::{ClientConfig, Transport};
use pulse_common::lenient;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct PveNode {
    pub node: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, deserialize_with = "lenient::f64_or_string")]
    pub cpu: f64,
    #[serde(default, deserialize_with = "lenient::opt_u64_or_string")]
    pub maxcpu: Option<u64>,
    #[serde(default, deserialize_with = "lenient::opt_u64_or_string")]
    pub mem: Option<u64>,
    #[serde(default, deserialize_with = "lenient::opt_u64_or_string")]
    pub maxmem: Option<u64>,
    #[serde(default, deserialize_with = "lenient::opt_u64_or_string")]
    pub disk: Option<u64>,
    #[serde(default, deserialize_with = "lenient::opt_u64_or_string")]
    pub maxdisk: Option<u64>,
    #[serde(default, deserialize_with = "lenient::opt_u64_or_string")]
    pub uptime: Option<u64>,
}

/// One entry of `cluster/status`: either the cluster record or a member node.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterStatusEntry {
    #[serde(rename = "type")]
    pub entry_type: String,
    pub name: String,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_bool_or_int")]
    pub online: Option<bool>,
    #[serde(default, deserialize_with = "lenient::opt_bool_or_int")]
    pub local: Option<bool>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_u64_or_string")]
    pub nodes: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PveGuest {
    #[serde(deserialize_with = "lenient::u64_or_string")]
    pub vmid: u64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, deserialize_with = "lenient::f64_or_string")]
    pub cpu: f64,
    #[serde(default, deserialize_with = "lenient::opt_u64_or_string")]
    pub cpus: Option<u64>,
    #[serde(default, deserialize_with = "lenient::opt_u64_or_string")]
    pub mem: Option<u64>,
    #[serde(default, deserialize_with = "lenient::opt_u64_or_string")]
    pub maxmem: Option<u64>,
    #[serde(default, deserialize_with = "lenient::opt_u64_or_string")]
    pub disk: Option<u64>,
    #[serde(default, deserialize_with = "lenient::opt_u64_or_string")]
    pub maxdisk: Option<u64>,
    #[serde(default, deserialize_with = "lenient::opt_u64_or_string")]
    pub diskread: Option<u64>,
    #[serde(default, deserialize_with = "lenient::opt_u64_or_string")]
    pub diskwrite: Option<u64>,
    #[serde(default, deserialize_with = "lenient::opt_u64_or_string")]
    pub netin: Option<u64>,
    #[serde(default, deserialize_with = "lenient::opt_u64_or_string")]
    pub netout: Option<u64>,
    #[serde(default, deserialize_with = "lenient::opt_u64_or_string")]
    pub uptime: Option<u64>,
    /// Semicolon-separated tag list as PVE reports it.
    #[serde(default)]
    pub tags: Option<String>,
}

impl PveGuest {
    pub fn tag_list(&self) -> Vec<String> {
        self.tags
            .as_deref()
            .unwrap_or("")
            .split(';')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PveStorage {
    pub storage: String,
    #[serde(rename = "type", default)]
    pub storage_type: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, deserialize_with = "lenient::opt_bool_or_int")]
    pub active: Option<bool>,
    #[serde(default, deserialize_with = "lenient::opt_bool_or_int")]
    pub shared: Option<bool>,
    #[serde(default, deserialize_with = "lenient::opt_u64_or_string")]
    pub used: Option<u64>,
    #[serde(default, deserialize_with = "lenient::opt_u64_or_string")]
    pub total: Option<u64>,
    #[serde(default, deserialize_with = "lenient::opt_u64_or_string")]
    pub avail: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PveStorageContent {
    pub volid: String,
    #[serde(default, deserialize_with = "lenient::opt_u64_or_string")]
    pub vmid: Option<u64>,
    #[serde(default, deserialize_with = "lenient::opt_u64_or_string")]
    pub size: Option<u64>,
    #[serde(default, deserialize_with = "lenient::i64_or_string")]
    pub ctime: i64,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_bool_or_int")]
    pub protected: Option<bool>,
    #[serde(default)]
    pub verification: Option<serde_json::Value>,
}

impl PveStorageContent {
    /// `volid` prefixes carry the guest type: `backup-01:backup/vzdump-qemu-...`.
    pub fn is_lxc(&self) -> bool {
        self.volid.contains("vzdump-lxc") || self.volid.contains("/ct/")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PveSnapshotEntry {
    pub name: String,
    #[serde(default, deserialize_with = "lenient::opt_u64_or_string")]
    pub snaptime: Option<u64>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    #[serde(default)]
    pub release: Option<String>,
}

/// Read-only client for one PVE endpoint.
pub struct PveClient {
    transport: Transport,
}

impl PveClient {
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

    pub async fn list_nodes(&self) -> ApiResult<Vec<PveNode>> {
        self.transport.get_data("nodes").await
    }

    pub async fn cluster_status(&self) -> ApiResult<Vec<ClusterStatusEntry>> {
        self.transport.get_data("cluster/status").await
    }

    pub async fn list_vms(&self, node: &str) -> ApiResult<Vec<PveGuest>> {
        self.transport.get_data(&format!("nodes/{node}/qemu")).await
    }

    pub async fn list_containers(&self, node: &str) -> ApiResult<Vec<PveGuest>> {
        self.transport.get_data(&format!("nodes/{node}/lxc")).await
    }

    pub async fn vm_status(&self, node: &str, vmid: u64) -> ApiResult<PveGuest> {
        self.transport
            .get_data(&format!("nodes/{node}/qemu/{vmid}/status/current"))
            .await
    }

    pub async fn lxc_status(&self, node: &str, vmid: u64) -> ApiResult<PveGuest> {
        self.transport
            .get_data(&format!("nodes/{node}/lxc/{vmid}/status/current"))
            .await
    }

    pub async fn list_storage(&self, node: &str) -> ApiResult<Vec<PveStorage>> {
        self.transport
            .get_data(&format!("nodes/{node}/storage"))
            .await
    }

    pub async fn list_storage_contents(
        &self,
        node: &str,
        storage: &str,
    ) -> ApiResult<Vec<PveStorageContent>> {
        self.transport
            .get_data(&format!("nodes/{node}/storage/{storage}/content?content=backup"))
            .await
    }

    pub async fn list_snapshots(
        &self,
        node: &str,
        guest_type: pulse_common::types::GuestType,
        vmid: u64,
    ) -> ApiResult<Vec<PveSnapshotEntry>> {
        let kind = match guest_type {
            pulse_common::types::GuestType::Qemu => "qemu",
            pulse_common::types::GuestType::Lxc => "lxc",
        };
        self.transport
            .get_data(&format!("nodes/{node}/{kind}/{vmid}/snapshot"))
            .await
    }
}
