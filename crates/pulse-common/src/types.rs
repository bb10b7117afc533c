use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Which upstream API a configured node speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Pve,
    Pbs,
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeKind::Pve => write!(f, "pve"),
            NodeKind::Pbs => write!(f, "pbs"),
        }
    }
}

/// Per-node polling capabilities. Everything defaults to on; operators
/// switch individual collections off per node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Capabilities {
    pub monitor_vms: bool,
    pub monitor_containers: bool,
    pub monitor_storage: bool,
    pub monitor_backups: bool,
    pub monitor_datastores: bool,
    pub monitor_sync_jobs: bool,
    pub monitor_verify_jobs: bool,
    pub monitor_prune_jobs: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            monitor_vms: true,
            monitor_containers: true,
            monitor_storage: true,
            monitor_backups: true,
            monitor_datastores: true,
            monitor_sync_jobs: true,
            monitor_verify_jobs: true,
            monitor_prune_jobs: true,
        }
    }
}

/// A configured upstream node as persisted in the credential store.
///
/// Authentication is either `user` + `password` (ticket auth) or
/// `token_name` + `token_secret` (API token); both sets present means the
/// token wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfig {
    pub id: String,
    pub kind: NodeKind,
    pub name: String,
    /// Base URL including scheme and port, e.g. `https://pve1:8006`.
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_secret: Option<String>,
    #[serde(default)]
    pub verify_tls: bool,
    #[serde(default)]
    pub capabilities: Capabilities,
    /// Per-call deadline override in seconds; the engine default is 10.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Cached cluster membership from the last successful `clusterStatus`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cluster_endpoints: Vec<ClusterEndpoint>,
}

impl NodeConfig {
    pub fn has_token(&self) -> bool {
        self.token_name.is_some() && self.token_secret.is_some()
    }

    pub fn has_password(&self) -> bool {
        self.user.is_some() && self.password.is_some()
    }
}

/// One member of a PVE cluster, as the engine tracks it for failover.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterEndpoint {
    pub node_name: String,
    pub host: String,
    pub online: bool,
    #[serde(default)]
    pub local_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnlineStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionHealth {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Live status of a configured (or cluster-discovered) node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    pub name: String,
    pub kind: NodeKind,
    pub status: OnlineStatus,
    pub connection_health: ConnectionHealth,
    /// CPU load as a fraction 0..1.
    pub cpu: f64,
    pub memory: UsageGauge,
    pub disk: UsageGauge,
    pub uptime: u64,
    pub is_cluster_member: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cluster_endpoints: Vec<ClusterEndpoint>,
}

/// used/total pair with the percentage precomputed so every consumer agrees
/// on the arithmetic: `usage = 100 * used / total` when `total > 0`, else 0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageGauge {
    pub used: u64,
    pub total: u64,
    pub usage: f64,
}

impl UsageGauge {
    pub fn new(used: u64, total: u64) -> Self {
        let usage = if total > 0 {
            (100.0 * used as f64 / total as f64).clamp(0.0, 100.0)
        } else {
            0.0
        };
        Self { used, total, usage }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuestType {
    Qemu,
    Lxc,
}

impl std::fmt::Display for GuestType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GuestType::Qemu => write!(f, "qemu"),
            GuestType::Lxc => write!(f, "lxc"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuestStatus {
    Running,
    Stopped,
    Paused,
    Unknown,
}

impl From<&str> for GuestStatus {
    fn from(s: &str) -> Self {
        match s {
            "running" => GuestStatus::Running,
            "stopped" => GuestStatus::Stopped,
            "paused" => GuestStatus::Paused,
            _ => GuestStatus::Unknown,
        }
    }
}

/// A VM or container as it appears in the merged snapshot. Rebuilt from
/// scratch every poll; identity is `(instance, type, vmid)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Guest {
    #[serde(rename = "type")]
    pub guest_type: GuestType,
    pub vmid: u64,
    /// Host node name as reported by the cluster.
    pub node: String,
    /// The configured node (or canonical cluster) this guest was polled from.
    pub instance: String,
    pub name: String,
    pub status: GuestStatus,
    /// CPU load as a fraction 0..1.
    pub cpu: f64,
    pub cpus: u32,
    pub memory: UsageGauge,
    pub disk: UsageGauge,
    /// Byte-per-second rates derived from consecutive counter samples;
    /// never negative.
    pub disk_read: f64,
    pub disk_write: f64,
    pub network_in: f64,
    pub network_out: f64,
    pub uptime: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub meta: HashMap<String, String>,
}

/// A storage pool visible on a PVE node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageEntry {
    pub id: String,
    pub node: String,
    pub instance: String,
    pub name: String,
    #[serde(rename = "type")]
    pub storage_type: String,
    /// Comma-separated content kinds, e.g. `"images,iso,backup"`.
    pub content: String,
    pub status: OnlineStatus,
    pub shared: bool,
    pub used: u64,
    pub total: u64,
    pub free: u64,
    /// True when this PVE storage wraps a PBS datastore.
    pub is_pbs: bool,
}

impl StorageEntry {
    pub fn holds_backups(&self) -> bool {
        self.content.split(',').any(|c| c.trim() == "backup")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupKind {
    /// A guest snapshot recorded by PVE.
    Snapshot,
    /// A backup archive on PVE-attached storage.
    Local,
    /// A backup held by a PBS datastore.
    Remote,
}

/// One backup, from whichever API reported it. A PBS backup discovered via
/// both the direct PBS API and the PVE storage listing is a single record
/// keyed by `(vmid, backup_time)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupRecord {
    pub backup_type: BackupKind,
    pub vmid: u64,
    pub guest_type: GuestType,
    pub node: String,
    /// Seconds since the epoch.
    pub backup_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datastore: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verified: Option<bool>,
    #[serde(default)]
    pub protected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl BackupRecord {
    /// Deduplication key per the snapshot invariant.
    pub fn dedup_key(&self) -> (u64, i64) {
        (self.vmid, self.backup_time)
    }
}

/// A point-in-time guest image recorded by PVE (distinct from our Snapshot).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuestSnapshot {
    pub node: String,
    pub vmid: u64,
    pub guest_type: GuestType,
    pub name: String,
    /// Seconds since the epoch; 0 for the synthetic `current` entry.
    pub snaptime: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PveBackups {
    pub guest_snapshots: Vec<GuestSnapshot>,
    pub storage_backups: Vec<BackupRecord>,
}

/// A PBS datastore with capacity gauges.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PbsDatastore {
    pub name: String,
    pub used: u64,
    pub total: u64,
    pub free: u64,
    pub usage: f64,
}

/// Last-run state of a PBS maintenance job (sync/verify/prune).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PbsJobStatus {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_time: Option<i64>,
}

/// A polled PBS instance with its datastores and job health.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PbsInstance {
    pub name: String,
    pub host: String,
    pub status: OnlineStatus,
    pub connection_health: ConnectionHealth,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub datastores: Vec<PbsDatastore>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sync_jobs: Vec<PbsJobStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub verify_jobs: Vec<PbsJobStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prune_jobs: Vec<PbsJobStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Warning,
    Critical,
}

impl std::fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertLevel::Warning => write!(f, "warning"),
            AlertLevel::Critical => write!(f, "critical"),
        }
    }
}

/// An active alert as surfaced in the snapshot. Lives across polls; created,
/// updated and retired by the alert engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: String,
    /// Stable reference of the affected entity, e.g. `guest/prod/qemu/100`.
    pub resource_id: String,
    pub resource_name: String,
    pub metric: String,
    pub threshold: f64,
    pub value: f64,
    pub level: AlertLevel,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub acknowledged: bool,
    #[serde(default)]
    pub suppressed: bool,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertEventKind {
    Fired,
    Resolved,
}

/// What the alert engine hands to notifiers. `count > 1` means several
/// identical (resource, level) events were grouped within the window.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertEvent {
    pub kind: AlertEventKind,
    pub alert: Alert,
    pub count: u32,
    pub timestamp: DateTime<Utc>,
}

/// One sample per entity per poll tick, stored in the history ring.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPoint {
    pub timestamp: DateTime<Utc>,
    pub cpu: f64,
    pub mem_usage: f64,
    pub disk_usage: f64,
    pub disk_read_rate: f64,
    pub disk_write_rate: f64,
    pub net_in_rate: f64,
    pub net_out_rate: f64,
}

/// An unconfigured PVE/PBS instance found by the discovery scanner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredServer {
    pub ip: String,
    pub port: u16,
    pub kind: NodeKind,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

/// The complete instantaneous state, replaced whole once per poll
/// iteration. Immutable once published.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub nodes: Vec<NodeStatus>,
    pub vms: Vec<Guest>,
    pub containers: Vec<Guest>,
    pub storage: Vec<StorageEntry>,
    pub pve_backups: PveBackups,
    pub pbs_backups: Vec<BackupRecord>,
    pub pbs_instances: Vec<PbsInstance>,
    pub alerts: Vec<Alert>,
    pub generated_at: DateTime<Utc>,
}

impl Default for NodeStatus {
    fn default() -> Self {
        Self {
            name: String::new(),
            kind: NodeKind::Pve,
            status: OnlineStatus::Offline,
            connection_health: ConnectionHealth::Unhealthy,
            cpu: 0.0,
            memory: UsageGauge::default(),
            disk: UsageGauge::default(),
            uptime: 0,
            is_cluster_member: false,
            cluster_name: None,
            cluster_endpoints: Vec::new(),
        }
    }
}
