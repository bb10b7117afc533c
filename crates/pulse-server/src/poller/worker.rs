//! One long-lived worker per configured node: poll, normalize, fail over.

use crate::poller::endpoints::EndpointSet;
use crate::poller::rates::{RateCache, RateKey};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use pulse_common::types::{
    BackupKind, BackupRecord, ClusterEndpoint, ConnectionHealth, Guest, GuestSnapshot,
    GuestStatus, GuestType, NodeConfig, NodeKind, NodeStatus, OnlineStatus, PbsDatastore,
    PbsInstance, PbsJobStatus, PveBackups, Snapshot, StorageEntry, UsageGauge,
};
use pulse_proxmox::pve::{ClusterStatusEntry, PveGuest, PveNode};
use pulse_proxmox::{ApiError, ClientConfig, PbsClient, PveClient};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// How long cached cluster membership stays fresh.
const CLUSTER_REFRESH_SECS: u64 = 300;
/// Last-known entities are retained for this many missed polls.
const STALE_RETENTION_POLLS: u32 = 3;
/// Endpoints tried per tick: the preferred one plus one failover.
const ATTEMPTS_PER_TICK: usize = 2;

/// One worker's contribution to the merged snapshot.
#[derive(Debug, Clone, Default)]
pub struct PartialSnapshot {
    pub node_id: String,
    pub instance: String,
    pub generated_at: DateTime<Utc>,
    pub nodes: Vec<NodeStatus>,
    pub vms: Vec<Guest>,
    pub containers: Vec<Guest>,
    pub storage: Vec<StorageEntry>,
    pub pve_backups: PveBackups,
    pub pbs_backups: Vec<BackupRecord>,
    pub pbs_instances: Vec<PbsInstance>,
    /// Entities are last-known values from before the node went dark.
    pub stale: bool,
}

impl PartialSnapshot {
    fn empty(node: &NodeConfig, instance: String) -> Self {
        Self {
            node_id: node.id.clone(),
            instance,
            generated_at: Utc::now(),
            ..Default::default()
        }
    }
}

pub struct NodeWorker {
    node: NodeConfig,
    tick: std::time::Duration,
    rates: Arc<RateCache>,
    out: mpsc::Sender<PartialSnapshot>,
    endpoints: EndpointSet,
    cluster_name: Option<String>,
    cluster_endpoints: Vec<ClusterEndpoint>,
    cluster_refreshed: Option<Instant>,
    last_good: Option<PartialSnapshot>,
    missed_polls: u32,
}

impl NodeWorker {
    pub fn new(
        node: NodeConfig,
        tick: std::time::Duration,
        rates: Arc<RateCache>,
        out: mpsc::Sender<PartialSnapshot>,
    ) -> Self {
        // Cached membership from the store seeds the failover list so a
        // restart can reach a cluster whose entry endpoint is down.
        let mut urls = vec![node.url.clone()];
        for member in &node.cluster_endpoints {
            let url = member_url(&node.url, &member.host);
            if !urls.contains(&url) {
                urls.push(url);
            }
        }
        Self {
            endpoints: EndpointSet::new(urls),
            cluster_name: node.cluster_name.clone(),
            cluster_endpoints: node.cluster_endpoints.clone(),
            cluster_refreshed: None,
            last_good: None,
            missed_polls: 0,
            tick,
            rates,
            out,
            node,
        }
    }

    /// Poll until the supervisor drops the receiving end or aborts us.
    /// Aborting mid-poll drops the in-flight HTTP futures, which closes
    /// their connections.
    pub async fn run(mut self) {
        let mut tick = tokio::time::interval(self.tick);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            let part = self.poll_once().await;
            if self.out.send(part).await.is_err() {
                return;
            }
        }
    }

    /// One complete poll iteration, always yielding a partial snapshot.
    pub async fn poll_once(&mut self) -> PartialSnapshot {
        match self.node.kind {
            NodeKind::Pve => self.poll_pve().await,
            NodeKind::Pbs => self.poll_pbs().await,
        }
    }

    fn instance(&self) -> String {
        self.cluster_name.clone().unwrap_or_else(|| self.node.name.clone())
    }

    // ---- PVE ----

    async fn poll_pve(&mut self) -> PartialSnapshot {
        self.maybe_refresh_cluster().await;

        let candidates = self.endpoints.candidates(Instant::now());
        let mut failed_endpoints: Vec<String> = Vec::new();

        for url in candidates.iter().take(ATTEMPTS_PER_TICK) {
            match self.fetch_pve(url).await {
                Ok(mut part) => {
                    self.endpoints.record_success(url);
                    self.missed_polls = 0;
                    mark_failed_members(&mut part.nodes, &failed_endpoints, &self.cluster_endpoints);
                    self.last_good = Some(part.clone());
                    return part;
                }
                Err(e) if e.is_auth() => {
                    // Same credentials everywhere; failover will not help.
                    tracing::warn!(node = %self.node.name, error = %e, "authentication rejected");
                    break;
                }
                Err(e) => {
                    tracing::warn!(node = %self.node.name, endpoint = %url, error = %e, "poll failed");
                    self.endpoints.record_failure(url, Instant::now());
                    failed_endpoints.push(url.clone());
                }
            }
        }

        self.offline_partial()
    }

    async fn maybe_refresh_cluster(&mut self) {
        let fresh = self
            .cluster_refreshed
            .map(|at| at.elapsed().as_secs() < CLUSTER_REFRESH_SECS)
            .unwrap_or(false);
        if fresh {
            return;
        }
        let Some(url) = self.endpoints.candidates(Instant::now()).into_iter().next() else {
            return;
        };
        let client = match PveClient::new(self.client_config(&url)) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(node = %self.node.name, error = %e, "client build failed");
                return;
            }
        };
        match client.cluster_status().await {
            Ok(entries) => {
                self.apply_cluster_status(&entries);
                self.cluster_refreshed = Some(Instant::now());
            }
            Err(e) => {
                tracing::debug!(node = %self.node.name, error = %e, "cluster status unavailable");
            }
        }
    }

    fn apply_cluster_status(&mut self, entries: &[ClusterStatusEntry]) {
        let cluster = entries.iter().find(|e| e.entry_type == "cluster");
        let members: Vec<&ClusterStatusEntry> =
            entries.iter().filter(|e| e.entry_type == "node").collect();

        if let (Some(cluster), true) = (cluster, members.len() > 1) {
            self.cluster_name = Some(cluster.name.clone());
            self.cluster_endpoints = members
                .iter()
                .map(|m| ClusterEndpoint {
                    node_name: m.name.clone(),
                    host: m.ip.clone().unwrap_or_default(),
                    online: m.online.unwrap_or(false),
                    local_id: m.id.clone().unwrap_or_default(),
                })
                .collect();
            // The configured URL stays first as the entry endpoint; members
            // follow in reported order for failover.
            let mut urls = vec![self.node.url.clone()];
            for member in self.cluster_endpoints.iter().filter(|m| !m.host.is_empty()) {
                let url = member_url(&self.node.url, &member.host);
                if !urls.contains(&url) {
                    urls.push(url);
                }
            }
            self.endpoints.replace(urls);
            tracing::info!(
                node = %self.node.name,
                cluster = %cluster.name,
                members = members.len(),
                "cluster membership refreshed"
            );
        } else {
            self.cluster_name = None;
            self.cluster_endpoints = Vec::new();
            self.endpoints.replace(vec![self.node.url.clone()]);
        }
    }

    fn client_config(&self, url: &str) -> ClientConfig {
        ClientConfig::from_node(&self.node).with_base_url(url)
    }

    async fn fetch_pve(&self, url: &str) -> Result<PartialSnapshot, ApiError> {
        let client = PveClient::new(self.client_config(url))?;
        let now = Utc::now();
        let caps = &self.node.capabilities;
        let instance = self.instance();

        let pve_nodes = client.list_nodes().await?;

        let mut part = PartialSnapshot::empty(&self.node, instance.clone());
        part.generated_at = now;

        for n in &pve_nodes {
            part.nodes.push(self.node_status_from(n));
        }

        let mut seen_guests: HashSet<(GuestType, u64)> = HashSet::new();
        for n in &pve_nodes {
            if n.status.as_deref() == Some("offline") {
                continue;
            }
            let name = n.node.as_str();

            let (vms, containers, storage) = tokio::join!(
                fetch_guests(&client, caps.monitor_vms, name, GuestType::Qemu),
                fetch_guests(&client, caps.monitor_containers, name, GuestType::Lxc),
                fetch_storage(&client, caps.monitor_storage, name),
            );

            for raw in &vms {
                if seen_guests.insert((GuestType::Qemu, raw.vmid)) {
                    part.vms
                        .push(self.guest_from(raw, name, GuestType::Qemu, url, &instance, now));
                }
            }
            for raw in &containers {
                if seen_guests.insert((GuestType::Lxc, raw.vmid)) {
                    part.containers
                        .push(self.guest_from(raw, name, GuestType::Lxc, url, &instance, now));
                }
            }

            for s in &storage {
                let entry = storage_entry(s, name, &instance);
                let wants_backups =
                    caps.monitor_backups && entry.holds_backups() && entry.status == OnlineStatus::Online;
                if wants_backups {
                    match client.list_storage_contents(name, &entry.name).await {
                        Ok(contents) => {
                            for c in &contents {
                                let Some(vmid) = c.vmid else { continue };
                                part.pve_backups.storage_backups.push(BackupRecord {
                                    backup_type: if entry.is_pbs {
                                        BackupKind::Remote
                                    } else {
                                        BackupKind::Local
                                    },
                                    vmid,
                                    guest_type: if c.is_lxc() {
                                        GuestType::Lxc
                                    } else {
                                        GuestType::Qemu
                                    },
                                    node: name.to_string(),
                                    backup_time: c.ctime,
                                    size_bytes: c.size,
                                    storage: Some(entry.name.clone()),
                                    datastore: None,
                                    namespace: None,
                                    verified: None,
                                    protected: c.protected.unwrap_or(false),
                                    encrypted: None,
                                    owner: None,
                                    notes: c.notes.clone(),
                                });
                            }
                        }
                        Err(e) => {
                            tracing::warn!(
                                node = %self.node.name,
                                storage = %entry.name,
                                error = %e,
                                "storage content listing failed"
                            );
                        }
                    }
                }
                part.storage.push(entry);
            }
        }

        // Per-guest snapshot listings, bounded by the client semaphore.
        let guest_refs: Vec<(&str, GuestType, u64)> = part
            .vms
            .iter()
            .map(|g| (g.node.as_str(), GuestType::Qemu, g.vmid))
            .chain(
                part.containers
                    .iter()
                    .map(|g| (g.node.as_str(), GuestType::Lxc, g.vmid)),
            )
            .collect();
        let listings = join_all(guest_refs.iter().map(|(node, gtype, vmid)| {
            let client = &client;
            async move {
                (
                    node.to_string(),
                    *gtype,
                    *vmid,
                    client.list_snapshots(node, *gtype, *vmid).await,
                )
            }
        }))
        .await;
        for (node, gtype, vmid, result) in listings {
            match result {
                Ok(entries) => {
                    for s in entries.iter().filter(|s| s.name != "current") {
                        part.pve_backups.guest_snapshots.push(GuestSnapshot {
                            node: node.clone(),
                            vmid,
                            guest_type: gtype,
                            name: s.name.clone(),
                            snaptime: s.snaptime.unwrap_or(0) as i64,
                            description: s.description.clone(),
                        });
                    }
                }
                Err(e) => {
                    tracing::debug!(node = %node, vmid, error = %e, "snapshot listing failed");
                }
            }
        }

        Ok(part)
    }

    fn node_status_from(&self, n: &PveNode) -> NodeStatus {
        let online = n.status.as_deref() == Some("online") || n.uptime.unwrap_or(0) > 0;
        NodeStatus {
            name: n.node.clone(),
            kind: NodeKind::Pve,
            status: if online {
                OnlineStatus::Online
            } else {
                OnlineStatus::Offline
            },
            connection_health: if online {
                ConnectionHealth::Healthy
            } else {
                ConnectionHealth::Unhealthy
            },
            cpu: n.cpu,
            memory: UsageGauge::new(n.mem.unwrap_or(0), n.maxmem.unwrap_or(0)),
            disk: UsageGauge::new(n.disk.unwrap_or(0), n.maxdisk.unwrap_or(0)),
            uptime: n.uptime.unwrap_or(0),
            is_cluster_member: self.cluster_name.is_some(),
            cluster_name: self.cluster_name.clone(),
            cluster_endpoints: self.cluster_endpoints.clone(),
        }
    }

    fn guest_from(
        &self,
        raw: &PveGuest,
        node_name: &str,
        guest_type: GuestType,
        endpoint: &str,
        instance: &str,
        now: DateTime<Utc>,
    ) -> Guest {
        let rate = |counter: &'static str, value: Option<u64>| {
            self.rates.rate(
                RateKey {
                    endpoint: endpoint.to_string(),
                    guest_type,
                    vmid: raw.vmid,
                    counter,
                },
                value.unwrap_or(0),
                now,
            )
        };
        Guest {
            guest_type,
            vmid: raw.vmid,
            node: node_name.to_string(),
            instance: instance.to_string(),
            name: raw.name.clone().unwrap_or_else(|| raw.vmid.to_string()),
            status: GuestStatus::from(raw.status.as_deref().unwrap_or("unknown")),
            cpu: raw.cpu.clamp(0.0, 1.0),
            cpus: raw.cpus.unwrap_or(0) as u32,
            memory: UsageGauge::new(raw.mem.unwrap_or(0), raw.maxmem.unwrap_or(0)),
            disk: UsageGauge::new(raw.disk.unwrap_or(0), raw.maxdisk.unwrap_or(0)),
            disk_read: rate("diskread", raw.diskread),
            disk_write: rate("diskwrite", raw.diskwrite),
            network_in: rate("netin", raw.netin),
            network_out: rate("netout", raw.netout),
            uptime: raw.uptime.unwrap_or(0),
            tags: raw.tag_list(),
            meta: Default::default(),
        }
    }

    // ---- PBS ----

    async fn poll_pbs(&mut self) -> PartialSnapshot {
        match self.fetch_pbs().await {
            Ok(part) => {
                self.missed_polls = 0;
                self.last_good = Some(part.clone());
                part
            }
            Err(e) => {
                if e.is_auth() {
                    tracing::warn!(node = %self.node.name, error = %e, "authentication rejected");
                } else {
                    tracing::warn!(node = %self.node.name, error = %e, "poll failed");
                }
                self.offline_partial()
            }
        }
    }

    async fn fetch_pbs(&self) -> Result<PartialSnapshot, ApiError> {
        let client = PbsClient::new(ClientConfig::from_node(&self.node))?;
        let caps = &self.node.capabilities;
        let now = Utc::now();

        let version = client.version().await?;

        let mut part = PartialSnapshot::empty(&self.node, self.node.name.clone());
        part.generated_at = now;

        let mut datastores = Vec::new();
        if caps.monitor_datastores {
            for ds in client.list_datastores().await? {
                let used = ds.used.unwrap_or(0);
                let total = ds.total.unwrap_or(0);
                let gauge = UsageGauge::new(used, total);
                datastores.push(PbsDatastore {
                    name: ds.store.clone(),
                    used,
                    total,
                    free: ds.avail.unwrap_or(total.saturating_sub(used)),
                    usage: gauge.usage,
                });

                match client.list_snapshots(&ds.store, None).await {
                    Ok(snapshots) => {
                        for s in &snapshots {
                            let Some(vmid) = s.vmid() else { continue };
                            part.pbs_backups.push(BackupRecord {
                                backup_type: BackupKind::Remote,
                                vmid,
                                guest_type: if s.is_lxc() {
                                    GuestType::Lxc
                                } else {
                                    GuestType::Qemu
                                },
                                node: self.node.name.clone(),
                                backup_time: s.backup_time,
                                size_bytes: s.size,
                                storage: None,
                                datastore: Some(ds.store.clone()),
                                namespace: s.namespace.clone(),
                                verified: s.verified(),
                                protected: s.protected.unwrap_or(false),
                                encrypted: s.encrypted(),
                                owner: s.owner.clone(),
                                notes: s.comment.clone(),
                            });
                        }
                    }
                    Err(e) => {
                        tracing::warn!(
                            node = %self.node.name,
                            datastore = %ds.store,
                            error = %e,
                            "snapshot listing failed"
                        );
                    }
                }
            }
        }

        let sync_jobs = fetch_jobs(caps.monitor_sync_jobs, client.list_sync_jobs()).await;
        let verify_jobs = fetch_jobs(caps.monitor_verify_jobs, client.list_verify_jobs()).await;
        let prune_jobs = fetch_jobs(caps.monitor_prune_jobs, client.list_prune_jobs()).await;

        // Aggregate datastore capacity doubles as the node-level disk gauge.
        let total: u64 = datastores.iter().map(|d| d.total).sum();
        let used: u64 = datastores.iter().map(|d| d.used).sum();
        part.nodes.push(NodeStatus {
            name: self.node.name.clone(),
            kind: NodeKind::Pbs,
            status: OnlineStatus::Online,
            connection_health: ConnectionHealth::Healthy,
            cpu: 0.0,
            memory: UsageGauge::default(),
            disk: UsageGauge::new(used, total),
            uptime: 0,
            is_cluster_member: false,
            cluster_name: None,
            cluster_endpoints: Vec::new(),
        });

        part.pbs_instances.push(PbsInstance {
            name: self.node.name.clone(),
            host: self.node.url.clone(),
            status: OnlineStatus::Online,
            connection_health: ConnectionHealth::Healthy,
            version: Some(version.version),
            datastores,
            sync_jobs,
            verify_jobs,
            prune_jobs,
        });

        Ok(part)
    }

    // ---- offline handling ----

    /// All endpoints down (or auth failed): keep the last-known entities
    /// around for a few polls so the UI does not flap, then decay to a
    /// bare offline node status.
    fn offline_partial(&mut self) -> PartialSnapshot {
        self.missed_polls = self.missed_polls.saturating_add(1);

        let retained = if self.missed_polls <= STALE_RETENTION_POLLS {
            self.last_good.clone()
        } else {
            self.last_good = None;
            None
        };
        let mut part = match retained {
            Some(mut part) => {
                part.stale = true;
                part
            }
            None => {
                let mut part = PartialSnapshot::empty(&self.node, self.instance());
                part.nodes.push(NodeStatus {
                    name: self.node.name.clone(),
                    kind: self.node.kind,
                    ..Default::default()
                });
                if self.node.kind == NodeKind::Pbs {
                    part.pbs_instances.push(PbsInstance {
                        name: self.node.name.clone(),
                        host: self.node.url.clone(),
                        status: OnlineStatus::Offline,
                        connection_health: ConnectionHealth::Unhealthy,
                        version: None,
                        datastores: Vec::new(),
                        sync_jobs: Vec::new(),
                        verify_jobs: Vec::new(),
                        prune_jobs: Vec::new(),
                    });
                }
                part
            }
        };

        part.generated_at = Utc::now();
        for node in &mut part.nodes {
            node.status = OnlineStatus::Offline;
            node.connection_health = ConnectionHealth::Unhealthy;
        }
        for pbs in &mut part.pbs_instances {
            pbs.status = OnlineStatus::Offline;
            pbs.connection_health = ConnectionHealth::Unhealthy;
        }
        part
    }
}

async fn fetch_guests(
    client: &PveClient,
    enabled: bool,
    node: &str,
    guest_type: GuestType,
) -> Vec<PveGuest> {
    if !enabled {
        return Vec::new();
    }
    let result = match guest_type {
        GuestType::Qemu => client.list_vms(node).await,
        GuestType::Lxc => client.list_containers(node).await,
    };
    match result {
        Ok(guests) => guests,
        Err(e) => {
            tracing::warn!(node, kind = %guest_type, error = %e, "guest listing failed");
            Vec::new()
        }
    }
}

async fn fetch_storage(
    client: &PveClient,
    enabled: bool,
    node: &str,
) -> Vec<pulse_proxmox::pve::PveStorage> {
    if !enabled {
        return Vec::new();
    }
    match client.list_storage(node).await {
        Ok(storage) => storage,
        Err(e) => {
            tracing::warn!(node, error = %e, "storage listing failed");
            Vec::new()
        }
    }
}

async fn fetch_jobs(
    enabled: bool,
    call: impl std::future::Future<Output = Result<Vec<pulse_proxmox::pbs::PbsJob>, ApiError>>,
) -> Vec<PbsJobStatus> {
    if !enabled {
        return Vec::new();
    }
    match call.await {
        Ok(jobs) => jobs
            .into_iter()
            .map(|j| PbsJobStatus {
                id: j.id,
                store: j.store,
                last_run_state: j.last_run_state,
                last_run_time: j.last_run_endtime.map(|t| t as i64),
            })
            .collect(),
        Err(e) => {
            tracing::debug!(error = %e, "job listing failed");
            Vec::new()
        }
    }
}

fn storage_entry(
    s: &pulse_proxmox::pve::PveStorage,
    node: &str,
    instance: &str,
) -> StorageEntry {
    let used = s.used.unwrap_or(0);
    let total = s.total.unwrap_or(0);
    StorageEntry {
        id: format!("{node}/{}", s.storage),
        node: node.to_string(),
        instance: instance.to_string(),
        name: s.storage.clone(),
        storage_type: s.storage_type.clone(),
        content: s.content.clone(),
        status: if s.active.unwrap_or(true) {
            OnlineStatus::Online
        } else {
            OnlineStatus::Offline
        },
        shared: s.shared.unwrap_or(false),
        used,
        total,
        free: s.avail.unwrap_or(total.saturating_sub(used)),
        is_pbs: s.storage_type == "pbs",
    }
}

/// A cluster member's API URL: the member host with the entry endpoint's
/// scheme and port, unless the host is already a full URL.
fn member_url(entry_url: &str, host: &str) -> String {
    if host.contains("://") {
        return host.trim_end_matches('/').to_string();
    }
    let scheme = if entry_url.starts_with("http://") {
        "http"
    } else {
        "https"
    };
    let port = entry_url
        .rsplit(':')
        .next()
        .and_then(|p| p.trim_end_matches('/').parse::<u16>().ok())
        .unwrap_or(8006);
    format!("{scheme}://{host}:{port}")
}

/// S3 semantics: members whose endpoint failed this tick surface as
/// degraded while the rest stay healthy.
fn mark_failed_members(
    nodes: &mut [NodeStatus],
    failed_endpoints: &[String],
    members: &[ClusterEndpoint],
) {
    if failed_endpoints.is_empty() {
        return;
    }
    for node in nodes.iter_mut() {
        let failed = members.iter().any(|m| {
            m.node_name == node.name
                && failed_endpoints
                    .iter()
                    .any(|url| !m.host.is_empty() && url.contains(m.host.trim_end_matches('/')))
        });
        if failed {
            node.connection_health = ConnectionHealth::Degraded;
        }
    }
}

/// Strip worker-only bookkeeping into the public snapshot shape. Used by
/// the supervisor's merge step and by tests.
pub fn into_snapshot_parts(part: PartialSnapshot, snapshot: &mut Snapshot) {
    snapshot.nodes.extend(part.nodes);
    snapshot.vms.extend(part.vms);
    snapshot.containers.extend(part.containers);
    snapshot.storage.extend(part.storage);
    snapshot
        .pve_backups
        .guest_snapshots
        .extend(part.pve_backups.guest_snapshots);
    snapshot
        .pve_backups
        .storage_backups
        .extend(part.pve_backups.storage_backups);
    snapshot.pbs_backups.extend(part.pbs_backups);
    snapshot.pbs_instances.extend(part.pbs_instances);
}
