//! Opportunistic subnet scanning for unconfigured PVE/PBS instances.

use crate::hub::StateHub;
use crate::state::AppState;
use pulse_common::types::{DiscoveredServer, NodeKind};
use serde::Deserialize;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

const PROBE_PORTS: [(u16, NodeKind); 2] = [(8006, NodeKind::Pve), (8007, NodeKind::Pbs)];
const TCP_TIMEOUT: Duration = Duration::from_secs(1);
const HTTP_TIMEOUT: Duration = Duration::from_secs(2);
const MAX_CONCURRENT_PROBES: usize = 32;

pub struct DiscoveryScanner {
    state: AppState,
    interval: Duration,
}

impl DiscoveryScanner {
    pub fn new(state: AppState, interval: Duration) -> Self {
        Self { state, interval }
    }

    pub async fn run(self) {
        let mut tick = tokio::time::interval(self.interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            match self.scan_once().await {
                Ok(found) => {
                    tracing::debug!(count = found.len(), "discovery scan finished");
                    self.state.hub.set_discovered(found);
                }
                Err(e) => tracing::warn!(error = %e, "discovery scan failed"),
            }
        }
    }

    async fn scan_once(&self) -> anyhow::Result<Vec<DiscoveredServer>> {
        let (subnets, excluded) = {
            let nodes = self
                .state
                .nodes
                .read()
                .unwrap_or_else(|p| p.into_inner());
            let mut excluded: HashSet<String> = HashSet::new();
            let mut subnets: Vec<Ipv4Addr> = Vec::new();
            if let Some(cidr) = &self.state.settings.discovery_subnet {
                if let Some(base) = parse_subnet_24(cidr) {
                    subnets.push(base);
                }
            }
            for node in nodes.iter() {
                if let Some(host) = host(&node.url) {
                    excluded.insert(host.to_string());
                    // Without an explicit subnet, scan the /24 around each
                    // configured node that has a literal address.
                    if subnets.is_empty() || self.state.settings.discovery_subnet.is_none() {
                        if let Ok(ip) = host.parse::<Ipv4Addr>() {
                            let octets = ip.octets();
                            let base = Ipv4Addr::new(octets[0], octets[1], octets[2], 0);
                            if !subnets.contains(&base) {
                                subnets.push(base);
                            }
                        }
                    }
                }
                for member in &node.cluster_endpoints {
                    if !member.host.is_empty() {
                        excluded.insert(member.host.clone());
                    }
                }
            }
            (subnets, excluded)
        };

        if subnets.is_empty() {
            tracing::debug!("no discovery subnet configured or derivable, skipping");
            return Ok(Vec::new());
        }

        let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_PROBES));
        let mut tasks = Vec::new();
        for base in subnets {
            let octets = base.octets();
            for host in 1..=254u8 {
                let ip = Ipv4Addr::new(octets[0], octets[1], octets[2], host);
                if excluded.contains(&ip.to_string()) {
                    continue;
                }
                for (port, kind) in PROBE_PORTS {
                    let semaphore = semaphore.clone();
                    tasks.push(tokio::spawn(async move {
                        let _permit = semaphore.acquire().await.ok()?;
                        probe(ip, port, kind).await
                    }));
                }
            }
        }

        let mut found = Vec::new();
        for task in tasks {
            if let Ok(Some(server)) = task.await {
                found.push(server);
            }
        }
        found.sort_by(|a, b| (&a.ip, a.port).cmp(&(&b.ip, b.port)));
        Ok(found)
    }
}

#[derive(Deserialize)]
struct VersionEnvelope {
    data: Option<VersionData>,
}

#[derive(Deserialize)]
struct VersionData {
    version: Option<String>,
}

async fn probe(ip: Ipv4Addr, port: u16, kind: NodeKind) -> Option<DiscoveredServer> {
    let addr = format!("{ip}:{port}");
    tokio::time::timeout(TCP_TIMEOUT, tokio::net::TcpStream::connect(&addr))
        .await
        .ok()?
        .ok()?;

    let client = reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .timeout(HTTP_TIMEOUT)
        .build()
        .ok()?;
    let url = format!("https://{ip}:{port}/api2/json/version");
    let version = match client.get(&url).send().await {
        Ok(resp) if resp.status().is_success() => resp
            .json::<VersionEnvelope>()
            .await
            .ok()
            .and_then(|v| v.data)
            .and_then(|d| d.version)
            .unwrap_or_else(|| "unknown".into()),
        // An auth challenge still identifies the product by its port.
        Ok(resp) if resp.status().as_u16() == 401 => "unknown".into(),
        _ => return None,
    };

    Some(DiscoveredServer {
        ip: ip.to_string(),
        port,
        kind,
        version,
        hostname: None,
    })
}

/// Host portion of a configured URL, scheme and port stripped.
pub fn host(url: &str) -> Option<&str> {
    let rest = url.split("://").nth(1).unwrap_or(url);
    let host = rest.split('/').next()?;
    Some(host.rsplit_once(':').map(|(h, _)| h).unwrap_or(host))
}

fn parse_subnet_24(cidr: &str) -> Option<Ipv4Addr> {
    let (addr, prefix) = cidr.split_once('/')?;
    if prefix.trim() != "24" {
        return None;
    }
    let ip: Ipv4Addr = addr.trim().parse().ok()?;
    let o = ip.octets();
    Some(Ipv4Addr::new(o[0], o[1], o[2], 0))
}

/// Exclusion helper shared with the REST layer: hide already-configured
/// hosts from the emitted list.
pub fn filter_excluded(hub: &StateHub, excluded: &HashSet<String>) -> Vec<DiscoveredServer> {
    hub.discovered()
        .into_iter()
        .filter(|s| !excluded.contains(&s.ip))
        .collect()
}
