//! The poll/merge engine: one supervisor, one worker per node.
//!
//! Workers publish [`PartialSnapshot`]s into a channel; the supervisor
//! buffers the last one per worker, coalesces bursts within a 500 ms
//! window, assembles a single deterministic [`Snapshot`], runs the alert
//! engine, records history, and hands the result to the hub.

pub mod endpoints;
pub mod rates;
pub mod worker;

pub use rates::RateCache;
pub use worker::{NodeWorker, PartialSnapshot};

use crate::bus::{ConfigBus, ConfigEvent};
use crate::hub::StateHub;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use pulse_alert::dispatch::Dispatcher;
use pulse_alert::engine::AlertEngine;
use pulse_common::types::{NodeConfig, Snapshot};
use pulse_store::HistoryRing;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

/// Bursts of worker output inside this window collapse into one publish.
const COALESCE_MS: u64 = 500;

pub struct Supervisor {
    tick: std::time::Duration,
    default_timeout_secs: u64,
    rates: Arc<RateCache>,
    hub: Arc<StateHub>,
    history: Arc<Mutex<HistoryRing>>,
    engine: Arc<Mutex<AlertEngine>>,
    dispatcher: Dispatcher,
    /// Keeps the bus sender alive so `bus_rx` cannot observe `Closed`
    /// while the supervisor runs.
    _bus: ConfigBus,
    bus_rx: broadcast::Receiver<ConfigEvent>,
    shutdown: watch::Receiver<bool>,
    part_tx: mpsc::Sender<PartialSnapshot>,
    part_rx: mpsc::Receiver<PartialSnapshot>,
    workers: HashMap<String, JoinHandle<()>>,
    parts: HashMap<String, PartialSnapshot>,
    last_generated: DateTime<Utc>,
}

impl Supervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tick: std::time::Duration,
        default_timeout_secs: u64,
        rates: Arc<RateCache>,
        hub: Arc<StateHub>,
        history: Arc<Mutex<HistoryRing>>,
        engine: Arc<Mutex<AlertEngine>>,
        dispatcher: Dispatcher,
        bus: ConfigBus,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (part_tx, part_rx) = mpsc::channel(64);
        let bus_rx = bus.subscribe();
        Self {
            tick,
            default_timeout_secs,
            rates,
            hub,
            history,
            engine,
            dispatcher,
            _bus: bus,
            bus_rx,
            shutdown,
            part_tx,
            part_rx,
            workers: HashMap::new(),
            parts: HashMap::new(),
            last_generated: DateTime::<Utc>::MIN_UTC,
        }
    }

    pub async fn run(mut self, initial: Vec<NodeConfig>) {
        for node in initial {
            self.start_worker(node);
        }
        tracing::info!(
            workers = self.workers.len(),
            tick_secs = self.tick.as_secs(),
            "poll supervisor started"
        );

        loop {
            tokio::select! {
                maybe = self.part_rx.recv() => {
                    let Some(part) = maybe else { break };
                    self.buffer(part);
                    self.coalesce_window().await;
                    self.publish();
                }
                result = self.bus_rx.recv() => match result {
                    Ok(event) => self.reconcile(event),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(missed = n, "config bus lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {}
                },
                _ = self.shutdown.changed() => break,
            }
        }

        for (id, handle) in self.workers.drain() {
            tracing::debug!(node_id = %id, "stopping worker");
            handle.abort();
        }
        tracing::info!("poll supervisor stopped");
    }

    fn buffer(&mut self, part: PartialSnapshot) {
        self.parts.insert(part.node_id.clone(), part);
    }

    /// Keep absorbing worker output until the coalescing window closes.
    async fn coalesce_window(&mut self) {
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_millis(COALESCE_MS);
        loop {
            match tokio::time::timeout_at(deadline, self.part_rx.recv()).await {
                Ok(Some(part)) => self.buffer(part),
                Ok(None) | Err(_) => break,
            }
        }
    }

    fn publish(&mut self) {
        let now = Utc::now();
        let generated_at = if now <= self.last_generated {
            self.last_generated + ChronoDuration::milliseconds(1)
        } else {
            now
        };
        self.last_generated = generated_at;

        let mut snapshot = assemble(self.parts.values().cloned().collect(), generated_at);

        let evaluation = {
            let mut engine = self.engine.lock().unwrap_or_else(|p| p.into_inner());
            engine.evaluate(&snapshot, generated_at)
        };
        snapshot.alerts = evaluation.alerts;
        for event in evaluation.events {
            self.dispatcher.enqueue(event);
        }

        self.history
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .record_snapshot(&snapshot);

        self.hub.publish(snapshot);
    }

    fn reconcile(&mut self, event: ConfigEvent) {
        match event {
            ConfigEvent::NodeAdded(node) => {
                tracing::info!(node = %node.name, "starting worker for new node");
                self.start_worker(node);
            }
            ConfigEvent::NodeRemoved(id) => {
                if let Some(handle) = self.workers.remove(&id) {
                    handle.abort();
                }
                self.parts.remove(&id);
                tracing::info!(node_id = %id, "worker cancelled");
                self.publish();
            }
            ConfigEvent::NodeUpdated(node) => {
                // Credential or endpoint changes need a full teardown; the
                // replacement worker starts from a clean failover state.
                if let Some(handle) = self.workers.remove(&node.id) {
                    handle.abort();
                }
                self.parts.remove(&node.id);
                tracing::info!(node = %node.name, "worker restarted after config change");
                self.start_worker(node);
            }
        }
    }

    fn start_worker(&mut self, mut node: NodeConfig) {
        node.timeout_secs = node.timeout_secs.or(Some(self.default_timeout_secs));
        let id = node.id.clone();
        let worker = NodeWorker::new(node, self.tick, self.rates.clone(), self.part_tx.clone());
        self.workers.insert(id, tokio::spawn(worker.run()));
    }
}

/// Merge buffered partial snapshots into one deterministic snapshot:
/// stable entity ordering and PBS backups deduplicated by
/// `(vmid, backup_time)` with the direct PBS record winning.
pub fn assemble(parts: Vec<PartialSnapshot>, generated_at: DateTime<Utc>) -> Snapshot {
    let mut snapshot = Snapshot {
        generated_at,
        ..Default::default()
    };

    let mut parts = parts;
    parts.sort_by(|a, b| a.instance.cmp(&b.instance));
    for part in parts {
        worker::into_snapshot_parts(part, &mut snapshot);
    }

    snapshot.nodes.sort_by(|a, b| a.name.cmp(&b.name));
    snapshot
        .vms
        .sort_by(|a, b| (&a.instance, a.vmid).cmp(&(&b.instance, b.vmid)));
    snapshot
        .containers
        .sort_by(|a, b| (&a.instance, a.vmid).cmp(&(&b.instance, b.vmid)));
    snapshot.storage.sort_by(|a, b| a.id.cmp(&b.id));
    snapshot.pbs_instances.sort_by(|a, b| a.name.cmp(&b.name));

    // PBS backups: one record per (vmid, backup_time) across instances.
    let mut seen: HashSet<(u64, i64)> = HashSet::new();
    snapshot.pbs_backups.retain(|b| seen.insert(b.dedup_key()));
    snapshot.pbs_backups.sort_by_key(|b| (b.vmid, b.backup_time));

    // A PBS-backed archive also visible through a PVE storage listing is
    // the same backup; the direct PBS record is authoritative.
    snapshot
        .pve_backups
        .storage_backups
        .retain(|b| !(b.backup_type == pulse_common::types::BackupKind::Remote
            && seen.contains(&b.dedup_key())));
    snapshot
        .pve_backups
        .storage_backups
        .sort_by_key(|b| (b.vmid, b.backup_time));
    snapshot
        .pve_backups
        .guest_snapshots
        .sort_by(|a, b| (&a.node, a.vmid, &a.name).cmp(&(&b.node, b.vmid, &b.name)));

    snapshot
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_common::types::{BackupKind, BackupRecord, GuestType};

    fn pve_remote_backup(vmid: u64, time: i64) -> BackupRecord {
        BackupRecord {
            backup_type: BackupKind::Remote,
            vmid,
            guest_type: GuestType::Qemu,
            node: "pve1".into(),
            backup_time: time,
            size_bytes: Some(1000),
            storage: Some("backup-01".into()),
            datastore: None,
            namespace: None,
            verified: None,
            protected: false,
            encrypted: None,
            owner: None,
            notes: None,
        }
    }

    fn pbs_backup(vmid: u64, time: i64, namespace: Option<&str>) -> BackupRecord {
        BackupRecord {
            backup_type: BackupKind::Remote,
            vmid,
            guest_type: GuestType::Qemu,
            node: "pbs1".into(),
            backup_time: time,
            size_bytes: Some(1000),
            storage: None,
            datastore: Some("backup-01".into()),
            namespace: namespace.map(str::to_string),
            verified: Some(true),
            protected: false,
            encrypted: None,
            owner: None,
            notes: None,
        }
    }

    #[test]
    fn pbs_backup_seen_from_both_sides_is_one_record() {
        let mut pve_part = PartialSnapshot::default();
        pve_part.node_id = "n1".into();
        pve_part.instance = "pve1".into();
        pve_part
            .pve_backups
            .storage_backups
            .push(pve_remote_backup(101, 1_700_000_000));

        let mut pbs_part = PartialSnapshot::default();
        pbs_part.node_id = "n2".into();
        pbs_part.instance = "pbs1".into();
        pbs_part
            .pbs_backups
            .push(pbs_backup(101, 1_700_000_000, Some("prod")));

        let snapshot = assemble(vec![pve_part, pbs_part], Utc::now());
        assert_eq!(snapshot.pbs_backups.len(), 1);
        assert!(snapshot.pve_backups.storage_backups.is_empty());
        assert_eq!(
            snapshot.pbs_backups[0].namespace.as_deref(),
            Some("prod"),
            "PBS-side record wins, namespace preserved"
        );
    }

    #[test]
    fn local_backups_are_never_deduplicated_against_pbs() {
        let mut pve_part = PartialSnapshot::default();
        pve_part.node_id = "n1".into();
        pve_part.instance = "pve1".into();
        let mut local = pve_remote_backup(101, 1_700_000_000);
        local.backup_type = BackupKind::Local;
        local.storage = Some("local-zfs".into());
        pve_part.pve_backups.storage_backups.push(local);

        let mut pbs_part = PartialSnapshot::default();
        pbs_part.node_id = "n2".into();
        pbs_part.instance = "pbs1".into();
        pbs_part.pbs_backups.push(pbs_backup(101, 1_700_000_000, None));

        let snapshot = assemble(vec![pve_part, pbs_part], Utc::now());
        assert_eq!(snapshot.pbs_backups.len(), 1);
        assert_eq!(snapshot.pve_backups.storage_backups.len(), 1);
    }

    #[test]
    fn entities_sort_deterministically() {
        let mut a = PartialSnapshot::default();
        a.node_id = "n1".into();
        a.instance = "zeta".into();
        let mut b = PartialSnapshot::default();
        b.node_id = "n2".into();
        b.instance = "alpha".into();

        let s1 = assemble(vec![a.clone(), b.clone()], Utc::now());
        let s2 = assemble(vec![b, a], Utc::now());
        assert_eq!(
            serde_json::to_string(&s1.nodes).unwrap(),
            serde_json::to_string(&s2.nodes).unwrap()
        );
    }
}
