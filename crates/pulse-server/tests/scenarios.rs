//! End-to-end poll scenarios against a stub upstream: standalone node,
//! cluster discovery, and endpoint failover.

use pulse_alert::dispatch::Dispatcher;
use pulse_alert::engine::AlertEngine;
use pulse_alert::ThresholdConfig;
use pulse_common::types::{
    Capabilities, ConnectionHealth, NodeConfig, NodeKind, OnlineStatus, Snapshot,
};
use pulse_server::bus::ConfigBus;
use pulse_server::hub::StateHub;
use pulse_server::poller::{RateCache, Supervisor};
use pulse_store::HistoryRing;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn node_config(url: &str, name: &str) -> NodeConfig {
    NodeConfig {
        id: format!("test-{name}"),
        kind: NodeKind::Pve,
        name: name.to_string(),
        url: url.to_string(),
        user: None,
        password: None,
        token_name: Some("monitor@pam!pulse".into()),
        token_secret: Some("s3cret".into()),
        verify_tls: false,
        capabilities: Capabilities::default(),
        timeout_secs: Some(2),
        cluster_name: None,
        cluster_endpoints: Vec::new(),
    }
}

struct Harness {
    hub: Arc<StateHub>,
    shutdown: watch::Sender<bool>,
}

fn start_engine(nodes: Vec<NodeConfig>) -> Harness {
    let (dispatcher, _drain) = Dispatcher::spawn(Vec::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let hub = StateHub::new();
    let bus = ConfigBus::new();
    let supervisor = Supervisor::new(
        Duration::from_millis(200),
        2,
        Arc::new(RateCache::new()),
        hub.clone(),
        Arc::new(Mutex::new(HistoryRing::default())),
        Arc::new(Mutex::new(AlertEngine::new(ThresholdConfig::default()))),
        dispatcher,
        bus,
        shutdown_rx,
    );
    tokio::spawn(supervisor.run(nodes));
    Harness {
        hub,
        shutdown: shutdown_tx,
    }
}

async fn next_snapshot(sub: &pulse_server::hub::Subscription) -> Arc<Snapshot> {
    tokio::time::timeout(Duration::from_secs(10), sub.recv())
        .await
        .expect("snapshot within deadline")
        .expect("subscription open")
}

async fn mount_standalone_cluster_status(server: &MockServer, name: &str) {
    Mock::given(method("GET"))
        .and(path("/api2/json/cluster/status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": [
                {"type": "node", "name": name, "ip": "127.0.0.1", "online": 1, "local": 1, "id": format!("node/{name}")}
            ]
        })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn standalone_node_produces_first_snapshot() {
    let server = MockServer::start().await;
    mount_standalone_cluster_status(&server, "pve1").await;
    Mock::given(method("GET"))
        .and(path("/api2/json/nodes"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": [{"node": "pve1", "status": "online", "cpu": 0.12,
                      "mem": 4096, "maxmem": 8192, "disk": 100, "maxdisk": 1000,
                      "uptime": 3600}]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api2/json/nodes/pve1/qemu"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": [
                {"vmid": 100, "name": "web", "status": "running", "cpu": 0.5, "cpus": 2,
                 "mem": 1024, "maxmem": 2048, "uptime": 100,
                 "diskread": 0, "diskwrite": 0, "netin": 0, "netout": 0},
                {"vmid": 101, "name": "db", "status": "running", "cpu": 0.1, "cpus": 4,
                 "mem": 2048, "maxmem": 4096, "uptime": 100,
                 "diskread": 0, "diskwrite": 0, "netin": 0, "netout": 0}
            ]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api2/json/nodes/pve1/lxc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": [{"vmid": "200", "name": "cache", "status": "stopped"}]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api2/json/nodes/pve1/storage"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": []})))
        .mount(&server)
        .await;

    let harness = start_engine(vec![node_config(&server.uri(), "pve1")]);
    let sub = harness.hub.subscribe();

    let snapshot = next_snapshot(&sub).await;
    assert_eq!(snapshot.nodes.len(), 1);
    assert_eq!(snapshot.nodes[0].status, OnlineStatus::Online);
    assert_eq!(snapshot.vms.len(), 2);
    assert_eq!(snapshot.containers.len(), 1);
    assert_eq!(snapshot.vms[0].vmid, 100, "deterministic ordering");
    assert!(snapshot.vms[0].cpu >= 0.0 && snapshot.vms[0].cpu <= 1.0);
    assert!(snapshot.nodes[0].cluster_name.is_none());

    let _ = harness.shutdown.send(true);
}

#[tokio::test]
async fn cluster_membership_is_discovered_and_stamped() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api2/json/cluster/status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": [
                {"type": "cluster", "name": "prod", "nodes": 3},
                {"type": "node", "name": "pve-a", "ip": "10.0.0.10", "online": 1, "id": "node/pve-a"},
                {"type": "node", "name": "pve-b", "ip": "10.0.0.11", "online": 1, "id": "node/pve-b"},
                {"type": "node", "name": "pve-c", "ip": "10.0.0.12", "online": 1, "id": "node/pve-c"}
            ]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api2/json/nodes"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": [
                {"node": "pve-a", "status": "online", "cpu": 0.1, "uptime": 100},
                {"node": "pve-b", "status": "online", "cpu": 0.2, "uptime": 100},
                {"node": "pve-c", "status": "online", "cpu": 0.3, "uptime": 100}
            ]
        })))
        .mount(&server)
        .await;

    let harness = start_engine(vec![node_config(&server.uri(), "pve-a")]);
    let sub = harness.hub.subscribe();

    let snapshot = next_snapshot(&sub).await;
    assert_eq!(snapshot.nodes.len(), 3);
    for node in &snapshot.nodes {
        assert_eq!(node.cluster_name.as_deref(), Some("prod"));
        assert!(node.is_cluster_member);
        assert_eq!(node.cluster_endpoints.len(), 3);
    }

    let _ = harness.shutdown.send(true);
}

#[tokio::test]
async fn failing_entry_endpoint_fails_over_to_cluster_member() {
    let server_a = MockServer::start().await;
    let server_b = MockServer::start().await;

    // Cluster membership is served by A; its resource listing is down.
    Mock::given(method("GET"))
        .and(path("/api2/json/cluster/status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": [
                {"type": "cluster", "name": "prod", "nodes": 2},
                {"type": "node", "name": "pve-a", "ip": server_a.uri(), "online": 1, "id": "node/pve-a"},
                {"type": "node", "name": "pve-b", "ip": server_b.uri(), "online": 1, "id": "node/pve-b"}
            ]
        })))
        .mount(&server_a)
        .await;
    Mock::given(method("GET"))
        .and(path("/api2/json/nodes"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server_a)
        .await;

    Mock::given(method("GET"))
        .and(path("/api2/json/nodes"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": [
                {"node": "pve-a", "status": "online", "cpu": 0.1, "uptime": 100},
                {"node": "pve-b", "status": "online", "cpu": 0.2, "uptime": 100}
            ]
        })))
        .mount(&server_b)
        .await;

    let harness = start_engine(vec![node_config(&server_a.uri(), "pve-a")]);
    let sub = harness.hub.subscribe();

    // First successful poll went through B after A failed.
    let snapshot = next_snapshot(&sub).await;
    let pve_a = snapshot.nodes.iter().find(|n| n.name == "pve-a").unwrap();
    let pve_b = snapshot.nodes.iter().find(|n| n.name == "pve-b").unwrap();
    assert_eq!(pve_a.connection_health, ConnectionHealth::Degraded);
    assert_eq!(pve_b.connection_health, ConnectionHealth::Healthy);

    // The next tick starts at B directly, so pve-a is no longer marked
    // degraded by a failed attempt.
    let mut healthy_seen = false;
    for _ in 0..5 {
        let snapshot = next_snapshot(&sub).await;
        let pve_a = snapshot.nodes.iter().find(|n| n.name == "pve-a").unwrap();
        if pve_a.connection_health == ConnectionHealth::Healthy {
            healthy_seen = true;
            break;
        }
    }
    assert!(healthy_seen, "preferred endpoint moved to pve-b");

    let _ = harness.shutdown.send(true);
}
