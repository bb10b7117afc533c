use crate::dispatch::Dispatcher;
use crate::engine::AlertEngine;
use crate::{LevelThresholds, ThresholdConfig, ThresholdOverride, TAG_MONITOR_ONLY, TAG_NO_ALERTS};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use pulse_common::types::{
    AlertEvent, AlertEventKind, AlertLevel, ConnectionHealth, Guest, GuestStatus, GuestType,
    NodeStatus, OnlineStatus, Snapshot, UsageGauge,
};
use std::sync::{Arc, Mutex};

fn guest_with_memory(usage: f64, tags: Vec<String>) -> Guest {
    Guest {
        guest_type: GuestType::Qemu,
        vmid: 100,
        node: "pve1".into(),
        instance: "pve1".into(),
        name: "web".into(),
        status: GuestStatus::Running,
        cpu: 0.1,
        cpus: 2,
        memory: UsageGauge {
            used: (usage * 100.0) as u64,
            total: 10_000,
            usage,
        },
        disk: UsageGauge::new(10, 100),
        disk_read: 0.0,
        disk_write: 0.0,
        network_in: 0.0,
        network_out: 0.0,
        uptime: 3600,
        tags,
        meta: Default::default(),
    }
}

fn snapshot_with_memory(usage: f64, tags: Vec<String>, at: DateTime<Utc>) -> Snapshot {
    Snapshot {
        vms: vec![guest_with_memory(usage, tags)],
        generated_at: at,
        ..Default::default()
    }
}

fn memory_config(warning: f64, critical: f64) -> ThresholdConfig {
    ThresholdConfig {
        defaults: crate::Thresholds {
            memory: LevelThresholds::new(warning, critical),
            // Park cpu/disk out of the way so only memory drives events.
            cpu: LevelThresholds::new(1000.0, 1000.0),
            disk: LevelThresholds::new(1000.0, 1000.0),
        },
        ..Default::default()
    }
}

/// The S4 sequence: memory `[40, 92, 93, 91, 95, 70, 60, 55]` against a
/// warning threshold of 90 with 5 points of hysteresis fires on the second
/// sustained over-threshold tick and resolves once the clear window has
/// been below 85 long enough.
#[test]
fn fire_and_clear_follows_hysteresis() {
    let mut engine = AlertEngine::new(memory_config(90.0, 1000.0));
    let start = Utc::now();
    let values = [40.0, 92.0, 93.0, 91.0, 95.0, 70.0, 60.0, 55.0];

    let mut fired_at = None;
    let mut resolved_at = None;
    for (i, value) in values.iter().enumerate() {
        // One evaluation per confirm window so tick N+1 confirms tick N.
        let now = start + Duration::seconds(60 * (i as i64 + 1));
        let eval = engine.evaluate(&snapshot_with_memory(*value, vec![], now), now);
        for event in &eval.events {
            match event.kind {
                AlertEventKind::Fired => fired_at = Some(i + 1),
                AlertEventKind::Resolved => resolved_at = Some(i + 1),
            }
        }
    }

    assert_eq!(fired_at, Some(3), "second sustained over-threshold tick fires");
    assert_eq!(resolved_at, Some(8), "clear confirmed after the clear window");
}

#[test]
fn no_alerts_tag_silences_completely() {
    let mut engine = AlertEngine::new(memory_config(90.0, 1000.0));
    let start = Utc::now();
    let values = [40.0, 92.0, 93.0, 91.0, 95.0, 70.0, 60.0, 55.0];

    let mut total_events = 0;
    for (i, value) in values.iter().enumerate() {
        let now = start + Duration::seconds(60 * (i as i64 + 1));
        let snap = snapshot_with_memory(*value, vec![TAG_NO_ALERTS.into()], now);
        let eval = engine.evaluate(&snap, now);
        total_events += eval.events.len();
        assert!(eval.alerts.is_empty());
    }
    assert_eq!(total_events, 0);
}

#[test]
fn monitor_only_surfaces_alert_but_suppresses_events() {
    let mut engine = AlertEngine::new(memory_config(90.0, 1000.0));
    let start = Utc::now();

    let mut saw_alert = false;
    for i in 0..4 {
        let now = start + Duration::seconds(60 * (i + 1));
        let snap = snapshot_with_memory(95.0, vec![TAG_MONITOR_ONLY.into()], now);
        let eval = engine.evaluate(&snap, now);
        assert!(eval.events.is_empty(), "monitor-only must not notify");
        if let Some(alert) = eval.alerts.first() {
            assert!(alert.suppressed);
            saw_alert = true;
        }
    }
    assert!(saw_alert, "alert still surfaces for the UI");
}

#[test]
fn state_sequence_is_ok_pending_active_clearing_ok() {
    let mut engine = AlertEngine::new(memory_config(90.0, 1000.0));
    let start = Utc::now();

    // Over threshold: first tick is silent (pending), second fires.
    let t1 = start + Duration::seconds(60);
    assert!(engine
        .evaluate(&snapshot_with_memory(95.0, vec![], t1), t1)
        .events
        .is_empty());
    let t2 = start + Duration::seconds(120);
    let eval = engine.evaluate(&snapshot_with_memory(95.0, vec![], t2), t2);
    assert_eq!(eval.events.len(), 1);
    assert_eq!(eval.events[0].kind, AlertEventKind::Fired);

    // Below threshold but inside the hysteresis band: still active.
    let t3 = start + Duration::seconds(180);
    let eval = engine.evaluate(&snapshot_with_memory(87.0, vec![], t3), t3);
    assert!(eval.events.is_empty());
    assert_eq!(eval.alerts.len(), 1);

    // Below threshold minus hysteresis: clearing, silently.
    let t4 = start + Duration::seconds(240);
    let eval = engine.evaluate(&snapshot_with_memory(80.0, vec![], t4), t4);
    assert!(eval.events.is_empty());
    assert_eq!(eval.alerts.len(), 1, "clearing alerts stay visible");

    // Clear window elapses: resolved.
    let t5 = start + Duration::seconds(240 + 120);
    let eval = engine.evaluate(&snapshot_with_memory(80.0, vec![], t5), t5);
    assert_eq!(eval.events.len(), 1);
    assert_eq!(eval.events[0].kind, AlertEventKind::Resolved);
    assert!(eval.alerts.is_empty());
}

#[test]
fn reentry_during_clearing_is_silent() {
    let mut engine = AlertEngine::new(memory_config(90.0, 1000.0));
    let start = Utc::now();
    let mut now = start;
    let mut step = |engine: &mut AlertEngine, value: f64, now: DateTime<Utc>| {
        engine.evaluate(&snapshot_with_memory(value, vec![], now), now).events
    };

    now += Duration::seconds(60);
    step(&mut engine, 95.0, now);
    now += Duration::seconds(60);
    let fired = step(&mut engine, 95.0, now);
    assert_eq!(fired.len(), 1);

    now += Duration::seconds(60);
    assert!(step(&mut engine, 80.0, now).is_empty(), "enter clearing");
    now += Duration::seconds(60);
    assert!(step(&mut engine, 95.0, now).is_empty(), "re-entry is silent");
    now += Duration::seconds(60);
    assert!(step(&mut engine, 95.0, now).is_empty(), "still the same alert");
}

#[test]
fn escalation_renotifies_at_critical() {
    let mut engine = AlertEngine::new(memory_config(80.0, 95.0));
    let start = Utc::now();

    let t1 = start + Duration::seconds(60);
    engine.evaluate(&snapshot_with_memory(85.0, vec![], t1), t1);
    let t2 = start + Duration::seconds(120);
    let eval = engine.evaluate(&snapshot_with_memory(85.0, vec![], t2), t2);
    assert_eq!(eval.events[0].alert.level, AlertLevel::Warning);

    let t3 = start + Duration::seconds(180);
    let eval = engine.evaluate(&snapshot_with_memory(97.0, vec![], t3), t3);
    assert_eq!(eval.events.len(), 1);
    assert_eq!(eval.events[0].alert.level, AlertLevel::Critical);
}

#[test]
fn unhealthy_node_raises_connectivity_alert() {
    let mut engine = AlertEngine::new(ThresholdConfig::default());
    let start = Utc::now();
    let node = NodeStatus {
        name: "pve1".into(),
        status: OnlineStatus::Offline,
        connection_health: ConnectionHealth::Unhealthy,
        ..Default::default()
    };
    let snap = Snapshot {
        nodes: vec![node],
        generated_at: start,
        ..Default::default()
    };

    let t1 = start + Duration::seconds(60);
    assert!(engine.evaluate(&snap, t1).events.is_empty());
    let t2 = start + Duration::seconds(120);
    let eval = engine.evaluate(&snap, t2);
    assert_eq!(eval.events.len(), 1);
    assert_eq!(eval.events[0].alert.level, AlertLevel::Critical);
    assert_eq!(eval.events[0].alert.metric, "offline");
}

#[test]
fn per_resource_override_disables_alerting() {
    let mut config = memory_config(90.0, 1000.0);
    config.overrides.insert(
        "guest/pve1/qemu/100".into(),
        ThresholdOverride {
            disabled: true,
            ..Default::default()
        },
    );
    let mut engine = AlertEngine::new(config);
    let start = Utc::now();
    for i in 0..4 {
        let now = start + Duration::seconds(60 * (i + 1));
        let eval = engine.evaluate(&snapshot_with_memory(99.0, vec![], now), now);
        assert!(eval.events.is_empty());
        assert!(eval.alerts.is_empty());
    }
}

// ---- dispatch ----

struct RecordingNotifier {
    delivered: Arc<Mutex<Vec<AlertEvent>>>,
    failures_remaining: Mutex<u32>,
}

#[async_trait]
impl pulse_notify::Notifier for RecordingNotifier {
    fn name(&self) -> &str {
        "recording"
    }

    async fn notify(&self, event: &AlertEvent) -> anyhow::Result<()> {
        {
            let mut failures = self.failures_remaining.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                anyhow::bail!("induced failure");
            }
        }
        self.delivered.lock().unwrap().push(event.clone());
        Ok(())
    }
}

fn fired_event(resource: &str) -> AlertEvent {
    AlertEvent {
        kind: AlertEventKind::Fired,
        alert: pulse_common::types::Alert {
            id: pulse_common::id::alert_id(resource, "memory", "warning"),
            resource_id: resource.into(),
            resource_name: "web".into(),
            metric: "memory".into(),
            threshold: 90.0,
            value: 95.0,
            level: AlertLevel::Warning,
            first_seen: Utc::now(),
            last_seen: Utc::now(),
            acknowledged: false,
            suppressed: false,
            message: "web memory at 95.0% (threshold 90%)".into(),
        },
        count: 1,
        timestamp: Utc::now(),
    }
}

#[tokio::test(start_paused = true)]
async fn delivery_retries_until_success() {
    let delivered = Arc::new(Mutex::new(Vec::new()));
    let notifier = Arc::new(RecordingNotifier {
        delivered: delivered.clone(),
        failures_remaining: Mutex::new(2),
    });
    let (dispatcher, handle) = Dispatcher::spawn(vec![notifier]);

    dispatcher.enqueue(fired_event("guest/pve1/qemu/100"));
    drop(dispatcher);
    handle.await.unwrap();

    assert_eq!(delivered.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_increment_drop_counter() {
    let delivered = Arc::new(Mutex::new(Vec::new()));
    let notifier = Arc::new(RecordingNotifier {
        delivered: delivered.clone(),
        failures_remaining: Mutex::new(u32::MAX),
    });
    let (dispatcher, handle) = Dispatcher::spawn(vec![notifier]);

    dispatcher.enqueue(fired_event("guest/pve1/qemu/100"));
    // Let the drain task burn through its attempt budget before closing.
    tokio::time::sleep(std::time::Duration::from_secs(600)).await;
    assert_eq!(dispatcher.dropped_events(), 1);
    assert!(delivered.lock().unwrap().is_empty());

    drop(dispatcher);
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn repeats_within_window_coalesce_with_count() {
    let delivered = Arc::new(Mutex::new(Vec::new()));
    let notifier = Arc::new(RecordingNotifier {
        delivered: delivered.clone(),
        failures_remaining: Mutex::new(0),
    });
    let (dispatcher, handle) = Dispatcher::spawn(vec![notifier]);

    dispatcher.enqueue(fired_event("guest/pve1/qemu/100"));
    dispatcher.enqueue(fired_event("guest/pve1/qemu/100"));
    dispatcher.enqueue(fired_event("guest/pve1/qemu/100"));
    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    drop(dispatcher);
    handle.await.unwrap();

    let delivered = delivered.lock().unwrap();
    assert_eq!(delivered.len(), 2, "first immediate, repeats coalesced");
    assert_eq!(delivered[0].count, 1);
    assert_eq!(delivered[1].count, 2);
}
