//! Per-(resource, metric) alert evaluation with hysteresis.
//!
//! State machine: `ok → pending → active → clearing → ok`. The
//! `ok→pending` and `clearing→ok` edges are silent; `pending→active`
//! emits `fired`, the final `clearing→ok` edge emits `resolved`.

use crate::{ThresholdConfig, TAG_MONITOR_ONLY};
use chrono::{DateTime, Duration, Utc};
use pulse_common::id::alert_id;
use pulse_common::types::{
    Alert, AlertEvent, AlertEventKind, AlertLevel, ConnectionHealth, GuestStatus, Snapshot,
};
use std::collections::{HashMap, HashSet};

/// One metric reading ready for evaluation, thresholds already resolved.
struct Sample {
    resource_id: String,
    resource_name: String,
    metric: String,
    value: f64,
    warning: f64,
    critical: f64,
    monitor_only: bool,
}

enum MetricState {
    Pending {
        since: DateTime<Utc>,
    },
    Active {
        alert: Alert,
    },
    Clearing {
        since: DateTime<Utc>,
        alert: Alert,
    },
}

/// Result of evaluating one snapshot.
pub struct Evaluation {
    /// Alerts to surface in the snapshot (active + clearing).
    pub alerts: Vec<Alert>,
    /// Events for the dispatcher. Already filtered for suppression.
    pub events: Vec<AlertEvent>,
}

pub struct AlertEngine {
    config: ThresholdConfig,
    states: HashMap<(String, String), MetricState>,
    acknowledged: HashSet<String>,
}

impl AlertEngine {
    pub fn new(config: ThresholdConfig) -> Self {
        Self {
            config,
            states: HashMap::new(),
            acknowledged: HashSet::new(),
        }
    }

    pub fn config(&self) -> &ThresholdConfig {
        &self.config
    }

    /// Swap in a new threshold config. Existing alert states survive; tag
    /// and threshold changes take effect on the next evaluation.
    pub fn update_config(&mut self, config: ThresholdConfig) {
        self.config = config;
    }

    /// Mark an alert acknowledged by its stable ID. Returns false when no
    /// such alert is active.
    pub fn acknowledge(&mut self, alert_id: &str) -> bool {
        let known = self.states.values().any(|s| match s {
            MetricState::Active { alert } | MetricState::Clearing { alert, .. } => {
                alert.id == alert_id
            }
            MetricState::Pending { .. } => false,
        });
        if known {
            self.acknowledged.insert(alert_id.to_string());
        }
        known
    }

    /// Evaluate one snapshot. Call once per publish, in publish order.
    pub fn evaluate(&mut self, snapshot: &Snapshot, now: DateTime<Utc>) -> Evaluation {
        let samples = self.collect_samples(snapshot);
        let mut events = Vec::new();
        let mut seen = HashSet::with_capacity(samples.len());

        for sample in &samples {
            let key = (sample.resource_id.clone(), sample.metric.clone());
            seen.insert(key.clone());
            self.step(key, sample, now, &mut events);
        }

        // A resource that vanished from the snapshot takes its alert state
        // with it; the grace handling for offline nodes happens upstream in
        // the poll engine, so by the time an entity is gone here it is gone.
        self.states.retain(|key, _| seen.contains(key));

        let mut alerts: Vec<Alert> = self
            .states
            .values()
            .filter_map(|s| match s {
                MetricState::Active { alert } | MetricState::Clearing { alert, .. } => {
                    let mut alert = alert.clone();
                    alert.acknowledged = self.acknowledged.contains(&alert.id);
                    Some(alert)
                }
                MetricState::Pending { .. } => None,
            })
            .collect();
        alerts.sort_by(|a, b| a.resource_id.cmp(&b.resource_id).then(a.metric.cmp(&b.metric)));

        let live: HashSet<&str> = alerts.iter().map(|a| a.id.as_str()).collect();
        self.acknowledged.retain(|id| live.contains(id.as_str()));

        Evaluation { alerts, events }
    }

    fn step(
        &mut self,
        key: (String, String),
        sample: &Sample,
        now: DateTime<Utc>,
        events: &mut Vec<AlertEvent>,
    ) {
        let target = target_level(sample);
        let hysteresis = self.config.hysteresis_for(&sample.metric, sample.warning);
        let confirm = Duration::seconds(self.config.confirm_secs as i64);
        let clear = Duration::seconds(self.config.clear_secs as i64);

        let state = self.states.remove(&key);
        let next = match state {
            None => target.map(|_| MetricState::Pending { since: now }),
            Some(MetricState::Pending { since }) => match target {
                None => None,
                Some(level) if now - since >= confirm => {
                    let alert = self.make_alert(sample, level, now);
                    if !sample.monitor_only {
                        events.push(AlertEvent {
                            kind: AlertEventKind::Fired,
                            alert: alert.clone(),
                            count: 1,
                            timestamp: now,
                        });
                    }
                    Some(MetricState::Active { alert })
                }
                Some(_) => Some(MetricState::Pending { since }),
            },
            Some(MetricState::Active { mut alert }) => {
                if sample.value < sample.warning - hysteresis {
                    alert.value = sample.value;
                    alert.last_seen = now;
                    Some(MetricState::Clearing { since: now, alert })
                } else {
                    // Escalation replaces the alert identity and re-notifies;
                    // downgrades hold the level until the metric clears fully.
                    if let Some(level) = target {
                        if level > alert.level {
                            alert = self.make_alert(sample, level, alert.first_seen);
                            if !sample.monitor_only {
                                events.push(AlertEvent {
                                    kind: AlertEventKind::Fired,
                                    alert: alert.clone(),
                                    count: 1,
                                    timestamp: now,
                                });
                            }
                        }
                    }
                    alert.value = sample.value;
                    alert.last_seen = now;
                    alert.message = alert_message(sample, alert.level);
                    Some(MetricState::Active { alert })
                }
            }
            Some(MetricState::Clearing { since, mut alert }) => {
                if sample.value >= sample.warning {
                    alert.value = sample.value;
                    alert.last_seen = now;
                    Some(MetricState::Active { alert })
                } else if now - since >= clear {
                    alert.value = sample.value;
                    alert.last_seen = now;
                    if !sample.monitor_only {
                        events.push(AlertEvent {
                            kind: AlertEventKind::Resolved,
                            alert,
                            count: 1,
                            timestamp: now,
                        });
                    }
                    None
                } else {
                    alert.value = sample.value;
                    alert.last_seen = now;
                    Some(MetricState::Clearing { since, alert })
                }
            }
        };

        if let Some(next) = next {
            self.states.insert(key, next);
        }
    }

    fn make_alert(&self, sample: &Sample, level: AlertLevel, first_seen: DateTime<Utc>) -> Alert {
        let threshold = match level {
            AlertLevel::Warning => sample.warning,
            AlertLevel::Critical => sample.critical,
        };
        Alert {
            id: alert_id(&sample.resource_id, &sample.metric, &level.to_string()),
            resource_id: sample.resource_id.clone(),
            resource_name: sample.resource_name.clone(),
            metric: sample.metric.clone(),
            threshold,
            value: sample.value,
            level,
            first_seen,
            last_seen: first_seen,
            acknowledged: false,
            suppressed: sample.monitor_only,
            message: alert_message(sample, level),
        }
    }

    fn collect_samples(&self, snapshot: &Snapshot) -> Vec<Sample> {
        let mut samples = Vec::new();

        for node in &snapshot.nodes {
            let resource_id = format!("node/{}", node.name);
            for (metric, value) in [
                ("cpu", node.cpu * 100.0),
                ("memory", node.memory.usage),
                ("disk", node.disk.usage),
            ] {
                if let Some(t) = self.config.effective(&resource_id, metric, &[]) {
                    samples.push(Sample {
                        resource_id: resource_id.clone(),
                        resource_name: node.name.clone(),
                        metric: metric.to_string(),
                        value,
                        warning: t.warning,
                        critical: t.critical,
                        monitor_only: false,
                    });
                }
            }

            // Unreachable nodes fire a critical connectivity alert through
            // the same machinery: 100 when unhealthy, 0 once recovered.
            if self.config.effective(&resource_id, "disk", &[]).is_some() {
                let down = node.connection_health == ConnectionHealth::Unhealthy;
                samples.push(Sample {
                    resource_id: resource_id.clone(),
                    resource_name: node.name.clone(),
                    metric: "offline".to_string(),
                    value: if down { 100.0 } else { 0.0 },
                    warning: 50.0,
                    critical: 50.0,
                    monitor_only: false,
                });
            }
        }

        for guest in snapshot.vms.iter().chain(snapshot.containers.iter()) {
            if guest.status != GuestStatus::Running {
                continue;
            }
            let resource_id = format!(
                "guest/{}/{}/{}",
                guest.instance, guest.guest_type, guest.vmid
            );
            let monitor_only = guest.tags.iter().any(|t| t == TAG_MONITOR_ONLY);
            for (metric, value) in [
                ("cpu", guest.cpu * 100.0),
                ("memory", guest.memory.usage),
                ("disk", guest.disk.usage),
            ] {
                if let Some(t) = self.config.effective(&resource_id, metric, &guest.tags) {
                    samples.push(Sample {
                        resource_id: resource_id.clone(),
                        resource_name: guest.name.clone(),
                        metric: metric.to_string(),
                        value,
                        warning: t.warning,
                        critical: t.critical,
                        monitor_only,
                    });
                }
            }
        }

        for pbs in &snapshot.pbs_instances {
            for ds in &pbs.datastores {
                let resource_id = format!("pbs/{}/datastore/{}", pbs.name, ds.name);
                if let Some(t) = self.config.effective(&resource_id, "disk", &[]) {
                    samples.push(Sample {
                        resource_id,
                        resource_name: format!("{}/{}", pbs.name, ds.name),
                        metric: "disk".to_string(),
                        value: ds.usage,
                        warning: t.warning,
                        critical: t.critical,
                        monitor_only: false,
                    });
                }
            }
        }

        samples
    }
}

fn target_level(sample: &Sample) -> Option<AlertLevel> {
    if sample.value >= sample.critical {
        Some(AlertLevel::Critical)
    } else if sample.value >= sample.warning {
        Some(AlertLevel::Warning)
    } else {
        None
    }
}

fn alert_message(sample: &Sample, level: AlertLevel) -> String {
    if sample.metric == "offline" {
        return format!("{} is unreachable", sample.resource_name);
    }
    let threshold = match level {
        AlertLevel::Warning => sample.warning,
        AlertLevel::Critical => sample.critical,
    };
    format!(
        "{} {} at {:.1}% (threshold {:.0}%)",
        sample.resource_name, sample.metric, sample.value, threshold
    )
}
