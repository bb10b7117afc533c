//! Threshold-based alerting with hysteresis and suppression.
//!
//! The [`engine::AlertEngine`] consumes each published snapshot, walks every
//! guest/node/datastore through a per-(resource, metric) state machine, and
//! emits `fired`/`resolved` events. The [`dispatch::Dispatcher`] groups and
//! delivers those events to notifiers at-least-once.

pub mod dispatch;
pub mod engine;

#[cfg(test)]
mod tests;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Guest tags recognized by the engine (case-sensitive, from upstream
/// metadata).
pub const TAG_NO_ALERTS: &str = "pulse-no-alerts";
pub const TAG_MONITOR_ONLY: &str = "pulse-monitor-only";
pub const TAG_RELAXED: &str = "pulse-relaxed";

/// Warning/critical pair for one metric, in percent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelThresholds {
    pub warning: f64,
    pub critical: f64,
}

impl LevelThresholds {
    pub const fn new(warning: f64, critical: f64) -> Self {
        Self { warning, critical }
    }
}

/// Global threshold defaults.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Thresholds {
    pub cpu: LevelThresholds,
    pub memory: LevelThresholds,
    pub disk: LevelThresholds,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            cpu: LevelThresholds::new(85.0, 95.0),
            memory: LevelThresholds::new(85.0, 95.0),
            disk: LevelThresholds::new(85.0, 95.0),
        }
    }
}

/// Per-resource override; keys into [`ThresholdConfig::overrides`] are
/// resource IDs or glob patterns over them.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ThresholdOverride {
    pub cpu: Option<LevelThresholds>,
    pub memory: Option<LevelThresholds>,
    pub disk: Option<LevelThresholds>,
    /// Disables alerting for matching resources entirely.
    pub disabled: bool,
}

/// Effective alerting configuration: defaults, overrides, and the
/// hysteresis timing knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ThresholdConfig {
    pub defaults: Thresholds,
    pub overrides: HashMap<String, ThresholdOverride>,
    /// A metric must stay beyond its threshold this long before firing.
    pub confirm_secs: u64,
    /// A metric must stay below threshold minus hysteresis this long
    /// before clearing.
    pub clear_secs: u64,
    /// Hysteresis gap in percentage points for % metrics.
    pub hysteresis_pct: f64,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            defaults: Thresholds::default(),
            overrides: HashMap::new(),
            confirm_secs: 60,
            clear_secs: 120,
            hysteresis_pct: 5.0,
        }
    }
}

impl ThresholdConfig {
    /// Effective thresholds for one metric of one resource:
    /// per-resource override > per-tag override > global default.
    /// Returns `None` when alerting is disabled for the resource.
    pub fn effective(
        &self,
        resource_id: &str,
        metric: &str,
        tags: &[String],
    ) -> Option<LevelThresholds> {
        if tags.iter().any(|t| t == TAG_NO_ALERTS) {
            return None;
        }

        let base = match metric {
            "cpu" => self.defaults.cpu,
            "memory" => self.defaults.memory,
            _ => self.defaults.disk,
        };

        let mut effective = if tags.iter().any(|t| t == TAG_RELAXED) {
            let warning = if metric == "disk" { 98.0 } else { 95.0 };
            LevelThresholds::new(warning, base.critical.max(warning))
        } else {
            base
        };

        // Exact override first, then glob patterns.
        let matched = self.overrides.get(resource_id).copied().or_else(|| {
            self.overrides
                .iter()
                .find(|(pattern, _)| glob_match::glob_match(pattern, resource_id))
                .map(|(_, o)| *o)
        });
        if let Some(o) = matched {
            if o.disabled {
                return None;
            }
            let pick = match metric {
                "cpu" => o.cpu,
                "memory" => o.memory,
                _ => o.disk,
            };
            if let Some(t) = pick {
                effective = t;
            }
        }

        Some(effective)
    }

    /// Hysteresis gap for clearing: a fixed percentage-point band for %
    /// metrics, 10% of the threshold for rate metrics.
    pub fn hysteresis_for(&self, metric: &str, threshold: f64) -> f64 {
        if metric.ends_with("Rate") || metric.ends_with("_rate") {
            threshold * 0.10
        } else {
            self.hysteresis_pct
        }
    }
}

#[cfg(test)]
mod config_tests {
    use super::*;

    #[test]
    fn override_beats_tag_beats_default() {
        let mut config = ThresholdConfig::default();
        config.overrides.insert(
            "guest/prod/qemu/100".into(),
            ThresholdOverride {
                memory: Some(LevelThresholds::new(70.0, 80.0)),
                ..Default::default()
            },
        );

        let tags = vec![TAG_RELAXED.to_string()];
        // Override wins even with the relaxed tag present.
        let t = config
            .effective("guest/prod/qemu/100", "memory", &tags)
            .unwrap();
        assert_eq!(t.warning, 70.0);

        // Relaxed tag raises the default for an un-overridden resource.
        let t = config.effective("guest/prod/qemu/101", "memory", &tags).unwrap();
        assert_eq!(t.warning, 95.0);
        let t = config.effective("guest/prod/qemu/101", "disk", &tags).unwrap();
        assert_eq!(t.warning, 98.0);

        // No tags: defaults.
        let t = config.effective("guest/prod/qemu/101", "cpu", &[]).unwrap();
        assert_eq!(t.warning, 85.0);
    }

    #[test]
    fn glob_override_matches_family() {
        let mut config = ThresholdConfig::default();
        config.overrides.insert(
            "node/*".into(),
            ThresholdOverride {
                disabled: true,
                ..Default::default()
            },
        );
        assert!(config.effective("node/pve1", "cpu", &[]).is_none());
        assert!(config.effective("guest/pve1/qemu/100", "cpu", &[]).is_some());
    }

    #[test]
    fn no_alerts_tag_disables_everything() {
        let config = ThresholdConfig::default();
        let tags = vec![TAG_NO_ALERTS.to_string()];
        assert!(config.effective("guest/a/qemu/1", "cpu", &tags).is_none());
    }
}
