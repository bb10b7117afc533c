//! Per-entity bounded time series. O(1) append, queries bounded by ring
//! size, no disk persistence.

use chrono::{DateTime, Utc};
use pulse_common::types::{HistoryPoint, Snapshot};
use std::collections::{HashMap, VecDeque};

/// 1440 points is roughly four hours at one sample per ten seconds.
pub const DEFAULT_CAPACITY: usize = 1440;

pub struct HistoryRing {
    capacity: usize,
    series: HashMap<String, VecDeque<HistoryPoint>>,
}

impl HistoryRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            series: HashMap::new(),
        }
    }

    pub fn record(&mut self, entity_id: &str, point: HistoryPoint) {
        let ring = self
            .series
            .entry(entity_id.to_string())
            .or_insert_with(|| VecDeque::with_capacity(self.capacity.min(64)));
        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back(point);
    }

    /// Append one point per live entity in the snapshot. Entities missing
    /// from the snapshot are left untouched; their points age out as the
    /// ring fills.
    pub fn record_snapshot(&mut self, snapshot: &Snapshot) {
        let at = snapshot.generated_at;
        for node in &snapshot.nodes {
            self.record(
                &format!("node/{}", node.name),
                HistoryPoint {
                    timestamp: at,
                    cpu: node.cpu * 100.0,
                    mem_usage: node.memory.usage,
                    disk_usage: node.disk.usage,
                    disk_read_rate: 0.0,
                    disk_write_rate: 0.0,
                    net_in_rate: 0.0,
                    net_out_rate: 0.0,
                },
            );
        }
        for guest in snapshot.vms.iter().chain(snapshot.containers.iter()) {
            self.record(
                &format!("guest/{}/{}/{}", guest.instance, guest.guest_type, guest.vmid),
                HistoryPoint {
                    timestamp: at,
                    cpu: guest.cpu * 100.0,
                    mem_usage: guest.memory.usage,
                    disk_usage: guest.disk.usage,
                    disk_read_rate: guest.disk_read,
                    disk_write_rate: guest.disk_write,
                    net_in_rate: guest.network_in,
                    net_out_rate: guest.network_out,
                },
            );
        }
    }

    /// Points for `entity_id` within `[from, to]`, decimated by plain
    /// stride to at most `max_points`.
    pub fn range(
        &self,
        entity_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        max_points: usize,
    ) -> Vec<HistoryPoint> {
        let Some(ring) = self.series.get(entity_id) else {
            return Vec::new();
        };
        let selected: Vec<HistoryPoint> = ring
            .iter()
            .filter(|p| p.timestamp >= from && p.timestamp <= to)
            .copied()
            .collect();
        decimate(selected, max_points)
    }

    /// Range query over every entity at once, for the charts endpoint.
    pub fn range_all(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        max_points: usize,
    ) -> HashMap<String, Vec<HistoryPoint>> {
        self.series
            .keys()
            .map(|entity| (entity.clone(), self.range(entity, from, to, max_points)))
            .filter(|(_, points)| !points.is_empty())
            .collect()
    }

    pub fn entity_count(&self) -> usize {
        self.series.len()
    }
}

impl Default for HistoryRing {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

fn decimate(points: Vec<HistoryPoint>, max_points: usize) -> Vec<HistoryPoint> {
    if max_points == 0 || points.len() <= max_points {
        return points;
    }
    let stride = points.len().div_ceil(max_points);
    let mut out: Vec<HistoryPoint> = points.iter().step_by(stride).copied().collect();
    // Keep the newest point so the chart's right edge stays current.
    if let (Some(last_kept), Some(last)) = (out.last(), points.last()) {
        if last_kept.timestamp != last.timestamp {
            out.push(*last);
        }
    }
    out
}
