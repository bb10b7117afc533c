//! Raw-counter rate derivation, shared by all workers.

use chrono::{DateTime, Utc};
use pulse_common::types::GuestType;
use std::collections::HashMap;
use std::sync::Mutex;

/// Identifies one raw counter on one entity on one endpoint. Rates are
/// only meaningful between samples of the same endpoint; a failover
/// starts the series over.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateKey {
    pub endpoint: String,
    pub guest_type: GuestType,
    pub vmid: u64,
    pub counter: &'static str,
}

pub struct RateCache {
    inner: Mutex<HashMap<RateKey, (DateTime<Utc>, u64)>>,
}

impl RateCache {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Bytes/sec derived from the previous sample of the same key. The
    /// first sample and counter resets both yield 0, never NaN or a
    /// negative value.
    pub fn rate(&self, key: RateKey, counter: u64, now: DateTime<Utc>) -> f64 {
        let mut cache = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let previous = cache.insert(key, (now, counter));
        match previous {
            Some((prev_at, prev_value)) => {
                let dt = (now - prev_at).num_milliseconds() as f64 / 1000.0;
                if dt <= 0.0 || counter < prev_value {
                    0.0
                } else {
                    (counter - prev_value) as f64 / dt
                }
            }
            None => 0.0,
        }
    }
}

impl Default for RateCache {
    fn default() -> Self {
        Self::new()
    }
}
