//! At-least-once event delivery: unbounded queue, 5-minute grouping at
//! the notifier boundary, exponential retry, drop-with-counter after the
//! attempt budget.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use pulse_common::types::{AlertEvent, AlertEventKind, AlertLevel};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const GROUP_WINDOW_SECS: i64 = 300;
const MAX_DELIVERY_ATTEMPTS: u32 = 10;
const RETRY_BASE_SECS: u64 = 1;
const RETRY_CAP_SECS: u64 = 60;

/// Handle for enqueueing events. Dropping every handle closes the queue;
/// the drain task then flushes pending groups and exits.
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<AlertEvent>,
    dropped: Arc<AtomicU64>,
}

impl Dispatcher {
    /// Spawn the drain task. Events are delivered sequentially so the
    /// per-(resource, metric) ordering guarantee holds.
    pub fn spawn(notifiers: Vec<Arc<dyn pulse_notify::Notifier>>) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let dropped = Arc::new(AtomicU64::new(0));
        let drain = DrainTask {
            rx,
            notifiers,
            dropped: dropped.clone(),
            groups: HashMap::new(),
        };
        let handle = tokio::spawn(drain.run());
        (Self { tx, dropped }, handle)
    }

    pub fn enqueue(&self, event: AlertEvent) {
        // Send only fails when the drain task is gone; at shutdown that is
        // expected and the event is intentionally lost.
        if self.tx.send(event).is_err() {
            tracing::debug!("dispatcher closed, event discarded");
        }
    }

    /// Events dropped after exhausting the retry budget.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

struct Group {
    window_start: DateTime<Utc>,
    pending: Option<AlertEvent>,
}

struct DrainTask {
    rx: mpsc::UnboundedReceiver<AlertEvent>,
    notifiers: Vec<Arc<dyn pulse_notify::Notifier>>,
    dropped: Arc<AtomicU64>,
    groups: HashMap<(String, AlertLevel), Group>,
}

impl DrainTask {
    async fn run(mut self) {
        let mut flush_tick = tokio::time::interval(std::time::Duration::from_secs(5));
        flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                maybe = self.rx.recv() => match maybe {
                    Some(event) => self.handle(event).await,
                    None => break,
                },
                _ = flush_tick.tick() => self.flush_expired(Utc::now()).await,
            }
        }
        // Queue closed: flush whatever is still grouped.
        let keys: Vec<_> = self.groups.keys().cloned().collect();
        for key in keys {
            if let Some(group) = self.groups.remove(&key) {
                if let Some(event) = group.pending {
                    self.deliver(event).await;
                }
            }
        }
    }

    async fn handle(&mut self, event: AlertEvent) {
        let now = Utc::now();

        // Resolutions are never grouped; they also end the window for their
        // resource so the next firing notifies immediately.
        if event.kind == AlertEventKind::Resolved {
            let key = (event.alert.resource_id.clone(), event.alert.level);
            if let Some(group) = self.groups.remove(&key) {
                if let Some(pending) = group.pending {
                    self.deliver(pending).await;
                }
            }
            self.deliver(event).await;
            return;
        }

        let key = (event.alert.resource_id.clone(), event.alert.level);
        let window = ChronoDuration::seconds(GROUP_WINDOW_SECS);
        let in_window = self
            .groups
            .get(&key)
            .is_some_and(|g| now - g.window_start < window);

        if in_window {
            // Coalesce: bump the count, keep the latest message.
            if let Some(group) = self.groups.get_mut(&key) {
                let count = group.pending.as_ref().map(|p| p.count).unwrap_or(0);
                let mut coalesced = event;
                coalesced.count = count + 1;
                group.pending = Some(coalesced);
            }
        } else {
            self.groups.insert(
                key,
                Group {
                    window_start: now,
                    pending: None,
                },
            );
            self.deliver(event).await;
        }
    }

    async fn flush_expired(&mut self, now: DateTime<Utc>) {
        let window = ChronoDuration::seconds(GROUP_WINDOW_SECS);
        let expired: Vec<_> = self
            .groups
            .iter()
            .filter(|(_, g)| now - g.window_start >= window)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            if let Some(group) = self.groups.remove(&key) {
                if let Some(event) = group.pending {
                    self.deliver(event).await;
                }
            }
        }
    }

    async fn deliver(&self, event: AlertEvent) {
        let mut remaining: Vec<&Arc<dyn pulse_notify::Notifier>> = self.notifiers.iter().collect();
        if remaining.is_empty() {
            return;
        }

        for attempt in 1..=MAX_DELIVERY_ATTEMPTS {
            let mut failed = Vec::new();
            for notifier in remaining {
                if let Err(e) = notifier.notify(&event).await {
                    tracing::warn!(
                        notifier = notifier.name(),
                        alert_id = %event.alert.id,
                        attempt,
                        error = %e,
                        "notification attempt failed"
                    );
                    failed.push(notifier);
                }
            }
            if failed.is_empty() {
                return;
            }
            remaining = failed;
            if attempt < MAX_DELIVERY_ATTEMPTS {
                let backoff = RETRY_BASE_SECS
                    .saturating_mul(1u64 << (attempt - 1).min(16))
                    .min(RETRY_CAP_SECS);
                tokio::time::sleep(std::time::Duration::from_secs(backoff)).await;
            }
        }

        self.dropped.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            alert_id = %event.alert.id,
            resource = %event.alert.resource_id,
            "event dropped after {MAX_DELIVERY_ATTEMPTS} delivery attempts"
        );
    }
}
