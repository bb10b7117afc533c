//! The state hub: current-snapshot pointer, per-subscriber outboxes with
//! latest-wins coalescing, and slow-consumer eviction.
//!
//! `publish` never blocks on I/O: it swaps an `Arc` pointer and pushes
//! into bounded per-subscriber queues under short mutexes.

use pulse_common::id::short_id;
use pulse_common::types::{DiscoveredServer, Snapshot};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, RwLock, Weak};
use tokio::sync::Notify;
use tokio::time::Instant;

/// Outbound frames buffered per subscriber before coalescing kicks in.
pub const SUBSCRIBER_BUFFER: usize = 4;
/// A consumer that has not drained for this long while its buffer is full
/// is evicted.
pub const STALL_EVICT_SECS: u64 = 30;

struct OutboxQueue {
    items: VecDeque<Arc<Snapshot>>,
    closed: bool,
    close_reason: Option<String>,
    last_drain: Instant,
}

struct Outbox {
    queue: Mutex<OutboxQueue>,
    notify: Notify,
}

impl Outbox {
    fn new() -> Self {
        Self {
            queue: Mutex::new(OutboxQueue {
                items: VecDeque::with_capacity(SUBSCRIBER_BUFFER),
                closed: false,
                close_reason: None,
                last_drain: Instant::now(),
            }),
            notify: Notify::new(),
        }
    }

    /// Push a snapshot. Returns false when the subscriber was evicted or
    /// has gone away and the hub should forget it.
    fn offer(&self, snapshot: Arc<Snapshot>, now: Instant) -> bool {
        let mut q = self.queue.lock().unwrap_or_else(|p| p.into_inner());
        if q.closed {
            return false;
        }
        if q.items.len() >= SUBSCRIBER_BUFFER {
            if now.duration_since(q.last_drain).as_secs() >= STALL_EVICT_SECS {
                q.closed = true;
                q.close_reason = Some("slow consumer".into());
                self.notify.notify_one();
                return false;
            }
            // Latest-wins: the oldest queued snapshot makes room.
            q.items.pop_front();
        }
        q.items.push_back(snapshot);
        self.notify.notify_one();
        true
    }

    fn close(&self) {
        let mut q = self.queue.lock().unwrap_or_else(|p| p.into_inner());
        q.closed = true;
        self.notify.notify_one();
    }
}

/// Handle returned by [`StateHub::subscribe`]. Dropping it unsubscribes
/// and releases the outbox promptly.
pub struct Subscription {
    id: String,
    outbox: Arc<Outbox>,
    hub: Weak<StateHub>,
}

impl Subscription {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Next snapshot, in monotonically increasing `generated_at` order.
    /// `None` means the subscription was closed (cancelled or evicted).
    pub async fn recv(&self) -> Option<Arc<Snapshot>> {
        loop {
            {
                let mut q = self.outbox.queue.lock().unwrap_or_else(|p| p.into_inner());
                if let Some(item) = q.items.pop_front() {
                    q.last_drain = Instant::now();
                    return Some(item);
                }
                if q.closed {
                    return None;
                }
            }
            self.outbox.notify.notified().await;
        }
    }

    /// Why the hub closed this subscription, when it did.
    pub fn close_reason(&self) -> Option<String> {
        self.outbox
            .queue
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .close_reason
            .clone()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.outbox.close();
        if let Some(hub) = self.hub.upgrade() {
            hub.remove_subscriber(&self.id);
        }
    }
}

struct SubscriberEntry {
    id: String,
    outbox: Arc<Outbox>,
}

pub struct StateHub {
    current: RwLock<Option<Arc<Snapshot>>>,
    subscribers: Mutex<Vec<SubscriberEntry>>,
    discovered: RwLock<Vec<DiscoveredServer>>,
    /// Back-reference handed to subscriptions so dropping one can
    /// unregister itself.
    self_ref: Weak<StateHub>,
}

impl StateHub {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            current: RwLock::new(None),
            subscribers: Mutex::new(Vec::new()),
            discovered: RwLock::new(Vec::new()),
            self_ref: self_ref.clone(),
        })
    }

    pub fn current_snapshot(&self) -> Option<Arc<Snapshot>> {
        self.current
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Publish a new snapshot to every subscriber. A publish whose
    /// `generated_at` does not advance past the last one is discarded.
    pub fn publish(&self, snapshot: Snapshot) -> bool {
        let snapshot = Arc::new(snapshot);
        {
            let mut current = self.current.write().unwrap_or_else(|p| p.into_inner());
            if let Some(prev) = current.as_ref() {
                if snapshot.generated_at <= prev.generated_at {
                    tracing::debug!(
                        generated_at = %snapshot.generated_at,
                        "discarding non-monotonic publish"
                    );
                    return false;
                }
            }
            *current = Some(snapshot.clone());
        }

        let now = Instant::now();
        let mut subs = self.subscribers.lock().unwrap_or_else(|p| p.into_inner());
        subs.retain(|entry| {
            let kept = entry.outbox.offer(snapshot.clone(), now);
            if !kept {
                tracing::warn!(subscriber = %entry.id, "evicting subscriber");
            }
            kept
        });
        true
    }

    /// Register a subscriber. The current snapshot, when one exists, is
    /// queued as the first message.
    pub fn subscribe(&self) -> Subscription {
        let outbox = Arc::new(Outbox::new());
        if let Some(snapshot) = self.current_snapshot() {
            outbox.offer(snapshot, Instant::now());
        }
        let id = short_id();
        self.subscribers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(SubscriberEntry {
                id: id.clone(),
                outbox: outbox.clone(),
            });
        Subscription {
            id,
            outbox,
            hub: self.self_ref.clone(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .len()
    }

    fn remove_subscriber(&self, id: &str) {
        self.subscribers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .retain(|e| e.id != id);
    }

    pub fn set_discovered(&self, servers: Vec<DiscoveredServer>) {
        *self.discovered.write().unwrap_or_else(|p| p.into_inner()) = servers;
    }

    pub fn discovered(&self) -> Vec<DiscoveredServer> {
        self.discovered
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}
