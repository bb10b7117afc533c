//! Endpoint preference list with failover rotation.
//!
//! Scanned round-robin starting at the last-good endpoint. An endpoint
//! goes on a short cooldown after two consecutive transient failures and
//! a long one while it keeps failing; a fully-cooled-down set is probed
//! anyway rather than giving up without trying.

use tokio::time::Instant;

const SHORT_COOLDOWN_SECS: u64 = 30;
const LONG_COOLDOWN_SECS: u64 = 300;
const FAILURES_BEFORE_COOLDOWN: u32 = 2;

struct EndpointHealth {
    url: String,
    consecutive_failures: u32,
    cooldown_until: Option<Instant>,
}

pub struct EndpointSet {
    entries: Vec<EndpointHealth>,
    preferred: usize,
}

impl EndpointSet {
    pub fn new(initial: Vec<String>) -> Self {
        let mut set = Self {
            entries: Vec::new(),
            preferred: 0,
        };
        set.replace(initial);
        set
    }

    /// Swap in a fresh endpoint list (after a cluster-status refresh),
    /// carrying over health state for endpoints that persist.
    pub fn replace(&mut self, urls: Vec<String>) {
        let preferred_url = self.entries.get(self.preferred).map(|e| e.url.clone());
        let old = std::mem::take(&mut self.entries);
        self.entries = urls
            .into_iter()
            .map(|url| {
                old.iter()
                    .find(|e| e.url == url)
                    .map(|e| EndpointHealth {
                        url: e.url.clone(),
                        consecutive_failures: e.consecutive_failures,
                        cooldown_until: e.cooldown_until,
                    })
                    .unwrap_or(EndpointHealth {
                        url,
                        consecutive_failures: 0,
                        cooldown_until: None,
                    })
            })
            .collect();
        self.preferred = preferred_url
            .and_then(|url| self.entries.iter().position(|e| e.url == url))
            .unwrap_or(0);
    }

    pub fn urls(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.url.clone()).collect()
    }

    /// Candidate endpoints for this tick, preferred first, cooled-down
    /// entries last instead of skipped entirely.
    pub fn candidates(&self, now: Instant) -> Vec<String> {
        let n = self.entries.len();
        let mut available = Vec::with_capacity(n);
        let mut cooling = Vec::new();
        for offset in 0..n {
            let entry = &self.entries[(self.preferred + offset) % n];
            let cooled = entry
                .cooldown_until
                .map(|until| now < until)
                .unwrap_or(false);
            if cooled {
                cooling.push(entry.url.clone());
            } else {
                available.push(entry.url.clone());
            }
        }
        available.extend(cooling);
        available
    }

    pub fn record_success(&mut self, url: &str) {
        if let Some(idx) = self.entries.iter().position(|e| e.url == url) {
            self.entries[idx].consecutive_failures = 0;
            self.entries[idx].cooldown_until = None;
            self.preferred = idx;
        }
    }

    pub fn record_failure(&mut self, url: &str, now: Instant) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.url == url) {
            entry.consecutive_failures += 1;
            if entry.consecutive_failures >= FAILURES_BEFORE_COOLDOWN {
                let secs = if entry.consecutive_failures > FAILURES_BEFORE_COOLDOWN {
                    LONG_COOLDOWN_SECS
                } else {
                    SHORT_COOLDOWN_SECS
                };
                entry.cooldown_until = Some(now + std::time::Duration::from_secs(secs));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set3() -> EndpointSet {
        EndpointSet::new(vec!["a".into(), "b".into(), "c".into()])
    }

    #[tokio::test]
    async fn rotation_starts_at_last_good() {
        let mut set = set3();
        set.record_success("b");
        assert_eq!(set.candidates(Instant::now()), vec!["b", "c", "a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn two_failures_cool_down_an_endpoint() {
        let mut set = set3();
        let now = Instant::now();
        set.record_failure("a", now);
        assert_eq!(set.candidates(now)[0], "a", "one failure keeps it in");
        set.record_failure("a", now);
        assert_eq!(set.candidates(now), vec!["b", "c", "a"], "cooled entry demoted");

        tokio::time::advance(std::time::Duration::from_secs(SHORT_COOLDOWN_SECS + 1)).await;
        assert_eq!(set.candidates(Instant::now())[0], "a", "cooldown expires");
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_failures_escalate_cooldown() {
        let mut set = set3();
        let now = Instant::now();
        for _ in 0..3 {
            set.record_failure("a", now);
        }
        tokio::time::advance(std::time::Duration::from_secs(SHORT_COOLDOWN_SECS + 1)).await;
        assert_ne!(
            set.candidates(Instant::now())[0],
            "a",
            "still cooling after the short window"
        );
        tokio::time::advance(std::time::Duration::from_secs(LONG_COOLDOWN_SECS)).await;
        assert_eq!(set.candidates(Instant::now())[0], "a");
    }

    #[tokio::test]
    async fn replace_preserves_health_and_preference() {
        let mut set = set3();
        set.record_success("b");
        set.replace(vec!["b".into(), "c".into(), "d".into()]);
        assert_eq!(set.candidates(Instant::now())[0], "b");
    }

    #[tokio::test(start_paused = true)]
    async fn fully_cooled_set_is_still_probed() {
        let mut set = EndpointSet::new(vec!["a".into()]);
        let now = Instant::now();
        set.record_failure("a", now);
        set.record_failure("a", now);
        assert_eq!(set.candidates(now), vec!["a"], "never return an empty list");
    }
}
