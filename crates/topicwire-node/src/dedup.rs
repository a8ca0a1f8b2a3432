//! Time-bounded exact-match cache answering "have I fully processed id X".
//!
//! Shared by every topic poll loop and the response correlator, so it is
//! cheap to clone (an `Arc` around the map) and safe to hit concurrently.
//! Not a Bloom filter: within the TTL window a remembered id is never
//! reported unseen.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use topicwire_protocol::{envelope::now_ms, DEDUP_SWEEP_INTERVAL_MS, DEDUP_TTL_MS};

#[derive(Clone)]
pub struct Deduplicator {
    seen: Arc<Mutex<HashMap<String, u64>>>,
    ttl_ms: u64,
}

impl Deduplicator {
    pub fn new() -> Self {
        Self::with_ttl(DEDUP_TTL_MS)
    }

    pub fn with_ttl(ttl_ms: u64) -> Self {
        Self {
            seen: Arc::new(Mutex::new(HashMap::new())),
            ttl_ms,
        }
    }

    /// True if `id` was remembered within the TTL window. Expired entries
    /// count as unseen even before the sweeper reclaims them.
    pub fn has(&self, id: &str) -> bool {
        let seen = self.seen.lock().expect("dedup cache poisoned");
        match seen.get(id) {
            Some(inserted) => now_ms().saturating_sub(*inserted) <= self.ttl_ms,
            None => false,
        }
    }

    pub fn remember(&self, id: &str) {
        let mut seen = self.seen.lock().expect("dedup cache poisoned");
        seen.insert(id.to_string(), now_ms());
    }

    /// Remember and report whether the id was new. Single lock acquisition,
    /// so two pollers racing on the same id cannot both see "new".
    pub fn check_and_remember(&self, id: &str) -> bool {
        let mut seen = self.seen.lock().expect("dedup cache poisoned");
        let now = now_ms();
        match seen.get(id) {
            Some(inserted) if now.saturating_sub(*inserted) <= self.ttl_ms => false,
            _ => {
                seen.insert(id.to_string(), now);
                true
            }
        }
    }

    /// Drop entries past the TTL. Returns how many were reclaimed.
    pub fn sweep(&self) -> usize {
        let mut seen = self.seen.lock().expect("dedup cache poisoned");
        let now = now_ms();
        let before = seen.len();
        seen.retain(|_, inserted| now.saturating_sub(*inserted) <= self.ttl_ms);
        before - seen.len()
    }

    pub fn len(&self) -> usize {
        self.seen.lock().expect("dedup cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spawn the periodic background sweep. The task runs until aborted;
    /// callers hold the handle and drop it on shutdown.
    pub fn start_sweeper(&self) -> tokio::task::JoinHandle<()> {
        self.start_sweeper_every(Duration::from_millis(DEDUP_SWEEP_INTERVAL_MS))
    }

    pub fn start_sweeper_every(&self, every: Duration) -> tokio::task::JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // The first tick fires immediately; skip it so an empty cache
            // isn't swept at startup.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let reclaimed = cache.sweep();
                if reclaimed > 0 {
                    tracing::debug!("Dedup sweep reclaimed {reclaimed} entries");
                }
            }
        })
    }
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remembered_ids_are_seen() {
        let cache = Deduplicator::new();
        assert!(!cache.has("a"));
        cache.remember("a");
        assert!(cache.has("a"));
        assert!(!cache.has("b"));
    }

    #[test]
    fn check_and_remember_is_first_wins() {
        let cache = Deduplicator::new();
        assert!(cache.check_and_remember("x"));
        assert!(!cache.check_and_remember("x"));
    }

    #[test]
    fn expired_ids_are_unseen_and_swept() {
        let cache = Deduplicator::with_ttl(0);
        cache.remember("old");
        std::thread::sleep(Duration::from_millis(5));
        assert!(!cache.has("old"));
        assert_eq!(cache.sweep(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn sweep_keeps_live_entries() {
        let cache = Deduplicator::with_ttl(60_000);
        cache.remember("live");
        assert_eq!(cache.sweep(), 0);
        assert!(cache.has("live"));
    }

    #[tokio::test]
    async fn background_sweeper_reclaims() {
        let cache = Deduplicator::with_ttl(0);
        cache.remember("gone");
        let handle = cache.start_sweeper_every(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(cache.is_empty());
        handle.abort();
    }
}
