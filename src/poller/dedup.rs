//! Time-bounded seen-set for poller-side deduplication.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Expiring set of recently seen event ids.
///
/// Membership is eventually consistent across restarts by design: a
/// duplicate that slips through costs one extra processing cycle but never
/// a double publish, because anomaly record writes are idempotent.
pub struct DedupSet {
    entries: Mutex<HashMap<String, Instant>>,
    ttl: Duration,
}

impl DedupSet {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Insert an id; returns true when it was not seen within the TTL.
    pub fn insert(&self, id: &str) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        // Amortized pruning keeps the map bounded without a sweeper task.
        if entries.len() % 1024 == 0 && !entries.is_empty() {
            let ttl = self.ttl;
            entries.retain(|_, seen| now.duration_since(*seen) < ttl);
        }

        match entries.get(id) {
            Some(seen) if now.duration_since(*seen) < self.ttl => false,
            _ => {
                entries.insert(id.to_string(), now);
                true
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_within_ttl_rejected() {
        let set = DedupSet::new(Duration::from_secs(600));
        assert!(set.insert("e1"));
        assert!(!set.insert("e1"));
        assert!(set.insert("e2"));
    }

    #[test]
    fn test_expired_entry_accepted_again() {
        let set = DedupSet::new(Duration::from_millis(10));
        assert!(set.insert("e1"));
        std::thread::sleep(Duration::from_millis(20));
        assert!(set.insert("e1"));
    }
}
