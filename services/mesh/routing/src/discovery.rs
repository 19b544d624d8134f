//! Route request dedup and pending discoveries.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use mesh_wire::NodeId;
use std::time::Duration;

/// A discovery this node originated and is still waiting on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingDiscovery {
    /// Request flooded for it
    pub request_id: u64,
    /// When it was flooded (Unix millis)
    pub started_at: u64,
}

/// Request IDs seen recently and discoveries in flight.
///
/// Both maps age out after the same window: a request ID is forgotten, and
/// a pending discovery is declared failed, once it is older than `ttl`.
#[derive(Debug)]
pub(crate) struct DiscoveryTracker {
    ttl_millis: u64,
    /// request_id -> first seen
    seen: DashMap<u64, u64>,
    /// destination -> discovery
    pending: DashMap<NodeId, PendingDiscovery>,
}

impl DiscoveryTracker {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl_millis: ttl.as_millis() as u64,
            seen: DashMap::new(),
            pending: DashMap::new(),
        }
    }

    fn is_live(&self, recorded_at: u64, now: u64) -> bool {
        now.saturating_sub(recorded_at) <= self.ttl_millis
    }

    /// Record a request ID, returning false if it was already seen within the window
    pub fn first_sighting(&self, request_id: u64, now: u64) -> bool {
        match self.seen.entry(request_id) {
            Entry::Occupied(mut entry) => {
                if self.is_live(*entry.get(), now) {
                    false
                } else {
                    entry.insert(now);
                    true
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(now);
                true
            }
        }
    }

    /// Register a discovery, or return the live one already pending for `destination`.
    ///
    /// On success, yields the expired discovery the new one replaced, if any.
    pub fn begin(
        &self,
        destination: NodeId,
        request_id: u64,
        now: u64,
    ) -> Result<Option<PendingDiscovery>, PendingDiscovery> {
        let discovery = PendingDiscovery {
            request_id,
            started_at: now,
        };
        match self.pending.entry(destination) {
            Entry::Occupied(mut entry) => {
                if self.is_live(entry.get().started_at, now) {
                    Err(*entry.get())
                } else {
                    Ok(Some(entry.insert(discovery)))
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(discovery);
                Ok(None)
            }
        }
    }

    /// Clear the pending discovery for `destination`
    pub fn resolve(&self, destination: &NodeId) -> Option<PendingDiscovery> {
        self.pending.remove(destination).map(|(_, pending)| pending)
    }

    /// Forget old request IDs, returning how many were dropped
    pub fn purge_seen(&self, now: u64) -> usize {
        let before = self.seen.len();
        self.seen.retain(|_, seen_at| self.is_live(*seen_at, now));
        before.saturating_sub(self.seen.len())
    }

    /// Remove and return discoveries older than the window
    pub fn expire(&self, now: u64) -> Vec<(NodeId, PendingDiscovery)> {
        let expired: Vec<NodeId> = self
            .pending
            .iter()
            .filter(|e| !self.is_live(e.value().started_at, now))
            .map(|e| *e.key())
            .collect();

        expired
            .into_iter()
            .filter_map(|destination| {
                self.pending
                    .remove_if(&destination, |_, p| !self.is_live(p.started_at, now))
            })
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> DiscoveryTracker {
        DiscoveryTracker::new(Duration::from_secs(60))
    }

    #[test]
    fn test_dedup_window() {
        let t = tracker();
        assert!(t.first_sighting(1, 0));
        assert!(!t.first_sighting(1, 60_000));
        assert!(t.first_sighting(1, 60_001));
        assert!(t.first_sighting(2, 0));
    }

    #[test]
    fn test_purge_seen() {
        let t = tracker();
        t.first_sighting(1, 0);
        t.first_sighting(2, 50_000);
        assert_eq!(t.purge_seen(100_000), 1);
        assert!(!t.first_sighting(2, 100_000));
    }

    #[test]
    fn test_pending_suppresses_duplicates() {
        let t = tracker();
        let d = NodeId::from_public_key(b"d");
        assert_eq!(t.begin(d, 10, 0), Ok(None));
        assert_eq!(t.begin(d, 11, 1_000).unwrap_err().request_id, 10);
        // Window elapsed, a new discovery replaces the old one
        let replaced = t.begin(d, 12, 61_000).unwrap().unwrap();
        assert_eq!(replaced.request_id, 10);
        assert_eq!(t.resolve(&d).unwrap().request_id, 12);
        assert!(t.resolve(&d).is_none());
    }

    #[test]
    fn test_expire() {
        let t = tracker();
        let old = NodeId::from_public_key(b"old");
        let new = NodeId::from_public_key(b"new");
        assert_eq!(t.begin(old, 1, 0), Ok(None));
        assert_eq!(t.begin(new, 2, 30_000), Ok(None));

        let expired = t.expire(70_000);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, old);
        assert_eq!(t.pending_count(), 1);
    }

    #[test]
    fn test_concurrent_sightings_admit_one() {
        let t = std::sync::Arc::new(tracker());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let t = std::sync::Arc::clone(&t);
                std::thread::spawn(move || t.first_sighting(7, 1_000))
            })
            .collect();
        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|first| *first)
            .count();
        assert_eq!(admitted, 1);
    }

    #[test]
    fn test_concurrent_begin_admits_one() {
        let t = std::sync::Arc::new(tracker());
        let d = NodeId::from_public_key(b"d");
        let handles: Vec<_> = (0..16u64)
            .map(|id| {
                let t = std::sync::Arc::clone(&t);
                std::thread::spawn(move || t.begin(d, id, 1_000).is_ok())
            })
            .collect();
        let started = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|started| *started)
            .count();
        assert_eq!(started, 1);
        assert_eq!(t.pending_count(), 1);
    }
}
