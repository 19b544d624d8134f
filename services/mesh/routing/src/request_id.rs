//! Sources of route request identifiers.

use rand::rngs::OsRng;
use rand::RngCore;
use std::sync::atomic::{AtomicU64, Ordering};

/// Produces identifiers for outgoing route requests
pub trait RequestIdSource: Send + Sync {
    /// Next identifier
    fn next_id(&self) -> u64;
}

/// Random identifiers from the operating system RNG
#[derive(Debug, Clone, Copy, Default)]
pub struct OsRequestIds;

impl RequestIdSource for OsRequestIds {
    fn next_id(&self) -> u64 {
        OsRng.next_u64()
    }
}

/// Counting identifiers, for reproducible runs
#[derive(Debug, Default)]
pub struct SequentialRequestIds {
    next: AtomicU64,
}

impl SequentialRequestIds {
    /// Start counting at `first`
    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }
}

impl RequestIdSource for SequentialRequestIds {
    fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential() {
        let ids = SequentialRequestIds::starting_at(7);
        assert_eq!(ids.next_id(), 7);
        assert_eq!(ids.next_id(), 8);
    }

    #[test]
    fn test_os_ids_vary() {
        let ids = OsRequestIds;
        assert_ne!(ids.next_id(), ids.next_id());
    }
}
