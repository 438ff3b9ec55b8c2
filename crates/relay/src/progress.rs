//! Per-client progress counters (`lastMutationID`).
//!
//! The counter for a client only moves forward: every update is
//! `new = max(current, incoming)` applied atomically, so concurrent pushes
//! for the same client cannot regress it and a replayed batch cannot
//! double-advance it.

use protocol::ClientId;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// Storage backend for progress counters.
///
/// Implementations must make [`advance`](ProgressStore::advance) atomic with
/// respect to other calls for the same client: either under a lock or as a
/// compare-and-swap loop.
pub trait ProgressStore: Send + Sync {
    /// Current watermark for a client, `0` if the client was never seen.
    fn last_mutation_id(&self, client_id: &ClientId) -> u64;

    /// Raise the watermark to `candidate` if it is higher and return the
    /// resulting value.
    fn advance(&self, client_id: &ClientId, candidate: u64) -> u64;
}

/// In-memory progress store.
///
/// Not durable: all counters are lost on restart, at which point clients
/// resubmit their pending mutations and the counters are rebuilt.
#[derive(Default)]
pub struct MemoryProgressStore {
    counters: RwLock<HashMap<ClientId, u64>>,
}

impl MemoryProgressStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of clients with a recorded counter.
    pub fn client_count(&self) -> usize {
        self.counters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl ProgressStore for MemoryProgressStore {
    fn last_mutation_id(&self, client_id: &ClientId) -> u64 {
        self.counters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(client_id)
            .copied()
            .unwrap_or(0)
    }

    fn advance(&self, client_id: &ClientId, candidate: u64) -> u64 {
        let mut counters = self.counters.write().unwrap_or_else(PoisonError::into_inner);
        let current = counters.entry(client_id.clone()).or_insert(0);
        *current = (*current).max(candidate);
        *current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    #[test]
    fn test_unknown_client_is_zero() {
        let store = MemoryProgressStore::new();
        assert_eq!(store.last_mutation_id(&ClientId::from("c1")), 0);
        assert_eq!(store.client_count(), 0);
    }

    #[test]
    fn test_advance_never_regresses() {
        let store = MemoryProgressStore::new();
        let c1 = ClientId::from("c1");
        assert_eq!(store.advance(&c1, 5), 5);
        assert_eq!(store.advance(&c1, 3), 5);
        assert_eq!(store.advance(&c1, 5), 5);
        assert_eq!(store.advance(&c1, 6), 6);
        assert_eq!(store.last_mutation_id(&c1), 6);
    }

    #[test]
    fn test_clients_are_independent() {
        let store = MemoryProgressStore::new();
        store.advance(&ClientId::from("c1"), 10);
        assert_eq!(store.last_mutation_id(&ClientId::from("c2")), 0);
    }

    #[test]
    fn test_concurrent_advances_keep_maximum() {
        let store = Arc::new(MemoryProgressStore::new());
        let handles: Vec<_> = (1..=8u64)
            .map(|n| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        store.advance(&ClientId::from("c1"), n * 100 + i);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.last_mutation_id(&ClientId::from("c1")), 899);
    }

    proptest! {
        #[test]
        fn prop_watermark_is_running_maximum(ids in proptest::collection::vec(0u64..1000, 0..50)) {
            let store = MemoryProgressStore::new();
            let c1 = ClientId::from("c1");
            let mut previous = 0;
            for id in &ids {
                let now = store.advance(&c1, *id);
                prop_assert!(now >= previous);
                previous = now;
            }
            prop_assert_eq!(store.last_mutation_id(&c1), ids.iter().copied().max().unwrap_or(0));
        }
    }
}
