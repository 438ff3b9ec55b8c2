//! Mutations applied locally but not yet confirmed by the server.
//!
//! Each entry keeps the undo log of its optimistic writes. Entries stay in
//! submission order; confirmation always removes a prefix because the server
//! watermark covers every id up to it.

use crate::store::UndoLog;
use protocol::Mutation;
use std::collections::VecDeque;

/// A locally applied mutation awaiting confirmation.
#[derive(Clone, Debug, PartialEq)]
pub struct PendingMutation {
    pub mutation: Mutation,
    pub undo: UndoLog,
}

/// Ordered queue of unconfirmed mutations for one client.
#[derive(Debug)]
pub struct PendingQueue {
    entries: VecDeque<PendingMutation>,
    /// Next mutation id to hand out.
    next_id: u64,
    /// Highest id the server has confirmed.
    confirmed: u64,
}

impl Default for PendingQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingQueue {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            next_id: 1,
            confirmed: 0,
        }
    }

    /// The id the next reservation will return.
    pub fn peek_mutation_id(&self) -> u64 {
        self.next_id
    }

    /// Reserve the next mutation id.
    pub fn next_mutation_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn push(&mut self, pending: PendingMutation) {
        self.entries.push_back(pending);
    }

    /// Drop every entry with `id <= last_mutation_id`. Returns how many were
    /// dropped.
    pub fn confirm(&mut self, last_mutation_id: u64) -> usize {
        self.confirmed = self.confirmed.max(last_mutation_id);
        let before = self.entries.len();
        while self
            .entries
            .front()
            .is_some_and(|p| p.mutation.id <= last_mutation_id)
        {
            self.entries.pop_front();
        }
        before - self.entries.len()
    }

    /// Highest confirmed id.
    pub fn confirmed(&self) -> u64 {
        self.confirmed
    }

    /// Snapshot of the queued mutations, for a push.
    pub fn mutations(&self) -> Vec<Mutation> {
        self.entries.iter().map(|p| p.mutation.clone()).collect()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &PendingMutation> {
        self.entries.iter()
    }

    /// Remove every entry, newest first.
    pub fn drain_newest_first(&mut self) -> Vec<PendingMutation> {
        let mut drained: Vec<_> = self.entries.drain(..).collect();
        drained.reverse();
        drained
    }

    /// Restart numbering at 1 for a new client ID, keeping entry order.
    pub fn renumber(&mut self) {
        self.next_id = 1;
        self.confirmed = 0;
        for entry in self.entries.iter_mut() {
            entry.mutation.id = self.next_id;
            self.next_id += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn queue_with(n: u64) -> PendingQueue {
        let mut q = PendingQueue::new();
        for _ in 0..n {
            let id = q.next_mutation_id();
            q.push(PendingMutation {
                mutation: Mutation::new(id, "createTask", json!({}), 0),
                undo: UndoLog::default(),
            });
        }
        q
    }

    #[test]
    fn test_ids_start_at_one() {
        let mut q = PendingQueue::new();
        assert_eq!(q.next_mutation_id(), 1);
        assert_eq!(q.next_mutation_id(), 2);
    }

    #[test]
    fn test_confirm_drops_prefix() {
        let mut q = queue_with(4);
        assert_eq!(q.confirm(2), 2);
        assert_eq!(q.mutations().iter().map(|m| m.id).collect::<Vec<_>>(), vec![3, 4]);
        // Stale confirmations are harmless.
        assert_eq!(q.confirm(1), 0);
        assert_eq!(q.confirmed(), 2);
    }

    #[test]
    fn test_renumber_after_rotation() {
        let mut q = queue_with(3);
        q.confirm(1);
        q.renumber();
        assert_eq!(q.mutations().iter().map(|m| m.id).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(q.next_mutation_id(), 3);
        assert_eq!(q.confirmed(), 0);
    }

    #[test]
    fn test_drain_newest_first() {
        let mut q = queue_with(3);
        let ids: Vec<_> = q.drain_newest_first().iter().map(|p| p.mutation.id).collect();
        assert_eq!(ids, vec![3, 2, 1]);
        assert!(q.is_empty());
    }

    proptest! {
        #[test]
        fn prop_confirm_keeps_only_newer(n in 0u64..20, watermark in 0u64..25) {
            let mut q = queue_with(n);
            q.confirm(watermark);
            prop_assert!(q.iter().all(|p| p.mutation.id > watermark));
            prop_assert_eq!(q.len() as u64, n.saturating_sub(watermark));
        }
    }
}
