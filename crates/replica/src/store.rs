//! Local transactional key-value store.
//!
//! Mutators never write to the store directly. They run against a
//! [`WriteTransaction`], which reads through to the committed state and
//! buffers writes. Committing a transaction applies the writes atomically
//! and returns an [`UndoLog`] holding the previous value of every touched
//! key, so optimistic writes can be reverted exactly.
//!
//! Subscribers receive a [`StoreChange`] after every commit, revert and
//! patch that changed at least one key.

use crate::error::StoreError;
use protocol::PatchOperation;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;

const CHANGE_CAPACITY: usize = 64;

/// Keys touched by one commit, revert or patch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreChange {
    pub keys: Vec<String>,
}

/// Previous values of the keys a commit wrote, in write order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UndoLog {
    entries: Vec<(String, Option<Value>)>,
}

impl UndoLog {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// The committed key-value state of one replica.
pub struct LocalStore {
    data: Mutex<BTreeMap<String, Value>>,
    changes: broadcast::Sender<StoreChange>,
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalStore {
    /// Create an empty store.
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            data: Mutex::new(BTreeMap::new()),
            changes,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Value>> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, keys: Vec<String>) {
        if !keys.is_empty() {
            // No subscribers is fine.
            let _ = self.changes.send(StoreChange { keys });
        }
    }

    /// Subscribe to change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.lock().get(key).cloned()
    }

    /// Decode the value under `key` as `T`.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        self.get(key).map(|v| decode(key, v)).transpose()
    }

    pub fn has(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    /// All entries whose key starts with `prefix`, in key order.
    pub fn scan_prefix(&self, prefix: &str) -> Vec<(String, Value)> {
        self.lock()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Start a transaction over the committed state.
    pub fn transaction(&self) -> WriteTransaction<'_> {
        WriteTransaction {
            store: self,
            writes: BTreeMap::new(),
        }
    }

    /// Apply a transaction's writes and return how to undo them.
    pub fn commit(&self, tx: WriteTransaction<'_>) -> UndoLog {
        let mut undo = UndoLog::default();
        let mut touched = Vec::with_capacity(tx.writes.len());
        {
            let mut data = self.lock();
            for (key, value) in tx.writes {
                let previous = match value {
                    Some(value) => data.insert(key.clone(), value),
                    None => data.remove(&key),
                };
                undo.entries.push((key.clone(), previous));
                touched.push(key);
            }
        }
        self.publish(touched);
        undo
    }

    /// Restore the values an undo log captured, newest write first.
    pub fn revert(&self, undo: &UndoLog) {
        if undo.is_empty() {
            return;
        }
        let mut touched = Vec::with_capacity(undo.entries.len());
        {
            let mut data = self.lock();
            for (key, previous) in undo.entries.iter().rev() {
                match previous {
                    Some(value) => data.insert(key.clone(), value.clone()),
                    None => data.remove(key),
                };
                touched.push(key.clone());
            }
        }
        self.publish(touched);
    }

    /// Apply an authoritative patch from a pull.
    pub fn apply_patch(&self, patch: &[PatchOperation]) {
        let mut touched = Vec::new();
        {
            let mut data = self.lock();
            for op in patch {
                match op {
                    PatchOperation::Put { key, value } => {
                        data.insert(key.clone(), value.clone());
                        touched.push(key.clone());
                    }
                    PatchOperation::Del { key } => {
                        if data.remove(key).is_some() {
                            touched.push(key.clone());
                        }
                    }
                    PatchOperation::Clear => {
                        touched.extend(std::mem::take(&mut *data).into_keys());
                    }
                }
            }
        }
        touched.sort();
        touched.dedup();
        self.publish(touched);
    }
}

/// Buffered writes over a [`LocalStore`].
pub struct WriteTransaction<'a> {
    store: &'a LocalStore,
    /// `None` marks a delete.
    writes: BTreeMap<String, Option<Value>>,
}

impl WriteTransaction<'_> {
    pub fn get(&self, key: &str) -> Option<Value> {
        match self.writes.get(key) {
            Some(write) => write.clone(),
            None => self.store.get(key),
        }
    }

    /// Decode the value under `key` as `T`.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        self.get(key).map(|v| decode(key, v)).transpose()
    }

    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn put(&mut self, key: impl Into<String>, value: Value) {
        self.writes.insert(key.into(), Some(value));
    }

    /// Encode and write a record.
    pub fn put_as<T: Serialize>(&mut self, key: impl Into<String>, value: &T) -> Result<(), StoreError> {
        let key = key.into();
        let value = serde_json::to_value(value).map_err(|e| StoreError::Encode {
            key: key.clone(),
            reason: e.to_string(),
        })?;
        self.put(key, value);
        Ok(())
    }

    /// Delete a key. Returns whether it existed.
    pub fn del(&mut self, key: &str) -> bool {
        let existed = self.has(key);
        self.writes.insert(key.to_string(), None);
        existed
    }

    /// Entries under `prefix` as this transaction sees them.
    pub fn scan_prefix(&self, prefix: &str) -> Vec<(String, Value)> {
        let mut merged: BTreeMap<String, Value> = self.store.scan_prefix(prefix).into_iter().collect();
        for (key, write) in self.writes.range(prefix.to_string()..) {
            if !key.starts_with(prefix) {
                break;
            }
            match write {
                Some(value) => merged.insert(key.clone(), value.clone()),
                None => merged.remove(key),
            };
        }
        merged.into_iter().collect()
    }
}

fn decode<T: DeserializeOwned>(key: &str, value: Value) -> Result<T, StoreError> {
    serde_json::from_value(value).map_err(|e| StoreError::Decode {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_transaction_reads_own_writes() {
        let store = LocalStore::new();
        let mut tx = store.transaction();
        tx.put("task/1", json!({"title": "a"}));
        assert_eq!(tx.get("task/1"), Some(json!({"title": "a"})));
        assert!(store.get("task/1").is_none());

        store.commit(tx);
        assert_eq!(store.get("task/1"), Some(json!({"title": "a"})));
    }

    #[test]
    fn test_revert_restores_previous_values() {
        let store = LocalStore::new();
        let mut tx = store.transaction();
        tx.put("task/1", json!(1));
        store.commit(tx);

        let mut tx = store.transaction();
        tx.put("task/1", json!(2));
        tx.put("task/2", json!(3));
        let undo = store.commit(tx);
        assert_eq!(undo.len(), 2);

        store.revert(&undo);
        assert_eq!(store.get("task/1"), Some(json!(1)));
        assert!(!store.has("task/2"));
    }

    #[test]
    fn test_empty_transaction_reverts_to_nothing() {
        let store = LocalStore::new();
        let mut tx = store.transaction();
        tx.put("task/1", json!(1));
        store.commit(tx);

        let undo = store.commit(store.transaction());
        assert!(undo.is_empty());
        store.revert(&undo);
        assert_eq!(store.get("task/1"), Some(json!(1)));
    }

    #[test]
    fn test_delete_then_revert() {
        let store = LocalStore::new();
        let mut tx = store.transaction();
        tx.put("item/1", json!("x"));
        store.commit(tx);

        let mut tx = store.transaction();
        assert!(tx.del("item/1"));
        assert!(!tx.has("item/1"));
        let undo = store.commit(tx);
        assert!(store.is_empty());

        store.revert(&undo);
        assert_eq!(store.get("item/1"), Some(json!("x")));
    }

    #[test]
    fn test_scan_prefix_merges_buffered_writes() {
        let store = LocalStore::new();
        let mut tx = store.transaction();
        tx.put("item/1", json!(1));
        tx.put("item/2", json!(2));
        tx.put("list/1", json!(0));
        store.commit(tx);

        let mut tx = store.transaction();
        tx.del("item/1");
        tx.put("item/3", json!(3));
        let keys: Vec<_> = tx.scan_prefix("item/").into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["item/2", "item/3"]);
        assert_eq!(store.scan_prefix("item/").len(), 2);
    }

    #[test]
    fn test_apply_patch() {
        let store = LocalStore::new();
        let mut tx = store.transaction();
        tx.put("task/old", json!(0));
        store.commit(tx);

        store.apply_patch(&[
            PatchOperation::Clear,
            PatchOperation::Put {
                key: "task/1".into(),
                value: json!({"title": "server"}),
            },
            PatchOperation::Put {
                key: "task/2".into(),
                value: json!({"title": "gone"}),
            },
            PatchOperation::Del {
                key: "task/2".into(),
            },
        ]);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("task/1"), Some(json!({"title": "server"})));
    }

    #[test]
    fn test_subscribers_see_changed_keys() {
        let store = LocalStore::new();
        let mut rx = store.subscribe();

        let mut tx = store.transaction();
        tx.put("task/1", json!(1));
        store.commit(tx);
        assert_eq!(rx.try_recv().unwrap().keys, vec!["task/1".to_string()]);

        // Empty transactions are silent.
        store.commit(store.transaction());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_get_as_reports_decode_errors() {
        let store = LocalStore::new();
        let mut tx = store.transaction();
        tx.put("n", json!("not a number"));
        store.commit(tx);
        assert!(matches!(store.get_as::<u32>("n"), Err(StoreError::Decode { .. })));
        assert_eq!(store.get_as::<u32>("missing"), Ok(None));
    }
}
