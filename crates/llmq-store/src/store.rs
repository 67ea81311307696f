//! Persistent key/value store interface.
//!
//! The store is an ordered byte-keyed map with atomic batch writes, the
//! minimum the caches and ledgers need. Production nodes back it with their
//! block database; [`MemoryStore`] serves tests and ephemeral nodes.
//!
//! # Blocking Lock Usage
//!
//! `MemoryStore` uses `parking_lot::RwLock`; every operation is a short,
//! in-memory map access.

use llmq_core::{LlmqError, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// One operation inside a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    /// Insert or overwrite
    Put(Vec<u8>, Vec<u8>),
    /// Remove if present
    Delete(Vec<u8>),
}

/// Ordered set of writes applied all-or-nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    /// Empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an insert.
    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(BatchOp::Put(key, value));
    }

    /// Queue a delete.
    pub fn delete(&mut self, key: Vec<u8>) {
        self.ops.push(BatchOp::Delete(key));
    }

    /// Number of queued operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Consume into the queued operations.
    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }
}

/// Ordered persistent key/value store.
pub trait KeyValueStore: Send + Sync {
    /// Point read.
    fn read(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Existence check.
    fn exists(&self, key: &[u8]) -> Result<bool> {
        Ok(self.read(key)?.is_some())
    }

    /// Apply `batch` atomically.
    fn write_batch(&self, batch: WriteBatch) -> Result<()>;

    /// All entries whose key starts with `prefix`, in key order.
    fn iter_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;
}

/// In-memory store with optional injected write failures.
#[derive(Debug, Default)]
pub struct MemoryStore {
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    // `Some(n)`: the next n batches succeed, later ones fail
    fail_after: Mutex<Option<usize>>,
    batches_written: AtomicUsize,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every batch after the next `n` fail, until cleared.
    pub fn fail_writes_after(&self, n: usize) {
        *self.fail_after.lock() = Some(n);
    }

    /// Stop failing writes.
    pub fn clear_write_failures(&self) {
        *self.fail_after.lock() = None;
    }

    /// Number of batches applied so far.
    pub fn batches_written(&self) -> usize {
        self.batches_written.load(Ordering::SeqCst)
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    /// Whether the store holds nothing.
    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn read(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.map.read().get(key).cloned())
    }

    fn exists(&self, key: &[u8]) -> Result<bool> {
        Ok(self.map.read().contains_key(key))
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<()> {
        {
            let mut fail_after = self.fail_after.lock();
            if let Some(remaining) = fail_after.as_mut() {
                if *remaining == 0 {
                    return Err(LlmqError::storage("injected write failure"));
                }
                *remaining -= 1;
            }
        }
        let mut map = self.map.write();
        for op in batch.into_ops() {
            match op {
                BatchOp::Put(k, v) => {
                    map.insert(k, v);
                }
                BatchOp::Delete(k) => {
                    map.remove(&k);
                }
            }
        }
        self.batches_written.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn iter_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let map = self.map.read();
        Ok(map
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_applies_in_order() {
        let store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        batch.put(b"a".to_vec(), b"1".to_vec());
        batch.delete(b"a".to_vec());
        batch.put(b"b".to_vec(), b"2".to_vec());
        store.write_batch(batch).unwrap();
        assert!(!store.exists(b"a").unwrap());
        assert_eq!(store.read(b"b").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn test_prefix_iteration() {
        let store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        for k in [&b"x/1"[..], b"x/2", b"y/1", b"x"] {
            batch.put(k.to_vec(), vec![]);
        }
        store.write_batch(batch).unwrap();
        let keys: Vec<Vec<u8>> = store.iter_prefix(b"x/").unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![b"x/1".to_vec(), b"x/2".to_vec()]);
    }

    #[test]
    fn test_injected_failure_is_atomic() {
        let store = MemoryStore::new();
        store.fail_writes_after(0);
        let mut batch = WriteBatch::new();
        batch.put(b"k".to_vec(), b"v".to_vec());
        assert!(store.write_batch(batch.clone()).is_err());
        assert!(store.is_empty());
        store.clear_write_failures();
        store.write_batch(batch).unwrap();
        assert_eq!(store.batches_written(), 1);
    }
}
