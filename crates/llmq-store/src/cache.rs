//! FIFO-bounded write-back cache over a [`KeyValueStore`].
//!
//! Writes and erases are buffered in memory and reach the store only on
//! [`BoundedPersistentCache::flush_cache_to_disk`]. The write buffer is
//! bounded: once it holds more than `bound` entries the oldest insertion is
//! dropped without being persisted (rewriting a key moves it to the newest
//! position, reads never do). Owners that cannot afford to lose entries
//! flush before the bound is reached, or rebuild through
//! `get_map_cache_copy` / `wipe` / `restore_caches`.
//!
//! Erases leave a tombstone and raise a flush-before-read flag, so the next
//! read or existence check first pushes pending changes to the store and can
//! never observe a value that was erased in memory but not yet on disk.
//!
//! Flushing is chunked: each chunk is one atomic store batch, and the flush
//! as a whole is not. A failure leaves every unflushed entry pending.
//!
//! # Locking
//!
//! All state sits behind one `parking_lot::ReentrantMutex`, so compound
//! operations (read triggering a flush, restore re-running writes) can
//! re-enter. [`BoundedPersistentCache::lock`] exposes the guard for callers
//! that must hold several caches at once.

use crate::store::{KeyValueStore, WriteBatch};
use indexmap::{IndexMap, IndexSet};
use llmq_core::Result;
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::cell::RefCell;
use std::hash::Hash;
use std::sync::Arc;
use tracing::{debug, trace};

/// Default number of items per store batch when flushing.
pub const DEFAULT_FLUSH_CHUNK_SIZE: usize = 256;

struct CacheState<K, V> {
    entries: IndexMap<K, V>,
    erased: IndexSet<K>,
    flush_on_next_read: bool,
}

/// Guard proving the cache lock is held. Re-entrant on the same thread.
pub struct CacheLockGuard<'a, K, V> {
    _guard: ReentrantMutexGuard<'a, RefCell<CacheState<K, V>>>,
}

/// Write-back cache with FIFO eviction and erase tombstones.
pub struct BoundedPersistentCache<K, V> {
    name: String,
    prefix: Vec<u8>,
    bound: usize,
    chunk_size: usize,
    store: Arc<dyn KeyValueStore>,
    state: ReentrantMutex<RefCell<CacheState<K, V>>>,
}

impl<K, V> BoundedPersistentCache<K, V>
where
    K: Serialize + Eq + Hash + Clone,
    V: Serialize + DeserializeOwned + Clone,
{
    /// Cache named `name` whose keys live under `name/` in `store`.
    /// A `bound` of zero disables eviction.
    pub fn new(name: impl Into<String>, store: Arc<dyn KeyValueStore>, bound: usize) -> Self {
        let name = name.into();
        let mut prefix = name.as_bytes().to_vec();
        prefix.push(b'/');
        Self {
            name,
            prefix,
            bound,
            chunk_size: DEFAULT_FLUSH_CHUNK_SIZE,
            store,
            state: ReentrantMutex::new(RefCell::new(CacheState {
                entries: IndexMap::new(),
                erased: IndexSet::new(),
                flush_on_next_read: false,
            })),
        }
    }

    /// Override the flush chunk size (minimum 1).
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Cache name, used in logs and as key namespace.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configured FIFO bound.
    pub fn bound(&self) -> usize {
        self.bound
    }

    /// Hold the cache lock until the guard is dropped.
    pub fn lock(&self) -> CacheLockGuard<'_, K, V> {
        CacheLockGuard {
            _guard: self.state.lock(),
        }
    }

    fn store_key(&self, key: &K) -> Result<Vec<u8>> {
        let mut out = self.prefix.clone();
        out.extend(bincode::serialize(key)?);
        Ok(out)
    }

    /// Read `key`, from memory if buffered, otherwise from the store.
    pub fn read_cache(&self, key: &K) -> Result<Option<V>> {
        let guard = self.state.lock();
        self.flush_if_requested(&guard)?;
        {
            let state = guard.borrow();
            if let Some(v) = state.entries.get(key) {
                return Ok(Some(v.clone()));
            }
            if state.erased.contains(key) {
                return Ok(None);
            }
        }
        match self.store.read(&self.store_key(key)?)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Whether `key` exists in memory or in the store.
    pub fn exists_cache(&self, key: &K) -> Result<bool> {
        let guard = self.state.lock();
        self.flush_if_requested(&guard)?;
        {
            let state = guard.borrow();
            if state.entries.contains_key(key) {
                return Ok(true);
            }
            if state.erased.contains(key) {
                return Ok(false);
            }
        }
        self.store.exists(&self.store_key(key)?)
    }

    /// Buffer a write of `key`, moving it to the newest position.
    pub fn write_cache(&self, key: K, value: V) {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        state.entries.shift_remove(&key);
        state.erased.shift_remove(&key);
        state.entries.insert(key, value);
        if self.bound > 0 && state.entries.len() > self.bound {
            state.entries.shift_remove_index(0);
            trace!(cache = %self.name, bound = self.bound, "Evicted oldest unflushed entry");
        }
    }

    /// Buffer an erase of `key`.
    pub fn erase_cache(&self, key: &K) {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        state.flush_on_next_read = true;
        state.entries.shift_remove(key);
        state.erased.insert(key.clone());
    }

    /// Whether buffered writes plus tombstones reached the bound.
    pub fn is_cache_full(&self) -> bool {
        let guard = self.state.lock();
        let state = guard.borrow();
        self.bound > 0 && state.entries.len() + state.erased.len() >= self.bound
    }

    /// Buffered writes.
    pub fn pending_writes(&self) -> usize {
        self.state.lock().borrow().entries.len()
    }

    /// Buffered tombstones.
    pub fn pending_erases(&self) -> usize {
        self.state.lock().borrow().erased.len()
    }

    /// Snapshot of buffered writes, oldest first. Flushes first if an erase
    /// is pending.
    pub fn get_map_cache_copy(&self) -> Result<IndexMap<K, V>> {
        let guard = self.state.lock();
        self.flush_if_requested(&guard)?;
        let copy = guard.borrow().entries.clone();
        Ok(copy)
    }

    /// Snapshot of buffered tombstones.
    pub fn get_erase_cache_copy(&self) -> IndexSet<K> {
        self.state.lock().borrow().erased.clone()
    }

    /// Re-apply snapshots taken with the copy methods.
    pub fn restore_caches(&self, entries: IndexMap<K, V>, erased: IndexSet<K>) {
        let guard = self.state.lock();
        for (k, v) in entries {
            self.write_cache(k, v);
        }
        guard.borrow_mut().erased = erased;
    }

    /// Persist the default chunk size worth of items per batch.
    pub fn flush_cache_to_disk(&self) -> Result<()> {
        self.flush_cache_to_disk_chunked(self.chunk_size)
    }

    /// Persist buffered writes and erases, `chunk_size` items per batch.
    pub fn flush_cache_to_disk_chunked(&self, chunk_size: usize) -> Result<()> {
        let chunk_size = chunk_size.max(1);
        let guard = self.state.lock();

        let (writes, erases) = {
            let state = guard.borrow();
            if state.entries.is_empty() && state.erased.is_empty() {
                drop(state);
                guard.borrow_mut().flush_on_next_read = false;
                return Ok(());
            }
            let writes: Vec<(K, V)> = state.entries.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            let erases: Vec<K> = state.erased.iter().cloned().collect();
            (writes, erases)
        };
        let total_writes = writes.len();
        let total_erases = erases.len();

        enum Item<K, V> {
            Write(K, V),
            Erase(K),
        }
        let items: Vec<Item<K, V>> = writes
            .into_iter()
            .map(|(k, v)| Item::Write(k, v))
            .chain(erases.into_iter().map(Item::Erase))
            .collect();

        for chunk in items.chunks(chunk_size) {
            let mut batch = WriteBatch::new();
            for item in chunk {
                match item {
                    Item::Write(k, v) => batch.put(self.store_key(k)?, bincode::serialize(v)?),
                    Item::Erase(k) => batch.delete(self.store_key(k)?),
                }
            }
            if let Err(err) = self.store.write_batch(batch) {
                debug!(cache = %self.name, error = %err, "Cache flush failed, keeping remaining entries");
                return Err(err);
            }
            let mut state = guard.borrow_mut();
            for item in chunk {
                match item {
                    Item::Write(k, _) => {
                        state.entries.shift_remove(k);
                    }
                    Item::Erase(k) => {
                        state.erased.shift_remove(k);
                    }
                }
            }
        }

        guard.borrow_mut().flush_on_next_read = false;
        debug!(
            cache = %self.name,
            stored = total_writes,
            erased = total_erases,
            "Flushed cache to disk"
        );
        Ok(())
    }

    /// Number of entries persisted under this cache's namespace.
    pub fn count_persisted_entries(&self) -> Result<usize> {
        Ok(self.store.iter_prefix(&self.prefix)?.len())
    }

    /// Delete everything persisted under this namespace and drop all
    /// buffered state.
    pub fn wipe(&self) -> Result<()> {
        let guard = self.state.lock();
        let mut batch = WriteBatch::new();
        for (k, _) in self.store.iter_prefix(&self.prefix)? {
            batch.delete(k);
        }
        let removed = batch.len();
        if !batch.is_empty() {
            self.store.write_batch(batch)?;
        }
        let mut state = guard.borrow_mut();
        state.entries.clear();
        state.erased.clear();
        state.flush_on_next_read = false;
        debug!(cache = %self.name, removed, "Wiped cache");
        Ok(())
    }

    fn flush_if_requested(&self, guard: &ReentrantMutexGuard<'_, RefCell<CacheState<K, V>>>) -> Result<()> {
        if guard.borrow().flush_on_next_read {
            trace!(cache = %self.name, "Flushing cache before read");
            self.flush_cache_to_disk()?;
        }
        Ok(())
    }
}

impl<K, V> std::fmt::Debug for BoundedPersistentCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedPersistentCache")
            .field("name", &self.name)
            .field("bound", &self.bound)
            .finish_non_exhaustive()
    }
}
