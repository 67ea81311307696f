//! At-most-once memoization keyed by a caller supplied fingerprint.
//!
//! The first caller for a key installs a pending slot, releases the map lock
//! and runs the builder. Concurrent callers for the same key block on the
//! slot's condition variable and receive a clone of the published value.
//! Entries are never evicted.
//!
//! # Blocking Lock Usage
//!
//! The map lock is only held to look up or insert a slot. The slot lock is
//! held while waiting on the condvar, never while the builder runs.

use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

enum SlotState<V> {
    Pending,
    Ready(V),
    // Builder unwound; waiters retry
    Abandoned,
}

struct Slot<V> {
    state: Mutex<SlotState<V>>,
    ready: Condvar,
}

impl<V> Slot<V> {
    fn pending() -> Self {
        Self {
            state: Mutex::new(SlotState::Pending),
            ready: Condvar::new(),
        }
    }
}

/// Memoizes one value per key, building each at most once.
pub struct ResultCache<K, V> {
    slots: Mutex<HashMap<K, Arc<Slot<V>>>>,
}

impl<K, V> Default for ResultCache<K, V> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> ResultCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// Empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the value for `key`, running `builder` if nobody has yet.
    pub fn get_or_build<F>(&self, key: K, builder: F) -> V
    where
        F: FnOnce() -> V,
    {
        let mut builder = Some(builder);
        loop {
            let (slot, owner) = {
                let mut slots = self.slots.lock();
                match slots.get(&key) {
                    Some(slot) => (Arc::clone(slot), false),
                    None => {
                        let slot = Arc::new(Slot::pending());
                        slots.insert(key.clone(), Arc::clone(&slot));
                        (slot, true)
                    }
                }
            };

            if owner {
                let Some(build) = builder.take() else {
                    continue;
                };
                let mut publish = PublishGuard {
                    cache: self,
                    key: &key,
                    slot: &slot,
                    done: false,
                };
                let value = build();
                publish.finish(value.clone());
                return value;
            }

            let mut state = slot.state.lock();
            loop {
                match &*state {
                    SlotState::Ready(v) => return v.clone(),
                    SlotState::Abandoned => break,
                    SlotState::Pending => slot.ready.wait(&mut state),
                }
            }
        }
    }

    /// Published value for `key`, if any.
    pub fn get(&self, key: &K) -> Option<V> {
        let slot = self.slots.lock().get(key).cloned()?;
        let state = slot.state.lock();
        match &*state {
            SlotState::Ready(v) => Some(v.clone()),
            _ => None,
        }
    }

    /// Number of keys with a slot (pending or ready).
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// Whether nothing was ever requested.
    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}

// Publishes the built value, or on unwind removes the slot and wakes
// waiters so one of them can take over.
struct PublishGuard<'a, K: Hash + Eq, V> {
    cache: &'a ResultCache<K, V>,
    key: &'a K,
    slot: &'a Arc<Slot<V>>,
    done: bool,
}

impl<K: Hash + Eq, V> PublishGuard<'_, K, V> {
    fn finish(&mut self, value: V) {
        *self.slot.state.lock() = SlotState::Ready(value);
        self.done = true;
        self.slot.ready.notify_all();
    }
}

impl<K: Hash + Eq, V> Drop for PublishGuard<'_, K, V> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        self.cache.slots.lock().remove(self.key);
        *self.slot.state.lock() = SlotState::Abandoned;
        self.slot.ready.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::time::Duration;

    #[test]
    fn test_builder_runs_once_under_contention() {
        let cache = Arc::new(ResultCache::<u32, u64>::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let calls = Arc::clone(&calls);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    cache.get_or_build(1, || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(20));
                        42
                    })
                })
            })
            .collect();

        for h in handles {
            assert_eq!(h.join().unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.get(&1), Some(42));
    }

    #[test]
    fn test_distinct_keys_build_independently() {
        let cache = ResultCache::<&str, usize>::new();
        assert_eq!(cache.get_or_build("a", || 1), 1);
        assert_eq!(cache.get_or_build("b", || 2), 2);
        assert_eq!(cache.get_or_build("a", || 3), 1);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_panicking_builder_leaves_key_buildable() {
        let cache = ResultCache::<u8, u8>::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            cache.get_or_build(7, || panic!("boom"))
        }));
        assert!(result.is_err());
        assert!(cache.is_empty());
        assert_eq!(cache.get_or_build(7, || 9), 9);
    }
}
