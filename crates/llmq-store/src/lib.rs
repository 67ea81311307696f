//! LLMQ Store - persistence for quorum state
//!
//! - `KeyValueStore`: ordered byte map with atomic batches, the only thing
//!   the subsystem asks of the node database
//! - `MemoryStore`: in-memory backend with failure injection
//! - `BoundedPersistentCache`: FIFO-bounded write-back cache with erase
//!   tombstones and chunked flushing

/// FIFO-bounded write-back cache
pub mod cache;

/// Store trait and in-memory backend
pub mod store;

pub use cache::{BoundedPersistentCache, CacheLockGuard, DEFAULT_FLUSH_CHUNK_SIZE};
pub use store::{BatchOp, KeyValueStore, MemoryStore, WriteBatch};
