//! LLMQ Crypto - pooled BLS work
//!
//! - `CryptoWorker`: parallel aggregation, contribution-share checks,
//!   async signing and batched signature verification on a rayon pool
//! - `ResultCache`: at-most-once memoization shared by concurrent callers

/// At-most-once memoization
pub mod result_cache;

/// Batched asynchronous signature verification
pub mod verify_queue;

/// The worker itself
pub mod worker;

pub use result_cache::ResultCache;
pub use verify_queue::SIG_VERIFY_BATCH_SIZE;
pub use worker::{CryptoWorker, WorkerPoolError, CONTRIBUTION_VERIFY_BATCH_SIZE};
