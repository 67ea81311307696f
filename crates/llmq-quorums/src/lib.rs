//! LLMQ Quorums - mined commitments and the quorums they define
//!
//! - `CommitmentLedger`: mineable pool, per-block commitment rules and the
//!   persistent record of mined commitments
//! - `Quorum`: members and keys of one mined quorum
//! - `QuorumManager`: quorum building, caching and scanning, connection
//!   upkeep, signing-quorum selection and recovered-signature checks
//! - `chainlock`: request ids and aggregated chain-lock verification
//! - `LlmqContext`: one node's complete subsystem and its lifecycle

/// Aggregated chain-lock verification
pub mod chainlock;

/// Subsystem wiring
pub mod context;

/// Mineable and mined commitments
pub mod ledger;

/// Quorum building and scanning
pub mod manager;

/// Quorum objects
pub mod quorum;

/// Signing-quorum selection
pub mod signing;

pub use chainlock::chainlock_request_id;
pub use context::LlmqContext;
pub use ledger::CommitmentLedger;
pub use manager::{QuorumManager, QuorumManagerDeps, QUORUM_CACHE_SIZE};
pub use quorum::Quorum;
pub use signing::{build_sign_hash, RecoveredSigVerdict};
