//! LLMQ Core - shared primitives for long-living masternode quorums
//!
//! Everything the quorum subsystem agrees on bit-for-bit lives here:
//!
//! - `Hash256` / `HashWriter`: double-SHA-256 digests
//! - `BitSet`: signer and valid-member sets with their wire encoding
//! - `bls`: BLS12-381 keys, signatures and secret-sharing arithmetic
//! - `FinalCommitment`: the mined DKG result and its validation rules
//! - `LlmqParams` / `LlmqConfig`: quorum type parameters and runtime knobs
//! - `provider`: collaborator traits for chain, masternode list and peers
//! - `QuorumMembers`: deterministic member selection
//! - `connections`: relay ring and outbound-connection choice
//! - `InterruptToken` / `TaskRegistry`: cooperative shutdown

/// Fixed-length membership bit vectors
pub mod bitset;

/// BLS keys, signatures and share arithmetic
pub mod bls;

/// Wire helpers for fixed-layout payloads
pub mod codec;

/// Intra-quorum connection topology
pub mod connections;

/// Final commitment type and validation
pub mod commitment;

/// Unified error handling
pub mod errors;

/// Double-SHA-256 hashes
pub mod hash;

/// Interrupt flag shared by all tasks
pub mod interrupt;

/// Deterministic quorum membership
pub mod members;

/// Quorum parameters and configuration
pub mod params;

/// Collaborator interfaces
pub mod provider;

/// Background task tracking
pub mod runtime;

pub use bitset::BitSet;
pub use bls::{BlsId, PublicKey, SecretKey, Signature, VerificationVector};
pub use commitment::{build_commitment_hash, FinalCommitment, COMMITMENT_VERSION};
pub use errors::{LlmqError, Result};
pub use hash::{Hash256, HashWriter};
pub use interrupt::InterruptToken;
pub use members::QuorumMembers;
pub use params::{ChainLockParams, LlmqConfig, LlmqParams, LlmqType};
pub use provider::{
    ActiveMasternode, BlockRef, ChainView, Masternode, MasternodeListProvider, MessageHandler, MessageKind, PeerId,
    PeerMessenger,
};
pub use runtime::TaskRegistry;
