//! Collaborator interfaces consumed by the quorum subsystem.
//!
//! The block index, the deterministic masternode list and the peer-to-peer
//! layer are owned elsewhere. These traits describe the slice of each that
//! quorum code relies on. Implementations must be cheap to call and must not
//! call back into the quorum subsystem while holding their own locks.

use crate::bls::{PublicKey, SecretKey};
use crate::params::LlmqType;
use crate::Hash256;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Immutable reference to an indexed block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockRef {
    /// Block hash
    pub hash: Hash256,
    /// Height on its chain
    pub height: u32,
}

impl BlockRef {
    /// Construct a block reference.
    pub fn new(hash: Hash256, height: u32) -> Self {
        Self { hash, height }
    }
}

/// Read-only view of the block index and active chain.
pub trait ChainView: Send + Sync {
    /// Tip of the active chain.
    fn tip(&self) -> Option<BlockRef>;

    /// Look up any indexed block, active or not.
    fn block_by_hash(&self, hash: &Hash256) -> Option<BlockRef>;

    /// Ancestor of `block` at `height` (the block itself when heights match).
    fn ancestor(&self, block: &BlockRef, height: u32) -> Option<BlockRef>;

    /// Block at `height` on the active chain.
    fn block_at_height(&self, height: u32) -> Option<BlockRef> {
        let tip = self.tip()?;
        if height > tip.height {
            return None;
        }
        self.ancestor(&tip, height)
    }

    /// Whether `block` is part of the active chain.
    fn is_active(&self, block: &BlockRef) -> bool {
        self.block_at_height(block.height)
            .is_some_and(|b| b.hash == block.hash)
    }
}

/// A registered masternode as seen by quorum code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Masternode {
    /// Registration transaction hash; the stable member identity
    pub pro_tx_hash: Hash256,
    /// Operator key used to sign DKG messages and encrypt shares
    pub operator_key: PublicKey,
}

/// Identity of the local masternode, when running as one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveMasternode {
    /// Our registration hash
    pub pro_tx_hash: Hash256,
    /// Our operator secret key
    pub operator_key: SecretKey,
}

impl ActiveMasternode {
    /// The public half as it appears in the masternode list.
    pub fn to_masternode(&self) -> Masternode {
        Masternode {
            pro_tx_hash: self.pro_tx_hash,
            operator_key: self.operator_key.public_key(),
        }
    }
}

/// Deterministic masternode list snapshots.
pub trait MasternodeListProvider: Send + Sync {
    /// Valid masternodes as of `block`. Must be a pure function of chain
    /// state at that block.
    fn valid_masternodes(&self, block: &BlockRef) -> Vec<Masternode>;
}

/// Opaque peer handle assigned by the network layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer={}", self.0)
    }
}

/// Inbound and relayed message kinds handled by the subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    /// DKG contribution (vvec + encrypted shares)
    Contribution,
    /// DKG complaint
    Complaint,
    /// DKG justification
    Justification,
    /// DKG premature commitment
    PrematureCommitment,
    /// Final commitment ready to be mined
    FinalCommitment,
}

impl MessageKind {
    /// Short network command name.
    pub fn command(&self) -> &'static str {
        match self {
            Self::Contribution => "qcontrib",
            Self::Complaint => "qcomplaint",
            Self::Justification => "qjustify",
            Self::PrematureCommitment => "qpcommit",
            Self::FinalCommitment => "qfcommit",
        }
    }
}

/// Outbound half of the peer-to-peer layer.
pub trait PeerMessenger: Send + Sync {
    /// Relay a payload to interested peers.
    fn relay(&self, kind: MessageKind, payload: Vec<u8>);

    /// Report protocol misbehaviour of a peer.
    fn misbehaving(&self, peer: PeerId, score: u32, reason: &str);

    /// Ask the connection manager to keep connections to quorum members.
    fn set_quorum_nodes(&self, _llmq_type: LlmqType, _quorum_hash: Hash256, _members: BTreeSet<Hash256>) {}

    /// Quorums the connection manager currently keeps connections for.
    fn quorum_nodes(&self, _llmq_type: LlmqType) -> BTreeSet<Hash256> {
        BTreeSet::new()
    }

    /// Drop connections kept for a quorum.
    fn remove_quorum_nodes(&self, _llmq_type: LlmqType, _quorum_hash: Hash256) {}
}

/// Inbound half: something that accepts raw payloads from peers.
pub trait MessageHandler: Send + Sync {
    /// Accept a payload. Must only enqueue or do cheap work.
    fn process_message(&self, peer: PeerId, kind: MessageKind, payload: &[u8]);
}
