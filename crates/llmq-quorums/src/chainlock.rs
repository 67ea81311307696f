//! Aggregated chain-lock signatures.
//!
//! Every active quorum signs the request `chainlock_request_id(height,
//! quorum_hash)` over the locked block hash. A chain-lock carries one signer
//! bit per scanned quorum (newest first) and the aggregate of the signing
//! quorums' recovered signatures; a majority of the active quorums must
//! have signed.

use crate::manager::QuorumManager;
use crate::signing::build_sign_hash;
use llmq_core::{BitSet, Hash256, HashWriter, PublicKey, Signature};
use tracing::debug;

const CLSIG_REQUEST_ID_PREFIX: &str = "clsig";

/// Request id a quorum signs for the chain-lock at `height`.
pub fn chainlock_request_id(height: u32, quorum_hash: &Hash256) -> Hash256 {
    let mut w = HashWriter::new();
    w.write_str(CLSIG_REQUEST_ID_PREFIX)
        .write_u32(height)
        .write_hash(quorum_hash);
    w.finish()
}

impl QuorumManager {
    /// Verify an aggregated chain-lock of `block_hash` at `height`.
    pub fn verify_aggregated_chain_lock(
        &self,
        block_hash: &Hash256,
        height: u32,
        signers: &BitSet,
        sig: &Signature,
    ) -> bool {
        let active = self.params().signing_active_quorum_count;
        if signers.len() != active {
            debug!(%block_hash, signers = signers.len(), "Chain-lock signer set has wrong size");
            return false;
        }
        if signers.count_ones() < active / 2 + 1 {
            debug!(%block_hash, signers = signers.count_ones(), "Chain-lock has too few signers");
            return false;
        }
        let Some(block) = self.chain().block_by_hash(block_hash) else {
            debug!(%block_hash, "Chain-lock for unknown block");
            return false;
        };
        if block.height != height {
            debug!(%block_hash, height, actual = block.height, "Chain-lock height mismatch");
            return false;
        }

        let quorums = self.scan_quorums(&block, active);
        if quorums.is_empty() {
            return false;
        }
        let mut keys: Vec<PublicKey> = Vec::with_capacity(quorums.len());
        let mut hashes: Vec<Hash256> = Vec::with_capacity(quorums.len());
        for (i, quorum) in quorums.iter().enumerate() {
            if !signers.get(i) {
                continue;
            }
            let Some(pk) = quorum.quorum_public_key() else {
                return false;
            };
            let request_id = chainlock_request_id(height, &quorum.quorum_hash());
            keys.push(pk);
            hashes.push(build_sign_hash(&quorum.quorum_hash(), &request_id, block_hash));
        }
        // Signer bits beyond the scanned quorums have nothing to check against
        if keys.len() != signers.count_ones() {
            debug!(%block_hash, scanned = quorums.len(), "Chain-lock signers without an active quorum");
            return false;
        }
        sig.verify_aggregated(&keys, &hashes)
    }
}
