//! Signing-quorum selection and recovered-signature verification.
//!
//! Signers and verifiers must agree on the quorum responsible for a request
//! without talking to each other. Both scan the same window of active
//! quorums below the signing height and pick the one whose
//! `sha256d(quorum_hash || selection_hash)` is smallest.

use crate::manager::QuorumManager;
use crate::quorum::Quorum;
use llmq_core::{Hash256, HashWriter, Signature};
use std::sync::Arc;
use tracing::trace;

/// Hash a quorum signs for request `id` over `msg_hash`.
pub fn build_sign_hash(quorum_hash: &Hash256, id: &Hash256, msg_hash: &Hash256) -> Hash256 {
    let mut w = HashWriter::new();
    w.write_hash(quorum_hash).write_hash(id).write_hash(msg_hash);
    w.finish()
}

/// Outcome of [`QuorumManager::verify_recovered_sig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecoveredSigVerdict {
    /// No quorum is responsible at that height
    NoQuorum,
    /// The signature does not verify under the selected quorum's key
    Invalid,
    /// The signature verifies
    Valid,
}

impl QuorumManager {
    /// Quorum responsible for `selection_hash` at `sign_height` (the tip
    /// when `None`), chosen among the `signing_active_quorum_count` quorums
    /// at or below `sign_height - sign_offset`.
    pub fn select_quorum_for_signing(
        &self,
        selection_hash: &Hash256,
        sign_height: Option<u32>,
        sign_offset: u32,
    ) -> Option<Arc<Quorum>> {
        let chain = self.chain();
        let tip = chain.tip()?;
        let sign_height = sign_height.unwrap_or(tip.height);
        let start_height = sign_height.checked_sub(sign_offset)?;
        if start_height > tip.height {
            return None;
        }
        let start = chain.block_at_height(start_height)?;

        let pool_size = self.params().signing_active_quorum_count;
        self.scan_quorums(&start, pool_size)
            .into_iter()
            .min_by_key(|quorum| {
                let mut w = HashWriter::new();
                w.write_hash(&quorum.quorum_hash()).write_hash(selection_hash);
                w.finish()
            })
    }

    /// Check a recovered signature for request `id` over `msg_hash` against
    /// the quorum selected by `id` at `signed_at_height`.
    pub fn verify_recovered_sig(
        &self,
        signed_at_height: Option<u32>,
        id: &Hash256,
        msg_hash: &Hash256,
        sig: &Signature,
        sign_offset: u32,
    ) -> RecoveredSigVerdict {
        let Some(quorum) = self.select_quorum_for_signing(id, signed_at_height, sign_offset) else {
            return RecoveredSigVerdict::NoQuorum;
        };
        let Some(quorum_public_key) = quorum.quorum_public_key() else {
            return RecoveredSigVerdict::NoQuorum;
        };
        let sign_hash = build_sign_hash(&quorum.quorum_hash(), id, msg_hash);
        trace!(quorum_hash = %quorum.quorum_hash(), %id, %sign_hash, "Verifying recovered signature");
        if self.worker().verify_sig_sync(*sig, quorum_public_key, sign_hash) {
            RecoveredSigVerdict::Valid
        } else {
            RecoveredSigVerdict::Invalid
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn hash_of(seed: u64) -> Hash256 {
        Hash256::sha256d(&seed.to_le_bytes())
    }

    proptest! {
        #[test]
        fn prop_sign_hash_binds_every_input(a in any::<u64>(), b in any::<u64>(), c in any::<u64>(), other in any::<u64>()) {
            prop_assume!(other != a && other != b && other != c);
            let (q, id, msg) = (hash_of(a), hash_of(b), hash_of(c));
            let base = build_sign_hash(&q, &id, &msg);
            prop_assert_ne!(base, build_sign_hash(&hash_of(other), &id, &msg));
            prop_assert_ne!(base, build_sign_hash(&q, &hash_of(other), &msg));
            prop_assert_ne!(base, build_sign_hash(&q, &id, &hash_of(other)));
        }
    }
}
