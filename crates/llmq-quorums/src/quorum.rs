//! A quorum materialized from its mined commitment.

use llmq_core::bls::verification_vector_hash;
use llmq_core::{
    BlockRef, BlsId, FinalCommitment, Hash256, HashWriter, LlmqParams, Masternode, PublicKey, SecretKey,
    VerificationVector,
};
use llmq_crypto::CryptoWorker;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::debug;

#[derive(Default)]
struct QuorumKeys {
    vvec: Option<Arc<VerificationVector>>,
    sk_share: Option<SecretKey>,
}

/// Members and keys of one mined quorum.
///
/// The verification vector and the local secret key share are optional: a
/// node that did not take part in (or observe) the DKG still knows the
/// quorum public key from the commitment and can verify recovered
/// signatures, but cannot derive public key shares or sign.
pub struct Quorum {
    params: LlmqParams,
    quorum_block: BlockRef,
    mined_block_hash: Hash256,
    commitment: FinalCommitment,
    members: Arc<Vec<Masternode>>,
    local: Option<Hash256>,
    worker: Arc<CryptoWorker>,
    keys: RwLock<QuorumKeys>,
}

impl Quorum {
    /// Quorum of `commitment`, mined in `mined_block_hash`. `local` is the
    /// local masternode, if any.
    pub fn new(
        params: LlmqParams,
        quorum_block: BlockRef,
        mined_block_hash: Hash256,
        commitment: FinalCommitment,
        members: Arc<Vec<Masternode>>,
        local: Option<Hash256>,
        worker: Arc<CryptoWorker>,
    ) -> Self {
        Self {
            params,
            quorum_block,
            mined_block_hash,
            commitment,
            members,
            local,
            worker,
            keys: RwLock::new(QuorumKeys::default()),
        }
    }

    /// Quorum parameters.
    pub fn params(&self) -> &LlmqParams {
        &self.params
    }

    /// Hash of the quorum-defining block.
    pub fn quorum_hash(&self) -> Hash256 {
        self.quorum_block.hash
    }

    /// The quorum-defining block.
    pub fn quorum_block(&self) -> BlockRef {
        self.quorum_block
    }

    /// Block the commitment was mined in.
    pub fn mined_block_hash(&self) -> Hash256 {
        self.mined_block_hash
    }

    /// The mined commitment.
    pub fn commitment(&self) -> &FinalCommitment {
        &self.commitment
    }

    /// Members in quorum order.
    pub fn members(&self) -> &[Masternode] {
        &self.members
    }

    /// Aggregate quorum public key.
    pub fn quorum_public_key(&self) -> Option<PublicKey> {
        self.commitment.quorum_public_key
    }

    /// Persistent-cache key: `sha256d(quorum_hash || pro_tx_hash...)`.
    pub fn storage_key(&self) -> Hash256 {
        let mut w = HashWriter::new();
        w.write_hash(&self.quorum_block.hash);
        for mn in self.members.iter() {
            w.write_hash(&mn.pro_tx_hash);
        }
        w.finish()
    }

    /// Whether `pro_tx_hash` is among the members.
    pub fn is_member(&self, pro_tx_hash: &Hash256) -> bool {
        self.members.iter().any(|mn| &mn.pro_tx_hash == pro_tx_hash)
    }

    /// Whether `pro_tx_hash` is a member with its valid bit set.
    pub fn is_valid_member(&self, pro_tx_hash: &Hash256) -> bool {
        self.get_member_index(pro_tx_hash)
            .is_some_and(|idx| self.commitment.valid_members.get(idx))
    }

    /// Position of `pro_tx_hash` in quorum order.
    pub fn get_member_index(&self, pro_tx_hash: &Hash256) -> Option<usize> {
        self.members.iter().position(|mn| &mn.pro_tx_hash == pro_tx_hash)
    }

    /// Whether the aggregate verification vector is known.
    pub fn has_verification_vector(&self) -> bool {
        self.keys.read().vvec.is_some()
    }

    /// Aggregate verification vector, if known.
    pub fn verification_vector(&self) -> Option<Arc<VerificationVector>> {
        self.keys.read().vvec.clone()
    }

    /// Install the aggregate verification vector. Rejected unless it hashes
    /// to the commitment's vvec hash.
    pub fn set_verification_vector(&self, vvec: VerificationVector) -> bool {
        if verification_vector_hash(&vvec) != self.commitment.quorum_vvec_hash {
            debug!(quorum_hash = %self.quorum_block.hash, "Verification vector does not match commitment");
            return false;
        }
        self.keys.write().vvec = Some(Arc::new(vvec));
        true
    }

    /// Public key share of the member at `index`. Requires the verification
    /// vector and a valid member.
    pub fn get_pub_key_share(&self, index: usize) -> Option<PublicKey> {
        let vvec = self.verification_vector()?;
        let member = self.members.get(index)?;
        if !self.commitment.valid_members.get(index) {
            return None;
        }
        self.worker.get_or_build_pub_key_share(
            self.commitment.quorum_vvec_hash,
            &vvec,
            &BlsId::from_hash(&member.pro_tx_hash),
        )
    }

    /// Install the local secret key share. Rejected unless it matches the
    /// local member's public key share.
    pub fn set_secret_key_share(&self, sk_share: SecretKey) -> bool {
        let expected = self
            .local
            .and_then(|local| self.get_member_index(&local))
            .and_then(|idx| self.get_pub_key_share(idx));
        if expected != Some(sk_share.public_key()) {
            return false;
        }
        self.keys.write().sk_share = Some(sk_share);
        true
    }

    /// Local secret key share, if we are a valid member with a built share.
    pub fn get_secret_key_share(&self) -> Option<SecretKey> {
        self.keys.read().sk_share.clone()
    }
}

impl std::fmt::Debug for Quorum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Quorum")
            .field("llmq_type", &self.params.llmq_type)
            .field("quorum_hash", &self.quorum_block.hash)
            .field("height", &self.quorum_block.height)
            .field("valid_members", &self.commitment.count_valid_members())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llmq_testkit::{MockMasternodeList, QuorumFixture};

    fn fixture_quorum(local: Option<usize>) -> (QuorumFixture, Quorum) {
        let params = LlmqParams::llmq_test();
        let block = BlockRef::new(Hash256::sha256d(b"quorum"), 48);
        let list = MockMasternodeList::generate(5, 21);
        let fixture = QuorumFixture::new(&params, block, list.ordered_quorum(&params, &block), 3);
        let quorum = Quorum::new(
            params,
            block,
            Hash256::sha256d(b"mined"),
            fixture.commitment.clone(),
            Arc::new(fixture.masternodes()),
            local.map(|i| fixture.members[i].pro_tx_hash),
            Arc::new(CryptoWorker::new(1).unwrap()),
        );
        (fixture, quorum)
    }

    #[test]
    fn test_membership_queries() {
        let (fixture, quorum) = fixture_quorum(None);
        let second = fixture.members[1].pro_tx_hash;
        assert!(quorum.is_member(&second));
        assert!(quorum.is_valid_member(&second));
        assert_eq!(quorum.get_member_index(&second), Some(1));

        let stranger = Hash256::sha256d(b"stranger");
        assert!(!quorum.is_member(&stranger));
        assert!(!quorum.is_valid_member(&stranger));
        assert_eq!(quorum.get_member_index(&stranger), None);
    }

    #[test]
    fn test_pub_key_share_requires_vvec() {
        let (fixture, quorum) = fixture_quorum(None);
        assert_eq!(quorum.get_pub_key_share(0), None);

        assert!(!quorum.set_verification_vector(fixture.dealer_vvecs[0].clone()));
        assert!(quorum.set_verification_vector(fixture.quorum_vvec.clone()));
        assert_eq!(quorum.get_pub_key_share(2), Some(fixture.sk_shares[2].public_key()));
        assert_eq!(quorum.get_pub_key_share(5), None);
    }

    #[test]
    fn test_secret_key_share_must_match_local_member() {
        let (fixture, quorum) = fixture_quorum(Some(3));
        assert!(quorum.set_verification_vector(fixture.quorum_vvec.clone()));

        assert!(!quorum.set_secret_key_share(fixture.sk_shares[2].clone()));
        assert!(quorum.get_secret_key_share().is_none());
        assert!(quorum.set_secret_key_share(fixture.sk_shares[3].clone()));
        assert_eq!(
            quorum.get_secret_key_share().map(|sk| sk.public_key()),
            Some(fixture.sk_shares[3].public_key())
        );
    }

    #[test]
    fn test_non_member_cannot_hold_a_share() {
        let (fixture, quorum) = fixture_quorum(None);
        assert!(quorum.set_verification_vector(fixture.quorum_vvec.clone()));
        assert!(!quorum.set_secret_key_share(fixture.sk_shares[0].clone()));
    }

    #[test]
    fn test_storage_key_commits_to_members() {
        let (fixture, quorum) = fixture_quorum(None);
        let mut w = HashWriter::new();
        w.write_hash(&fixture.quorum.hash);
        for mn in &fixture.members {
            w.write_hash(&mn.pro_tx_hash);
        }
        assert_eq!(quorum.storage_key(), w.finish());
    }
}
