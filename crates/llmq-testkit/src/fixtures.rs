//! A fully dealt quorum with a valid final commitment.
//!
//! Every member deals a polynomial to every other member, exactly as a
//! successful DKG round would, so tests can feed the per-dealer material
//! into contribution storage or use the aggregate directly.

use llmq_core::bls::{aggregate_verification_vectors, verification_vector_hash};
use llmq_core::{
    build_commitment_hash, ActiveMasternode, BitSet, BlockRef, BlsId, FinalCommitment, Hash256, LlmqParams,
    Masternode, PublicKey, SecretKey, Signature, VerificationVector, COMMITMENT_VERSION,
};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;

/// Result of an honest DKG among `members`.
#[derive(Debug, Clone)]
pub struct QuorumFixture {
    /// Quorum parameters
    pub params: LlmqParams,
    /// Quorum block
    pub quorum: BlockRef,
    /// Members in quorum order
    pub members: Vec<ActiveMasternode>,
    /// Verification vector dealt by each member
    pub dealer_vvecs: Vec<VerificationVector>,
    /// `dealt_shares[dealer][recipient]`
    pub dealt_shares: Vec<Vec<SecretKey>>,
    /// Aggregate verification vector
    pub quorum_vvec: VerificationVector,
    /// Aggregate secret key share of each member
    pub sk_shares: Vec<SecretKey>,
    /// Commitment signed by all members
    pub commitment: FinalCommitment,
}

impl QuorumFixture {
    /// Deal a quorum deterministically from `seed`. `members` must be in
    /// quorum order.
    pub fn new(params: &LlmqParams, quorum: BlockRef, members: Vec<ActiveMasternode>, seed: u64) -> Self {
        let mut rng = ChaCha20Rng::seed_from_u64(seed);
        let ids: Vec<BlsId> = members.iter().map(|m| BlsId::from_hash(&m.pro_tx_hash)).collect();

        let mut dealer_vvecs = Vec::with_capacity(members.len());
        let mut dealt_shares = Vec::with_capacity(members.len());
        for _ in &members {
            let poly = SecretKey::random_polynomial(&mut rng, params.threshold);
            dealer_vvecs.push(poly.iter().map(SecretKey::public_key).collect::<VerificationVector>());
            dealt_shares.push(
                ids.iter()
                    .map(|id| SecretKey::share_for(&poly, id).unwrap())
                    .collect::<Vec<_>>(),
            );
        }

        let quorum_vvec = aggregate_verification_vectors(&dealer_vvecs).unwrap();
        let sk_shares: Vec<SecretKey> = (0..members.len())
            .map(|j| {
                let column: Vec<SecretKey> = dealt_shares.iter().map(|row| row[j].clone()).collect();
                SecretKey::aggregate(&column).unwrap()
            })
            .collect();

        let all = 0..members.len();
        let valid_members = BitSet::from_indexes(params.size, all.clone());
        let quorum_public_key = quorum_vvec[0];
        let quorum_vvec_hash = verification_vector_hash(&quorum_vvec);
        let commitment_hash = build_commitment_hash(&quorum.hash, &valid_members, &quorum_public_key, &quorum_vvec_hash);

        let operator_keys: Vec<PublicKey> = members.iter().map(|m| m.operator_key.public_key()).collect();
        let operator_sigs: Vec<Signature> = members.iter().map(|m| m.operator_key.sign(&commitment_hash)).collect();
        let shares: Vec<(BlsId, Signature)> = ids
            .iter()
            .zip(&sk_shares)
            .take(params.threshold)
            .map(|(id, sk)| (*id, sk.sign(&commitment_hash)))
            .collect();

        let commitment = FinalCommitment {
            version: COMMITMENT_VERSION,
            quorum_hash: quorum.hash,
            signers: BitSet::from_indexes(params.size, all),
            valid_members,
            quorum_public_key: Some(quorum_public_key),
            quorum_vvec_hash,
            quorum_sig: Some(Signature::recover(&shares).unwrap()),
            members_sig: Some(Signature::aggregate_secure(&operator_keys, &operator_sigs).unwrap()),
        };

        Self {
            params: params.clone(),
            quorum,
            members,
            dealer_vvecs,
            dealt_shares,
            quorum_vvec,
            sk_shares,
            commitment,
        }
    }

    /// Public member list.
    pub fn masternodes(&self) -> Vec<Masternode> {
        self.members.iter().map(ActiveMasternode::to_masternode).collect()
    }

    /// Aggregate quorum public key.
    pub fn quorum_public_key(&self) -> PublicKey {
        self.quorum_vvec[0]
    }

    /// Member ids in quorum order.
    pub fn member_ids(&self) -> Vec<BlsId> {
        self.members.iter().map(|m| BlsId::from_hash(&m.pro_tx_hash)).collect()
    }

    /// Threshold signature over `hash`, recovered from the first
    /// `threshold` members' shares.
    pub fn sign(&self, hash: &Hash256) -> Signature {
        let shares: Vec<(BlsId, Signature)> = self
            .member_ids()
            .into_iter()
            .zip(&self.sk_shares)
            .take(self.params.threshold)
            .map(|(id, sk)| (id, sk.sign(hash)))
            .collect();
        Signature::recover(&shares).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MockMasternodeList;

    #[test]
    fn test_fixture_commitment_verifies() {
        let params = LlmqParams::llmq_test();
        let quorum = BlockRef::new(Hash256::sha256d(b"q"), 24);
        let list = MockMasternodeList::generate(8, 1);
        let fixture = QuorumFixture::new(&params, quorum, list.ordered_quorum(&params, &quorum), 7);

        assert!(fixture
            .commitment
            .verify(&quorum, &fixture.masternodes(), &params, true));
        let hash = Hash256::sha256d(b"msg");
        assert!(fixture.sign(&hash).verify(&fixture.quorum_public_key(), &hash));
    }
}
