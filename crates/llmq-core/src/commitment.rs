//! Final commitments: the on-chain result of a DKG round.
//!
//! A commitment binds the quorum block hash, the valid-member set, the
//! aggregate quorum public key and the hash of the aggregate verification
//! vector. Two signatures attest to that binding: `members_sig`, a
//! coefficient-weighted aggregate over the operator keys of all signers, and `quorum_sig`, recovered from
//! threshold signature shares and valid under the quorum key itself.
//!
//! Wire layout (all integers little-endian):
//!
//! | field              | bytes                     |
//! |--------------------|---------------------------|
//! | version            | 2                         |
//! | quorum_hash        | 32                        |
//! | signers            | compact size + ceil(n/8)  |
//! | valid_members      | compact size + ceil(n/8)  |
//! | quorum_public_key  | 48                        |
//! | quorum_vvec_hash   | 32                        |
//! | quorum_sig         | 96                        |
//! | members_sig        | 96                        |
//!
//! Absent keys and signatures (null commitments) are encoded as zero bytes.

use crate::bitset::BitSet;
use crate::bls::{PublicKey, Signature, PUBLIC_KEY_LEN, SIGNATURE_LEN};
use crate::codec::Reader;
use crate::params::LlmqParams;
use crate::provider::{BlockRef, Masternode};
use crate::{Hash256, HashWriter, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Commitment format version produced by this implementation.
pub const COMMITMENT_VERSION: u16 = 1;

/// The hash both commitment signatures sign.
pub fn build_commitment_hash(
    quorum_hash: &Hash256,
    valid_members: &BitSet,
    quorum_public_key: &PublicKey,
    quorum_vvec_hash: &Hash256,
) -> Hash256 {
    let mut bits = Vec::new();
    valid_members.encode_dyn(&mut bits);
    let mut w = HashWriter::new();
    w.write_hash(quorum_hash)
        .write(&bits)
        .write(&quorum_public_key.to_bytes())
        .write_hash(quorum_vvec_hash);
    w.finish()
}

/// DKG result as mined into a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalCommitment {
    /// Format version
    pub version: u16,
    /// Hash of the quorum-defining block
    pub quorum_hash: Hash256,
    /// Members whose premature commitments were aggregated
    pub signers: BitSet,
    /// Members that completed the DKG honestly
    pub valid_members: BitSet,
    /// Aggregate quorum public key
    pub quorum_public_key: Option<PublicKey>,
    /// Hash of the aggregate verification vector
    pub quorum_vvec_hash: Hash256,
    /// Recovered threshold signature over the commitment hash
    pub quorum_sig: Option<Signature>,
    /// Aggregated operator signatures of all signers
    pub members_sig: Option<Signature>,
}

impl FinalCommitment {
    /// Null commitment for `quorum_hash`: correct sizes, nothing set.
    pub fn null(params: &LlmqParams, quorum_hash: Hash256) -> Self {
        Self {
            version: COMMITMENT_VERSION,
            quorum_hash,
            signers: BitSet::new(params.size),
            valid_members: BitSet::new(params.size),
            quorum_public_key: None,
            quorum_vvec_hash: Hash256::ZERO,
            quorum_sig: None,
            members_sig: None,
        }
    }

    /// Number of set signer bits.
    pub fn count_signers(&self) -> usize {
        self.signers.count_ones()
    }

    /// Number of set valid-member bits.
    pub fn count_valid_members(&self) -> usize {
        self.valid_members.count_ones()
    }

    /// Whether this carries no DKG result.
    pub fn is_null(&self) -> bool {
        self.signers.none()
            && self.valid_members.none()
            && self.quorum_public_key.is_none()
            && self.quorum_vvec_hash.is_zero()
            && self.quorum_sig.is_none()
            && self.members_sig.is_none()
    }

    /// The signed commitment hash; `None` without a quorum key.
    pub fn commitment_hash(&self) -> Option<Hash256> {
        let pk = self.quorum_public_key.as_ref()?;
        Some(build_commitment_hash(
            &self.quorum_hash,
            &self.valid_members,
            pk,
            &self.quorum_vvec_hash,
        ))
    }

    /// Hash of the wire encoding; identifies the commitment in inventories.
    pub fn hash(&self) -> Hash256 {
        Hash256::sha256d(&self.encode())
    }

    /// Bitset lengths equal the committee size.
    pub fn verify_sizes(&self, params: &LlmqParams) -> bool {
        if self.signers.len() != params.size {
            debug!(quorum_hash = %self.quorum_hash, len = self.signers.len(), "invalid signers size");
            return false;
        }
        if self.valid_members.len() != params.size {
            debug!(quorum_hash = %self.quorum_hash, len = self.valid_members.len(), "invalid valid_members size");
            return false;
        }
        true
    }

    /// A null commitment with correct sizes.
    pub fn verify_null(&self, params: &LlmqParams) -> bool {
        self.is_null() && self.verify_sizes(params)
    }

    /// Full structural (and optionally cryptographic) validation against the
    /// quorum block and its deterministic member list.
    pub fn verify(
        &self,
        quorum_block: &BlockRef,
        members: &[Masternode],
        params: &LlmqParams,
        check_sigs: bool,
    ) -> bool {
        let q = &self.quorum_hash;
        if self.version == 0 || self.version != COMMITMENT_VERSION {
            debug!(quorum_hash = %q, version = self.version, "invalid commitment version");
            return false;
        }
        if quorum_block.hash != self.quorum_hash {
            debug!(quorum_hash = %q, block = %quorum_block.hash, "commitment quorum hash mismatch");
            return false;
        }
        if !self.verify_sizes(params) {
            return false;
        }
        if self.count_valid_members() < params.min_size {
            debug!(quorum_hash = %q, valid = self.count_valid_members(), "too few valid members");
            return false;
        }
        if self.count_signers() < params.min_size {
            debug!(quorum_hash = %q, signers = self.count_signers(), "too few signers");
            return false;
        }
        let Some(pk) = self.quorum_public_key.as_ref() else {
            debug!(quorum_hash = %q, "missing quorum public key");
            return false;
        };
        if self.quorum_vvec_hash.is_zero() {
            debug!(quorum_hash = %q, "null quorum vvec hash");
            return false;
        }
        let (Some(members_sig), Some(quorum_sig)) = (self.members_sig.as_ref(), self.quorum_sig.as_ref())
        else {
            debug!(quorum_hash = %q, "missing commitment signature");
            return false;
        };
        if self.valid_members.any_from(members.len()) {
            debug!(quorum_hash = %q, members = members.len(), "valid_members bit set beyond member count");
            return false;
        }
        if self.signers.any_from(members.len()) {
            debug!(quorum_hash = %q, members = members.len(), "signers bit set beyond member count");
            return false;
        }

        if check_sigs {
            let commitment_hash = build_commitment_hash(q, &self.valid_members, pk, &self.quorum_vvec_hash);
            let signer_keys: Vec<PublicKey> = self
                .signers
                .iter_ones()
                .map(|i| members[i].operator_key)
                .collect();
            if !members_sig.verify_secure_aggregated(&signer_keys, &commitment_hash) {
                debug!(quorum_hash = %q, "invalid aggregated members signature");
                return false;
            }
            if !quorum_sig.verify(pk, &commitment_hash) {
                debug!(quorum_hash = %q, "invalid quorum signature");
                return false;
            }
        }

        debug!(quorum_hash = %q, "valid commitment");
        true
    }

    /// Wire encoding.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + 32 + 2 * (9 + self.signers.len().div_ceil(8)) + 48 + 32 + 192);
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(self.quorum_hash.as_bytes());
        self.signers.encode_dyn(&mut out);
        self.valid_members.encode_dyn(&mut out);
        match &self.quorum_public_key {
            Some(pk) => out.extend_from_slice(&pk.to_bytes()),
            None => out.extend_from_slice(&[0u8; PUBLIC_KEY_LEN]),
        }
        out.extend_from_slice(self.quorum_vvec_hash.as_bytes());
        for sig in [&self.quorum_sig, &self.members_sig] {
            match sig {
                Some(sig) => out.extend_from_slice(&sig.to_bytes()),
                None => out.extend_from_slice(&[0u8; SIGNATURE_LEN]),
            }
        }
        out
    }

    /// Decode the wire encoding. Invalid (non-zero, undecodable) keys and
    /// signatures are rejected here.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);
        let version = r.read_u16()?;
        let quorum_hash = r.read_hash()?;
        let signers = BitSet::decode_dyn(&mut r)?;
        let valid_members = BitSet::decode_dyn(&mut r)?;
        let pk_bytes = r.read_bytes(PUBLIC_KEY_LEN)?;
        let quorum_public_key = if pk_bytes.iter().all(|b| *b == 0) {
            None
        } else {
            Some(PublicKey::from_bytes(pk_bytes)?)
        };
        let quorum_vvec_hash = r.read_hash()?;
        let mut sigs = [None, None];
        for slot in &mut sigs {
            let sig_bytes = r.read_bytes(SIGNATURE_LEN)?;
            if sig_bytes.iter().any(|b| *b != 0) {
                *slot = Some(Signature::from_bytes(sig_bytes)?);
            }
        }
        r.finish()?;
        let [quorum_sig, members_sig] = sigs;
        Ok(Self {
            version,
            quorum_hash,
            signers,
            valid_members,
            quorum_public_key,
            quorum_vvec_hash,
            quorum_sig,
            members_sig,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bls::SecretKey;

    #[test]
    fn test_null_commitment() {
        let params = LlmqParams::llmq_test();
        let fc = FinalCommitment::null(&params, Hash256::sha256d(b"q"));
        assert!(fc.is_null());
        assert!(fc.verify_null(&params));
        assert!(fc.commitment_hash().is_none());

        let mut other = LlmqParams::llmq_test();
        other.size = 7;
        assert!(!fc.verify_null(&other));
    }

    #[test]
    fn test_null_encoding_is_zero_filled() {
        let params = LlmqParams::llmq_test();
        let fc = FinalCommitment::null(&params, Hash256::ZERO);
        let bytes = fc.encode();
        // 2 + 32 + (1 + 1) * 2 + 48 + 32 + 96 * 2
        assert_eq!(bytes.len(), 310);
        assert_eq!(FinalCommitment::decode(&bytes).unwrap(), fc);
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let params = LlmqParams::llmq_test();
        let mut bytes = FinalCommitment::null(&params, Hash256::ZERO).encode();
        bytes.push(0);
        assert!(FinalCommitment::decode(&bytes).is_err());
    }

    #[test]
    fn test_commitment_hash_binds_valid_members() {
        let pk = SecretKey::from_u64(5).unwrap().public_key();
        let q = Hash256::sha256d(b"q");
        let v = Hash256::sha256d(b"v");
        let a = build_commitment_hash(&q, &BitSet::from_indexes(5, [0, 1, 2]), &pk, &v);
        let b = build_commitment_hash(&q, &BitSet::from_indexes(5, [0, 1, 3]), &pk, &v);
        assert_ne!(a, b);
    }

    fn signed_commitment(
        params: &LlmqParams,
        quorum: &BlockRef,
        members_sig: impl FnOnce(&Hash256) -> Signature,
    ) -> FinalCommitment {
        let quorum_key = SecretKey::from_u64(77).unwrap();
        let valid_members = BitSet::from_indexes(params.size, 0..3);
        let vvec_hash = Hash256::sha256d(b"vvec");
        let hash = build_commitment_hash(&quorum.hash, &valid_members, &quorum_key.public_key(), &vvec_hash);
        FinalCommitment {
            version: COMMITMENT_VERSION,
            quorum_hash: quorum.hash,
            signers: valid_members.clone(),
            valid_members,
            quorum_public_key: Some(quorum_key.public_key()),
            quorum_vvec_hash: vvec_hash,
            quorum_sig: Some(quorum_key.sign(&hash)),
            members_sig: Some(members_sig(&hash)),
        }
    }

    #[test]
    fn test_rogue_operator_key_cannot_stand_in_for_members() {
        let params = LlmqParams::llmq_test();
        let quorum = BlockRef::new(Hash256::sha256d(b"quorum"), 24);
        let honest = [SecretKey::from_u64(11).unwrap(), SecretKey::from_u64(12).unwrap()];
        let attacker = SecretKey::from_u64(13).unwrap();
        // registered so that the plain sum of all three keys is the attacker's
        let rogue = attacker.sub(&honest[0]).unwrap().sub(&honest[1]).unwrap();
        let operators = [&honest[0], &honest[1], &rogue];
        let members: Vec<Masternode> = operators
            .iter()
            .enumerate()
            .map(|(i, sk)| Masternode {
                pro_tx_hash: Hash256::sha256d(&[i as u8]),
                operator_key: sk.public_key(),
            })
            .collect();
        let keys: Vec<PublicKey> = members.iter().map(|m| m.operator_key).collect();

        let forged = signed_commitment(&params, &quorum, |hash| attacker.sign(hash));
        assert!(!forged.verify(&quorum, &members, &params, true));
        assert!(forged.verify(&quorum, &members, &params, false));

        let honest_fc = signed_commitment(&params, &quorum, |hash| {
            let sigs: Vec<Signature> = operators.iter().map(|sk| sk.sign(hash)).collect();
            Signature::aggregate_secure(&keys, &sigs).unwrap()
        });
        assert!(honest_fc.verify(&quorum, &members, &params, true));
    }
}
