//! DKG wire messages.
//!
//! Every message starts with a [`MessageHeader`] (quorum type first, so the
//! manager can route a raw payload by its first byte) and ends with the
//! sender's operator signature over the message's sign hash. Payloads are
//! bincode-encoded.

use llmq_core::codec::write_compact_size;
use llmq_core::{
    build_commitment_hash, BitSet, Hash256, HashWriter, LlmqType, MessageKind, PublicKey, Result,
    SecretKey, Signature, VerificationVector,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Fields shared by all DKG messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Quorum type of the session
    pub llmq_type: LlmqType,
    /// Quorum block hash of the session
    pub quorum_hash: Hash256,
    /// Sender's registration hash
    pub pro_tx_hash: Hash256,
}

impl MessageHeader {
    fn write_to(&self, w: &mut HashWriter) {
        w.write_u8(self.llmq_type.0)
            .write_hash(&self.quorum_hash)
            .write_hash(&self.pro_tx_hash);
    }
}

fn write_len(w: &mut HashWriter, n: usize) {
    let mut prefix = Vec::with_capacity(9);
    write_compact_size(&mut prefix, n as u64);
    w.write(&prefix);
}

/// Common behaviour of signed DKG messages.
pub trait DkgMessage: Serialize + DeserializeOwned + Clone + Send + 'static {
    /// Network kind of this message.
    const KIND: MessageKind;

    /// Routing and sender fields.
    fn header(&self) -> &MessageHeader;

    /// Operator signature.
    fn sig(&self) -> &Signature;

    /// Hash the operator signature covers.
    fn sign_hash(&self) -> Hash256;

    /// Wire encoding.
    fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode a wire payload.
    fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// A dealer's verification vector plus one encrypted share per member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DkgContribution {
    /// Routing and sender
    pub header: MessageHeader,
    /// Commitments to the dealer's polynomial
    pub vvec: VerificationVector,
    /// `nonce || ciphertext` per member, in member order
    pub encrypted_shares: Vec<Vec<u8>>,
    /// Operator signature
    pub sig: Signature,
}

impl DkgContribution {
    fn hash_fields(header: &MessageHeader, vvec: &[PublicKey], shares: &[Vec<u8>]) -> Hash256 {
        let mut w = HashWriter::new();
        header.write_to(&mut w);
        write_len(&mut w, vvec.len());
        for pk in vvec {
            w.write(&pk.to_bytes());
        }
        write_len(&mut w, shares.len());
        for blob in shares {
            write_len(&mut w, blob.len());
            w.write(blob);
        }
        w.finish()
    }

    /// Build and sign.
    pub fn signed(header: MessageHeader, vvec: VerificationVector, encrypted_shares: Vec<Vec<u8>>, key: &SecretKey) -> Self {
        let sig = key.sign(&Self::hash_fields(&header, &vvec, &encrypted_shares));
        Self {
            header,
            vvec,
            encrypted_shares,
            sig,
        }
    }
}

impl DkgMessage for DkgContribution {
    const KIND: MessageKind = MessageKind::Contribution;

    fn header(&self) -> &MessageHeader {
        &self.header
    }

    fn sig(&self) -> &Signature {
        &self.sig
    }

    fn sign_hash(&self) -> Hash256 {
        Self::hash_fields(&self.header, &self.vvec, &self.encrypted_shares)
    }
}

/// Votes against misbehaving members and complaints about bad shares.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DkgComplaint {
    /// Routing and sender
    pub header: MessageHeader,
    /// Members the sender considers bad (e.g. no contribution)
    pub bad_members: BitSet,
    /// Members whose share to the sender failed verification
    pub complain_for_members: BitSet,
    /// Operator signature
    pub sig: Signature,
}

impl DkgComplaint {
    fn hash_fields(header: &MessageHeader, bad: &BitSet, complain: &BitSet) -> Hash256 {
        let mut bits = Vec::new();
        bad.encode_dyn(&mut bits);
        complain.encode_dyn(&mut bits);
        let mut w = HashWriter::new();
        header.write_to(&mut w);
        w.write(&bits);
        w.finish()
    }

    /// Build and sign.
    pub fn signed(header: MessageHeader, bad_members: BitSet, complain_for_members: BitSet, key: &SecretKey) -> Self {
        let sig = key.sign(&Self::hash_fields(&header, &bad_members, &complain_for_members));
        Self {
            header,
            bad_members,
            complain_for_members,
            sig,
        }
    }
}

impl DkgMessage for DkgComplaint {
    const KIND: MessageKind = MessageKind::Complaint;

    fn header(&self) -> &MessageHeader {
        &self.header
    }

    fn sig(&self) -> &Signature {
        &self.sig
    }

    fn sign_hash(&self) -> Hash256 {
        Self::hash_fields(&self.header, &self.bad_members, &self.complain_for_members)
    }
}

/// Plain-text shares revealed to answer complaints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DkgJustification {
    /// Routing and sender
    pub header: MessageHeader,
    /// `(member index, share)` for every complainer
    pub contributions: Vec<(u32, SecretKey)>,
    /// Operator signature
    pub sig: Signature,
}

impl DkgJustification {
    fn hash_fields(header: &MessageHeader, contributions: &[(u32, SecretKey)]) -> Hash256 {
        let mut w = HashWriter::new();
        header.write_to(&mut w);
        write_len(&mut w, contributions.len());
        for (idx, sk) in contributions {
            w.write_u32(*idx).write(&sk.to_bytes()[..]);
        }
        w.finish()
    }

    /// Build and sign.
    pub fn signed(header: MessageHeader, contributions: Vec<(u32, SecretKey)>, key: &SecretKey) -> Self {
        let sig = key.sign(&Self::hash_fields(&header, &contributions));
        Self {
            header,
            contributions,
            sig,
        }
    }
}

impl DkgMessage for DkgJustification {
    const KIND: MessageKind = MessageKind::Justification;

    fn header(&self) -> &MessageHeader {
        &self.header
    }

    fn sig(&self) -> &Signature {
        &self.sig
    }

    fn sign_hash(&self) -> Hash256 {
        Self::hash_fields(&self.header, &self.contributions)
    }
}

/// One member's view of the DKG outcome, signed twice over the commitment
/// hash: by its operator key and by its freshly built quorum key share.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DkgPrematureCommitment {
    /// Routing and sender
    pub header: MessageHeader,
    /// Members the sender considers valid
    pub valid_members: BitSet,
    /// Aggregate quorum public key
    pub quorum_public_key: PublicKey,
    /// Hash of the aggregate verification vector
    pub quorum_vvec_hash: Hash256,
    /// Signature share under the sender's quorum key share
    pub quorum_sig: Signature,
    /// Operator signature
    pub sig: Signature,
}

impl DkgPrematureCommitment {
    /// The commitment hash this member attests to.
    pub fn commitment_hash(&self) -> Hash256 {
        build_commitment_hash(
            &self.header.quorum_hash,
            &self.valid_members,
            &self.quorum_public_key,
            &self.quorum_vvec_hash,
        )
    }
}

impl DkgMessage for DkgPrematureCommitment {
    const KIND: MessageKind = MessageKind::PrematureCommitment;

    fn header(&self) -> &MessageHeader {
        &self.header
    }

    fn sig(&self) -> &Signature {
        &self.sig
    }

    fn sign_hash(&self) -> Hash256 {
        self.commitment_hash()
    }
}
