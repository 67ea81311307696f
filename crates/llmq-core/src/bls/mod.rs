//! BLS12-381 keys, signatures and secret-sharing helpers.
//!
//! Public keys live in G1 (48 bytes compressed), signatures in G2 (96 bytes
//! compressed), using the `min_pk` variant of blst. Messages are always
//! 32-byte hashes. Member identifiers ([`BlsId`]) are scalars derived from
//! the member's registration hash.
//!
//! Decoding validates; arithmetic results are trusted. Any helper that can
//! fail on legitimate-but-unlucky input (a zero sum, duplicate ids) returns
//! `Option` rather than an error.

mod arith;

use crate::{Hash256, HashWriter, LlmqError, Result};
use arith::{Fr, G1, G2};
use blst::min_pk;
use blst::BLST_ERROR;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::hash::{Hash, Hasher};
use zeroize::Zeroizing;

/// Hash-to-curve domain separation tag.
pub const BLS_DST: &[u8] = b"BLS_SIG_BLS12381G2_XMD:SHA-256_SSWU_RO_NUL_";

/// Compressed public key length.
pub const PUBLIC_KEY_LEN: usize = 48;
/// Compressed signature length.
pub const SIGNATURE_LEN: usize = 96;
/// Secret key length.
pub const SECRET_KEY_LEN: usize = 32;

/// Polynomial commitments of one dealer (or the aggregate of all valid dealers).
pub type VerificationVector = Vec<PublicKey>;

/// A BLS secret key (or secret key share).
#[derive(Clone)]
pub struct SecretKey(min_pk::SecretKey);

impl SecretKey {
    /// Fresh random key.
    pub fn random<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        loop {
            let mut ikm = Zeroizing::new([0u8; 32]);
            rng.fill_bytes(&mut ikm[..]);
            if let Ok(sk) = min_pk::SecretKey::key_gen(&ikm[..], &[]) {
                return Self(sk);
            }
        }
    }

    /// Decode 32 big-endian bytes. Zero and out-of-range scalars are rejected.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        min_pk::SecretKey::from_bytes(bytes)
            .map(Self)
            .map_err(|e| LlmqError::crypto(format!("invalid secret key: {e:?}")))
    }

    /// Small integer key, handy for deterministic fixtures.
    pub fn from_u64(n: u64) -> Result<Self> {
        Self::from_fr(&Fr::from_u64(n)).ok_or_else(|| LlmqError::crypto("zero secret key"))
    }

    /// 32 big-endian bytes.
    pub fn to_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.0.to_bytes())
    }

    /// Matching public key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.0.sk_to_pk())
    }

    /// Sign a 32-byte message hash.
    pub fn sign(&self, hash: &Hash256) -> Signature {
        Signature(self.0.sign(hash.as_bytes(), BLS_DST, &[]))
    }

    /// Sum of keys. `None` for empty input or a zero sum.
    pub fn aggregate(keys: &[SecretKey]) -> Option<SecretKey> {
        if keys.is_empty() {
            return None;
        }
        let mut acc = Fr::zero();
        for k in keys {
            acc = acc.add(&k.to_fr()?);
        }
        Self::from_fr(&acc)
    }

    /// Random polynomial with `threshold` coefficients; the first is the secret.
    pub fn random_polynomial<R: RngCore + CryptoRng>(rng: &mut R, threshold: usize) -> Vec<SecretKey> {
        (0..threshold).map(|_| Self::random(rng)).collect()
    }

    /// Evaluate a secret polynomial at `id`.
    pub fn share_for(coefficients: &[SecretKey], id: &BlsId) -> Option<SecretKey> {
        let coeffs = coefficients
            .iter()
            .map(SecretKey::to_fr)
            .collect::<Option<Vec<_>>>()?;
        Self::from_fr(&arith::eval_fr(&coeffs, &id.to_fr()?))
    }

    /// Diffie-Hellman shared point with `peer`, compressed.
    pub fn shared_secret(&self, peer: &PublicKey) -> Option<Zeroizing<[u8; 48]>> {
        let point = G1::from_compressed(&peer.to_bytes())?.mul(&self.to_fr()?);
        if point.is_identity() {
            return None;
        }
        Some(Zeroizing::new(point.to_compressed()))
    }

    #[cfg(test)]
    pub(crate) fn sub(&self, other: &SecretKey) -> Option<SecretKey> {
        Self::from_fr(&self.to_fr()?.sub(&other.to_fr()?))
    }

    fn to_fr(&self) -> Option<Fr> {
        Fr::from_be_bytes(&self.to_bytes())
    }

    fn from_fr(fr: &Fr) -> Option<SecretKey> {
        let bytes = Zeroizing::new(fr.to_be_bytes());
        min_pk::SecretKey::from_bytes(&bytes[..]).ok().map(Self)
    }
}

impl PartialEq for SecretKey {
    fn eq(&self, other: &Self) -> bool {
        *self.to_bytes() == *other.to_bytes()
    }
}

impl Eq for SecretKey {}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(<redacted>)")
    }
}

/// A BLS public key in G1.
#[derive(Clone, Copy)]
pub struct PublicKey(min_pk::PublicKey);

impl PublicKey {
    /// Decode and fully validate (on curve, in subgroup, not infinity).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        min_pk::PublicKey::key_validate(bytes)
            .map(Self)
            .map_err(|e| LlmqError::crypto(format!("invalid public key: {e:?}")))
    }

    /// Compressed encoding.
    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.0.compress()
    }

    /// Sum of keys. `None` for empty input.
    pub fn aggregate(keys: &[PublicKey]) -> Option<PublicKey> {
        if keys.is_empty() {
            return None;
        }
        let refs: Vec<&min_pk::PublicKey> = keys.iter().map(|k| &k.0).collect();
        min_pk::AggregatePublicKey::aggregate(&refs, false)
            .ok()
            .map(|agg| PublicKey(agg.to_public_key()))
    }

    /// Evaluate a verification vector at `id`, giving that member's public
    /// key share.
    pub fn share_for(vvec: &[PublicKey], id: &BlsId) -> Option<PublicKey> {
        let coeffs = vvec
            .iter()
            .map(|pk| G1::from_compressed(&pk.to_bytes()))
            .collect::<Option<Vec<_>>>()?;
        let point = arith::eval_g1(&coeffs, &id.to_fr()?)?;
        Self::from_point(&point)
    }

    /// Sum of keys, each weighted by its coefficient
    /// `t_i = H(pk_i || H(sorted pks))`. A key chosen as a function of the
    /// others cannot cancel them out.
    pub fn aggregate_secure(keys: &[PublicKey]) -> Option<PublicKey> {
        let coeffs = secure_coefficients(keys)?;
        let mut acc: Option<G1> = None;
        for (pk, t) in keys.iter().zip(&coeffs) {
            let term = G1::from_compressed(&pk.to_bytes())?.mul(t);
            acc = Some(match acc {
                Some(a) => a.add(&term),
                None => term,
            });
        }
        Self::from_point(&acc?)
    }

    fn from_point(point: &G1) -> Option<PublicKey> {
        if point.is_identity() {
            return None;
        }
        min_pk::PublicKey::uncompress(&point.to_compressed()).ok().map(Self)
    }
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for PublicKey {}

impl Hash for PublicKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.to_bytes().hash(state);
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}…)", &hex::encode(self.to_bytes())[..16])
    }
}

/// A BLS signature in G2.
#[derive(Clone, Copy)]
pub struct Signature(min_pk::Signature);

impl Signature {
    /// Decode a compressed signature. Subgroup membership is checked at
    /// verification time.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        min_pk::Signature::from_bytes(bytes)
            .map(Self)
            .map_err(|e| LlmqError::crypto(format!("invalid signature: {e:?}")))
    }

    /// Compressed encoding.
    pub fn to_bytes(&self) -> [u8; SIGNATURE_LEN] {
        self.0.compress()
    }

    /// Verify over a single message hash.
    pub fn verify(&self, pk: &PublicKey, hash: &Hash256) -> bool {
        self.0.verify(true, hash.as_bytes(), BLS_DST, &[], &pk.0, false) == BLST_ERROR::BLST_SUCCESS
    }

    /// Verify an aggregate over distinct `(pk, hash)` pairs.
    pub fn verify_aggregated(&self, pks: &[PublicKey], hashes: &[Hash256]) -> bool {
        if pks.is_empty() || pks.len() != hashes.len() {
            return false;
        }
        let msgs: Vec<&[u8]> = hashes.iter().map(|h| h.0.as_slice()).collect();
        let pk_refs: Vec<&min_pk::PublicKey> = pks.iter().map(|k| &k.0).collect();
        self.0.aggregate_verify(true, &msgs, BLS_DST, &pk_refs, false) == BLST_ERROR::BLST_SUCCESS
    }

    /// Verify a signature built by [`Signature::aggregate_secure`] over
    /// `pks`, every signer having signed `hash`.
    pub fn verify_secure_aggregated(&self, pks: &[PublicKey], hash: &Hash256) -> bool {
        match PublicKey::aggregate_secure(pks) {
            Some(agg) => self.verify(&agg, hash),
            None => false,
        }
    }

    /// Aggregate same-message signatures, each weighted by its signer's
    /// coefficient. `sigs[i]` must come from `pks[i]`.
    pub fn aggregate_secure(pks: &[PublicKey], sigs: &[Signature]) -> Option<Signature> {
        if pks.len() != sigs.len() {
            return None;
        }
        let coeffs = secure_coefficients(pks)?;
        let mut acc: Option<G2> = None;
        for (sig, t) in sigs.iter().zip(&coeffs) {
            let term = G2::from_compressed(&sig.to_bytes())?.mul(t);
            acc = Some(match acc {
                Some(a) => a.add(&term),
                None => term,
            });
        }
        let point = acc?;
        if point.is_identity() {
            return None;
        }
        min_pk::Signature::uncompress(&point.to_compressed()).ok().map(Self)
    }

    /// Sum of signatures. `None` for empty input.
    pub fn aggregate(sigs: &[Signature]) -> Option<Signature> {
        if sigs.is_empty() {
            return None;
        }
        let refs: Vec<&min_pk::Signature> = sigs.iter().map(|s| &s.0).collect();
        min_pk::AggregateSignature::aggregate(&refs, false)
            .ok()
            .map(|agg| Signature(agg.to_signature()))
    }

    /// Recover the threshold signature from `(id, share)` pairs by Lagrange
    /// interpolation at zero. The caller supplies exactly `threshold` shares.
    pub fn recover(shares: &[(BlsId, Signature)]) -> Option<Signature> {
        if shares.is_empty() {
            return None;
        }
        let xs = shares
            .iter()
            .map(|(id, _)| id.to_fr())
            .collect::<Option<Vec<_>>>()?;
        let lambdas = arith::lagrange_at_zero(&xs)?;
        let mut acc: Option<G2> = None;
        for ((_, sig), lambda) in shares.iter().zip(lambdas.iter()) {
            let term = G2::from_compressed(&sig.to_bytes())?.mul(lambda);
            acc = Some(match acc {
                Some(a) => a.add(&term),
                None => term,
            });
        }
        let point = acc?;
        if point.is_identity() {
            return None;
        }
        min_pk::Signature::uncompress(&point.to_compressed()).ok().map(Self)
    }
}

impl PartialEq for Signature {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for Signature {}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({}…)", &hex::encode(self.to_bytes())[..16])
    }
}

/// Per-key weights for secure same-message aggregation.
fn secure_coefficients(pks: &[PublicKey]) -> Option<Vec<Fr>> {
    if pks.is_empty() {
        return None;
    }
    let mut sorted: Vec<[u8; PUBLIC_KEY_LEN]> = pks.iter().map(PublicKey::to_bytes).collect();
    sorted.sort_unstable();
    let mut set_hasher = Sha256::new();
    for pk in &sorted {
        set_hasher.update(pk);
    }
    let set_hash = set_hasher.finalize();
    pks.iter()
        .map(|pk| {
            let digest = Sha256::new().chain_update(pk.to_bytes()).chain_update(set_hash).finalize();
            Fr::from_digest(&digest)
        })
        .collect()
}

/// Member identifier used as the evaluation point of secret sharing.
///
/// Derived from the member's registration hash by clearing the top two bits,
/// which keeps it below the group order.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlsId([u8; 32]);

impl BlsId {
    /// Identifier for a member registration hash.
    pub fn from_hash(hash: &Hash256) -> Self {
        let mut bytes = hash.0;
        bytes[0] &= 0x3f;
        Self(bytes)
    }

    /// Identifier from a small integer, for fixtures.
    pub fn from_u64(n: u64) -> Self {
        let mut bytes = [0u8; 32];
        bytes[24..].copy_from_slice(&n.to_be_bytes());
        Self(bytes)
    }

    /// Big-endian scalar bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    fn to_fr(self) -> Option<Fr> {
        let fr = Fr::from_be_bytes(&self.0)?;
        (!fr.is_zero()).then_some(fr)
    }
}

impl fmt::Debug for BlsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlsId({}…)", &hex::encode(self.0)[..12])
    }
}

/// Hash binding a verification vector, as carried in commitments.
pub fn verification_vector_hash(vvec: &[PublicKey]) -> Hash256 {
    let mut prefix = Vec::with_capacity(9);
    crate::codec::write_compact_size(&mut prefix, vvec.len() as u64);
    let mut w = HashWriter::new();
    w.write(&prefix);
    for pk in vvec {
        w.write(&pk.to_bytes());
    }
    w.finish()
}

/// Element-wise sum of equally long vectors. `None` on empty input or a
/// length mismatch.
pub fn aggregate_verification_vectors(vvecs: &[VerificationVector]) -> Option<VerificationVector> {
    let len = vvecs.first()?.len();
    if len == 0 || vvecs.iter().any(|v| v.len() != len) {
        return None;
    }
    (0..len)
        .map(|i| {
            let column: Vec<PublicKey> = vvecs.iter().map(|v| v[i]).collect();
            PublicKey::aggregate(&column)
        })
        .collect()
}

macro_rules! impl_serde_bytes {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
                let bytes = self.to_bytes();
                serde_bytes::Bytes::new(&bytes[..]).serialize(serializer)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
                let buf = serde_bytes::ByteBuf::deserialize(deserializer)?;
                <$ty>::from_bytes(&buf).map_err(serde::de::Error::custom)
            }
        }
    };
}

impl_serde_bytes!(SecretKey);
impl_serde_bytes!(PublicKey);
impl_serde_bytes!(Signature);

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn rng() -> rand::rngs::StdRng {
        rand::rngs::StdRng::seed_from_u64(7)
    }

    fn msg(tag: &[u8]) -> Hash256 {
        Hash256::sha256d(tag)
    }

    #[test]
    fn test_sign_and_verify() {
        let sk = SecretKey::random(&mut rng());
        let pk = sk.public_key();
        let sig = sk.sign(&msg(b"a"));
        assert!(sig.verify(&pk, &msg(b"a")));
        assert!(!sig.verify(&pk, &msg(b"b")));
    }

    #[test]
    fn test_secret_aggregation_matches_public_aggregation() {
        let a = SecretKey::from_u64(3).unwrap();
        let b = SecretKey::from_u64(4).unwrap();
        let sum = SecretKey::aggregate(&[a.clone(), b.clone()]).unwrap();
        assert_eq!(sum, SecretKey::from_u64(7).unwrap());
        assert_eq!(
            PublicKey::aggregate(&[a.public_key(), b.public_key()]).unwrap(),
            sum.public_key()
        );
    }

    #[test]
    fn test_share_consistency_with_verification_vector() {
        let mut rng = rng();
        let poly = SecretKey::random_polynomial(&mut rng, 3);
        let vvec: Vec<PublicKey> = poly.iter().map(SecretKey::public_key).collect();
        let id = BlsId::from_hash(&msg(b"member"));
        let share = SecretKey::share_for(&poly, &id).unwrap();
        assert_eq!(PublicKey::share_for(&vvec, &id).unwrap(), share.public_key());
    }

    #[test]
    fn test_threshold_recovery() {
        let mut rng = rng();
        let poly = SecretKey::random_polynomial(&mut rng, 2);
        let quorum_pk = poly[0].public_key();
        let hash = msg(b"sign me");
        let shares: Vec<(BlsId, Signature)> = (1..=3u64)
            .map(|i| {
                let id = BlsId::from_u64(i);
                (id, SecretKey::share_for(&poly, &id).unwrap().sign(&hash))
            })
            .collect();
        let recovered = Signature::recover(&shares[1..]).unwrap();
        assert!(recovered.verify(&quorum_pk, &hash));
    }

    #[test]
    fn test_shared_secret_is_symmetric() {
        let mut rng = rng();
        let a = SecretKey::random(&mut rng);
        let b = SecretKey::random(&mut rng);
        let ab = a.shared_secret(&b.public_key()).unwrap();
        let ba = b.shared_secret(&a.public_key()).unwrap();
        assert_eq!(*ab, *ba);
    }

    #[test]
    fn test_aggregate_verify_distinct_messages() {
        let mut rng = rng();
        let keys: Vec<SecretKey> = (0..3).map(|_| SecretKey::random(&mut rng)).collect();
        let hashes: Vec<Hash256> = (0..3u8).map(|i| msg(&[i])).collect();
        let sigs: Vec<Signature> = keys.iter().zip(&hashes).map(|(k, h)| k.sign(h)).collect();
        let agg = Signature::aggregate(&sigs).unwrap();
        let pks: Vec<PublicKey> = keys.iter().map(SecretKey::public_key).collect();
        assert!(agg.verify_aggregated(&pks, &hashes));
        assert!(!agg.verify_aggregated(&pks[..2], &hashes[..2]));
    }

    #[test]
    fn test_secure_aggregate_verifies_same_message() {
        let mut rng = rng();
        let sks: Vec<SecretKey> = (0..4).map(|_| SecretKey::random(&mut rng)).collect();
        let pks: Vec<PublicKey> = sks.iter().map(SecretKey::public_key).collect();
        let hash = msg(b"commitment");
        let sigs: Vec<Signature> = sks.iter().map(|sk| sk.sign(&hash)).collect();

        let agg = Signature::aggregate_secure(&pks, &sigs).unwrap();
        assert!(agg.verify_secure_aggregated(&pks, &hash));
        assert!(!agg.verify_secure_aggregated(&pks[..3], &hash));
        assert!(!agg.verify_secure_aggregated(&pks, &msg(b"other")));
        // the unweighted sum is not accepted
        assert!(!Signature::aggregate(&sigs).unwrap().verify_secure_aggregated(&pks, &hash));
        assert!(Signature::aggregate_secure(&pks[..3], &sigs).is_none());
        assert!(Signature::aggregate_secure(&[], &[]).is_none());
    }

    #[test]
    fn test_rogue_key_cannot_forge_secure_aggregate() {
        let mut rng = rng();
        let honest = SecretKey::random(&mut rng);
        let attacker = SecretKey::random(&mut rng);
        // rogue = attacker - honest, so the plain key sum is the attacker's key
        let rogue = attacker.sub(&honest).unwrap();
        let pks = [honest.public_key(), rogue.public_key()];
        assert_eq!(PublicKey::aggregate(&pks), Some(attacker.public_key()));

        let hash = msg(b"commitment");
        let forged = attacker.sign(&hash);
        assert!(forged.verify(&PublicKey::aggregate(&pks).unwrap(), &hash));
        assert!(!forged.verify_secure_aggregated(&pks, &hash));
    }

    #[test]
    fn test_vector_aggregation_rejects_length_mismatch() {
        let pk = |n| SecretKey::from_u64(n).unwrap().public_key();
        assert!(aggregate_verification_vectors(&[vec![pk(1), pk(2)], vec![pk(3)]]).is_none());
        assert!(aggregate_verification_vectors(&[]).is_none());
        let sum = aggregate_verification_vectors(&[vec![pk(1), pk(2)], vec![pk(3), pk(4)]]).unwrap();
        assert_eq!(sum, vec![pk(4), pk(6)]);
    }

    #[test]
    fn test_bincode_round_trip_of_key_material() {
        let sk = SecretKey::from_u64(11).unwrap();
        let encoded = bincode::serialize(&(sk.clone(), sk.public_key(), sk.sign(&msg(b"x")))).unwrap();
        let (sk2, pk2, sig2): (SecretKey, PublicKey, Signature) = bincode::deserialize(&encoded).unwrap();
        assert_eq!(sk2, sk);
        assert!(sig2.verify(&pk2, &msg(b"x")));
    }

    #[test]
    fn test_invalid_encodings_rejected() {
        assert!(PublicKey::from_bytes(&[0u8; 48]).is_err());
        assert!(SecretKey::from_bytes(&[0u8; 32]).is_err());
        assert!(Signature::from_bytes(&[1u8; 10]).is_err());
    }
}
