//! Pairwise encryption of secret key shares.
//!
//! The dealer and the recipient derive the same symmetric key from the BLS
//! Diffie-Hellman point of their operator keys, `sha256(sk_a * pk_b)`, and
//! the share is sealed with ChaCha20-Poly1305. Blobs are `nonce || ciphertext`.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use llmq_core::hash::sha256;
use llmq_core::{PublicKey, SecretKey};
use rand::{CryptoRng, RngCore};
use zeroize::Zeroizing;

const NONCE_LEN: usize = 12;

fn cipher(local: &SecretKey, peer: &PublicKey) -> Option<ChaCha20Poly1305> {
    let point = local.shared_secret(peer)?;
    let key = Zeroizing::new(sha256(&point[..]));
    Some(ChaCha20Poly1305::new(Key::from_slice(&key[..])))
}

/// Seal `share` for `recipient`.
pub fn encrypt_share<R: RngCore + CryptoRng>(
    rng: &mut R,
    sender: &SecretKey,
    recipient: &PublicKey,
    share: &SecretKey,
) -> Option<Vec<u8>> {
    let cipher = cipher(sender, recipient)?;
    let mut nonce = [0u8; NONCE_LEN];
    rng.fill_bytes(&mut nonce);
    let plaintext = share.to_bytes();
    let sealed = cipher.encrypt(Nonce::from_slice(&nonce), &plaintext[..]).ok()?;
    let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Some(out)
}

/// Open a blob sealed by `sender` for us. `None` on any tampering.
pub fn decrypt_share(recipient: &SecretKey, sender: &PublicKey, blob: &[u8]) -> Option<SecretKey> {
    if blob.len() <= NONCE_LEN {
        return None;
    }
    let (nonce, sealed) = blob.split_at(NONCE_LEN);
    let plaintext = Zeroizing::new(cipher(recipient, sender)?.decrypt(Nonce::from_slice(nonce), sealed).ok()?);
    SecretKey::from_bytes(&plaintext[..]).ok()
}
