//! 256-bit hashes and the double-SHA-256 writer used for every
//! consensus-relevant digest (commitment hashes, sign hashes, quorum keys,
//! selection scores).
//!
//! All digests are `SHA256(SHA256(preimage))`. Preimages are built with
//! [`HashWriter`], which serializes integers little-endian.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// A 256-bit hash. Ordering is plain byte-lexicographic.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// The all-zero hash, used as the "null" marker.
    pub const ZERO: Hash256 = Hash256([0u8; 32]);

    /// Wrap raw bytes.
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Borrow the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Whether this is the null hash.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Lowercase hex encoding.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from 64 hex characters.
    pub fn from_hex(s: &str) -> crate::Result<Self> {
        let bytes = hex::decode(s).map_err(|e| crate::LlmqError::invalid(e.to_string()))?;
        Self::try_from(bytes.as_slice())
    }

    /// Double SHA-256 of `data`.
    pub fn sha256d(data: &[u8]) -> Self {
        let mut w = HashWriter::new();
        w.write(data);
        w.finish()
    }
}

impl TryFrom<&[u8]> for Hash256 {
    type Error = crate::LlmqError;

    fn try_from(bytes: &[u8]) -> crate::Result<Self> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| crate::LlmqError::invalid(format!("hash must be 32 bytes, got {}", bytes.len())))?;
        Ok(Self(arr))
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form keeps log lines readable
        write!(f, "Hash256({}…)", &self.to_hex()[..12])
    }
}

/// Incremental double-SHA-256 builder.
#[derive(Clone, Default)]
pub struct HashWriter {
    inner: Sha256,
}

impl HashWriter {
    /// Start an empty preimage.
    pub fn new() -> Self {
        Self {
            inner: Sha256::new(),
        }
    }

    /// Append raw bytes.
    pub fn write(&mut self, data: &[u8]) -> &mut Self {
        self.inner.update(data);
        self
    }

    /// Append a byte.
    pub fn write_u8(&mut self, v: u8) -> &mut Self {
        self.write(&[v])
    }

    /// Append a little-endian u16.
    pub fn write_u16(&mut self, v: u16) -> &mut Self {
        self.write(&v.to_le_bytes())
    }

    /// Append a little-endian u32.
    pub fn write_u32(&mut self, v: u32) -> &mut Self {
        self.write(&v.to_le_bytes())
    }

    /// Append a little-endian i32.
    pub fn write_i32(&mut self, v: i32) -> &mut Self {
        self.write(&v.to_le_bytes())
    }

    /// Append a hash.
    pub fn write_hash(&mut self, h: &Hash256) -> &mut Self {
        self.write(&h.0)
    }

    /// Append a length-prefixed string.
    pub fn write_str(&mut self, s: &str) -> &mut Self {
        let mut prefix = Vec::with_capacity(9);
        crate::codec::write_compact_size(&mut prefix, s.len() as u64);
        self.write(&prefix);
        self.write(s.as_bytes())
    }

    /// Finish with the second SHA-256 round.
    pub fn finish(self) -> Hash256 {
        let first = self.inner.finalize();
        let second = Sha256::digest(first);
        let mut out = [0u8; 32];
        out.copy_from_slice(&second);
        Hash256(out)
    }
}

/// Single-round SHA-256, used for key derivation rather than consensus hashing.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let digest = Sha256::digest(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256d_of_empty_input() {
        // sha256d("") is a well-known constant
        let h = Hash256::sha256d(b"");
        assert_eq!(
            h.to_hex(),
            "5df6e0e2761359d30a8275058e299fcc0381534545f55cf43e41983f5d4c9456"
        );
    }

    #[test]
    fn test_writer_matches_one_shot() {
        let mut w = HashWriter::new();
        w.write(b"hello").write(b" world");
        assert_eq!(w.finish(), Hash256::sha256d(b"hello world"));
    }

    #[test]
    fn test_hex_round_trip() {
        let h = Hash256::sha256d(b"quorum");
        assert_eq!(Hash256::from_hex(&h.to_hex()).unwrap(), h);
        assert!(Hash256::from_hex("abcd").is_err());
    }

    #[test]
    fn test_zero_hash() {
        assert!(Hash256::ZERO.is_zero());
        assert!(!Hash256::sha256d(b"x").is_zero());
    }
}
