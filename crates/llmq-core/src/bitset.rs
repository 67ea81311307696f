//! Fixed-length bit vector for signer and valid-member sets.
//!
//! On the wire a bitset is a compact-size bit count followed by
//! `ceil(len / 8)` bytes, bit `i` stored in byte `i / 8` at position `i % 8`.
//! Padding bits in the last byte must be zero.

use crate::codec::{write_compact_size, Reader};
use crate::{LlmqError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A fixed-length set of membership flags indexed by quorum member position.
#[derive(Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct BitSet {
    bits: Vec<bool>,
}

impl BitSet {
    /// `len` cleared bits.
    pub fn new(len: usize) -> Self {
        Self {
            bits: vec![false; len],
        }
    }

    /// Build from explicit flags.
    pub fn from_bools(bits: Vec<bool>) -> Self {
        Self { bits }
    }

    /// Build a set of `len` bits with the given indexes set. Out-of-range
    /// indexes are ignored.
    pub fn from_indexes(len: usize, indexes: impl IntoIterator<Item = usize>) -> Self {
        let mut set = Self::new(len);
        for i in indexes {
            if i < len {
                set.bits[i] = true;
            }
        }
        set
    }

    /// Number of bits (set or not).
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    /// Whether the set has zero length.
    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// Bit at `i`; out-of-range reads as cleared.
    pub fn get(&self, i: usize) -> bool {
        self.bits.get(i).copied().unwrap_or(false)
    }

    /// Set bit `i`. Fails when `i` is out of range.
    pub fn set(&mut self, i: usize, value: bool) -> Result<()> {
        match self.bits.get_mut(i) {
            Some(bit) => {
                *bit = value;
                Ok(())
            }
            None => Err(LlmqError::invalid(format!(
                "bit index {i} out of range for bitset of length {}",
                self.bits.len()
            ))),
        }
    }

    /// Number of set bits.
    pub fn count_ones(&self) -> usize {
        self.bits.iter().filter(|b| **b).count()
    }

    /// Whether no bit is set.
    pub fn none(&self) -> bool {
        !self.bits.iter().any(|b| *b)
    }

    /// Whether any bit at or after `start` is set.
    pub fn any_from(&self, start: usize) -> bool {
        self.bits.iter().skip(start).any(|b| *b)
    }

    /// Indexes of set bits, ascending.
    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits
            .iter()
            .enumerate()
            .filter_map(|(i, b)| b.then_some(i))
    }

    /// Borrow the flags.
    pub fn as_slice(&self) -> &[bool] {
        &self.bits
    }

    /// Pack into `ceil(len / 8)` bytes, LSB first.
    pub fn to_packed(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.bits.len().div_ceil(8)];
        for i in self.iter_ones() {
            out[i / 8] |= 1 << (i % 8);
        }
        out
    }

    /// Unpack `len` bits. Rejects wrong byte counts and set padding bits.
    pub fn from_packed(len: usize, bytes: &[u8]) -> Result<Self> {
        if bytes.len() != len.div_ceil(8) {
            return Err(LlmqError::serialization(format!(
                "bitset of {len} bits needs {} bytes, got {}",
                len.div_ceil(8),
                bytes.len()
            )));
        }
        let bits: Vec<bool> = (0..len).map(|i| bytes[i / 8] & (1 << (i % 8)) != 0).collect();
        if len % 8 != 0 {
            let last = bytes[bytes.len() - 1];
            if last >> (len % 8) != 0 {
                return Err(LlmqError::serialization("bitset padding bits are set"));
            }
        }
        Ok(Self { bits })
    }

    /// Append the dynamic encoding (bit count + packed bytes).
    pub fn encode_dyn(&self, out: &mut Vec<u8>) {
        write_compact_size(out, self.bits.len() as u64);
        out.extend_from_slice(&self.to_packed());
    }

    /// Read the dynamic encoding.
    pub fn decode_dyn(reader: &mut Reader<'_>) -> Result<Self> {
        let len = reader.read_compact_size()?;
        let len = usize::try_from(len)
            .map_err(|_| LlmqError::serialization("bitset length overflows usize"))?;
        // Refuse absurd lengths before allocating
        if len > reader.remaining().saturating_mul(8) {
            return Err(LlmqError::serialization("bitset length exceeds input"));
        }
        let bytes = reader.read_bytes(len.div_ceil(8))?;
        Self::from_packed(len, bytes)
    }
}

impl fmt::Debug for BitSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s: String = self.bits.iter().map(|b| if *b { '1' } else { '0' }).collect();
        write!(f, "BitSet({s})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_lsb_first_packing() {
        let set = BitSet::from_indexes(10, [0, 3, 8]);
        assert_eq!(set.to_packed(), vec![0b0000_1001, 0b0000_0001]);
        assert_eq!(set.count_ones(), 3);
    }

    #[test]
    fn test_padding_bits_rejected() {
        // 10 bits, but bit 11 set in the padding
        assert!(BitSet::from_packed(10, &[0, 0b0000_1000]).is_err());
        assert!(BitSet::from_packed(10, &[0]).is_err());
    }

    #[test]
    fn test_any_from() {
        let set = BitSet::from_indexes(8, [1, 6]);
        assert!(set.any_from(6));
        assert!(!set.any_from(7));
    }

    #[test]
    fn test_set_out_of_range() {
        let mut set = BitSet::new(4);
        assert!(set.set(4, true).is_err());
        assert!(!set.get(4));
    }

    proptest! {
        #[test]
        fn prop_dyn_encoding_preserves_bits(bits in proptest::collection::vec(any::<bool>(), 0..200)) {
            let set = BitSet::from_bools(bits);
            let mut buf = Vec::new();
            set.encode_dyn(&mut buf);
            let mut reader = Reader::new(&buf);
            let decoded = BitSet::decode_dyn(&mut reader).unwrap();
            reader.finish().unwrap();
            prop_assert_eq!(decoded, set);
        }
    }
}
