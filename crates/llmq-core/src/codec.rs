//! Minimal wire codec for fixed-layout consensus payloads.
//!
//! Network messages between DKG participants use bincode; the mined
//! commitment payload has a fixed byte layout and is encoded by hand with
//! these helpers.

use crate::{Hash256, LlmqError, Result};

/// Append a Bitcoin-style compact size.
pub fn write_compact_size(out: &mut Vec<u8>, n: u64) {
    if n < 253 {
        out.push(n as u8);
    } else if n <= 0xffff {
        out.push(253);
        out.extend_from_slice(&(n as u16).to_le_bytes());
    } else if n <= 0xffff_ffff {
        out.push(254);
        out.extend_from_slice(&(n as u32).to_le_bytes());
    } else {
        out.push(255);
        out.extend_from_slice(&n.to_le_bytes());
    }
}

/// Cursor over an input buffer.
#[derive(Debug)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    /// Start reading at offset zero.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Take exactly `n` bytes.
    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(LlmqError::serialization(format!(
                "unexpected end of input: wanted {n} bytes at offset {}, {} left",
                self.pos,
                self.remaining()
            )));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    /// Take a fixed-size array.
    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    /// Read a little-endian u16.
    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.read_array::<2>()?))
    }

    /// Read a little-endian u32.
    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read_array::<4>()?))
    }

    /// Read a 32-byte hash.
    pub fn read_hash(&mut self) -> Result<Hash256> {
        Ok(Hash256(self.read_array::<32>()?))
    }

    /// Read a compact size, rejecting non-canonical encodings.
    pub fn read_compact_size(&mut self) -> Result<u64> {
        let tag = self.read_array::<1>()?[0];
        let (value, min) = match tag {
            0..=252 => return Ok(u64::from(tag)),
            253 => (u64::from(self.read_u16()?), 253),
            254 => (u64::from(self.read_u32()?), 0x1_0000),
            _ => (u64::from_le_bytes(self.read_array::<8>()?), 0x1_0000_0000),
        };
        if value < min {
            return Err(LlmqError::serialization("non-canonical compact size"));
        }
        Ok(value)
    }

    /// Fail unless every byte was consumed.
    pub fn finish(self) -> Result<()> {
        if self.remaining() != 0 {
            return Err(LlmqError::serialization(format!(
                "{} trailing bytes",
                self.remaining()
            )));
        }
        Ok(())
    }
}
