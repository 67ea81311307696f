//! Scalar-field and group arithmetic on top of the raw blst bindings.
//!
//! The high-level `blst::min_pk` API covers signing, verification and
//! aggregation but not scalar multiplication or field arithmetic, which
//! secret sharing needs (polynomial evaluation, Lagrange interpolation,
//! Diffie-Hellman). Everything here works on values that are already valid
//! field elements or curve points; decoding and validation happen at the
//! boundary in `bls::mod`.

#![allow(unsafe_code)]

use blst::{
    blst_bendian_from_scalar, blst_fr, blst_fr_add, blst_fr_from_scalar, blst_fr_inverse,
    blst_fr_mul, blst_fr_sub, blst_p1, blst_p1_add_or_double, blst_p1_affine, blst_p1_compress,
    blst_p1_from_affine, blst_p1_is_inf, blst_p1_mult, blst_p1_uncompress, blst_p2,
    blst_p2_add_or_double, blst_p2_affine, blst_p2_compress, blst_p2_from_affine, blst_p2_is_inf,
    blst_p2_mult, blst_p2_uncompress, blst_scalar, blst_scalar_fr_check,
    blst_scalar_from_be_bytes, blst_scalar_from_bendian, blst_scalar_from_fr, BLST_ERROR,
};
use zeroize::Zeroize;

/// Bit length of the group order.
const SCALAR_BITS: usize = 255;

/// Element of the scalar field Fr.
#[derive(Clone, Copy, Default)]
pub(crate) struct Fr(blst_fr);

impl Fr {
    pub(crate) fn zero() -> Self {
        Self::default()
    }

    pub(crate) fn one() -> Self {
        Self::from_u64(1)
    }

    pub(crate) fn from_u64(n: u64) -> Self {
        let mut be = [0u8; 32];
        be[24..].copy_from_slice(&n.to_be_bytes());
        // n < 2^64 is always below the group order
        Self::from_be_bytes(&be).unwrap_or_default()
    }

    /// Parse a canonical big-endian scalar (must be below the group order).
    pub(crate) fn from_be_bytes(bytes: &[u8; 32]) -> Option<Self> {
        let mut scalar = blst_scalar::default();
        let mut fr = blst_fr::default();
        // SAFETY: `bytes` is 32 readable bytes and both outputs are valid
        // stack locations of the expected blst types.
        let ok = unsafe {
            blst_scalar_from_bendian(&mut scalar, bytes.as_ptr());
            let ok = blst_scalar_fr_check(&scalar);
            if ok {
                blst_fr_from_scalar(&mut fr, &scalar);
            }
            ok
        };
        scalar.b.zeroize();
        ok.then_some(Self(fr))
    }

    /// Reduce an arbitrary big-endian digest modulo the group order.
    /// `None` when the result is zero.
    pub(crate) fn from_digest(bytes: &[u8]) -> Option<Self> {
        let mut scalar = blst_scalar::default();
        let mut fr = blst_fr::default();
        // SAFETY: `bytes` is `bytes.len()` readable bytes and both outputs
        // are valid stack locations of the expected blst types.
        let non_zero = unsafe {
            let non_zero = blst_scalar_from_be_bytes(&mut scalar, bytes.as_ptr(), bytes.len());
            blst_fr_from_scalar(&mut fr, &scalar);
            non_zero
        };
        scalar.b.zeroize();
        non_zero.then_some(Self(fr))
    }

    pub(crate) fn to_be_bytes(self) -> [u8; 32] {
        let mut scalar = self.to_scalar();
        let mut out = [0u8; 32];
        // SAFETY: `out` has room for 32 bytes.
        unsafe { blst_bendian_from_scalar(out.as_mut_ptr(), &scalar) };
        scalar.b.zeroize();
        out
    }

    fn to_scalar(self) -> blst_scalar {
        let mut scalar = blst_scalar::default();
        // SAFETY: plain value conversion between initialised blst structs.
        unsafe { blst_scalar_from_fr(&mut scalar, &self.0) };
        scalar
    }

    pub(crate) fn is_zero(&self) -> bool {
        self.to_be_bytes().iter().all(|b| *b == 0)
    }

    pub(crate) fn add(&self, other: &Fr) -> Fr {
        let mut out = blst_fr::default();
        // SAFETY: all pointers reference initialised field elements.
        unsafe { blst_fr_add(&mut out, &self.0, &other.0) };
        Fr(out)
    }

    pub(crate) fn sub(&self, other: &Fr) -> Fr {
        let mut out = blst_fr::default();
        // SAFETY: as above.
        unsafe { blst_fr_sub(&mut out, &self.0, &other.0) };
        Fr(out)
    }

    pub(crate) fn mul(&self, other: &Fr) -> Fr {
        let mut out = blst_fr::default();
        // SAFETY: as above.
        unsafe { blst_fr_mul(&mut out, &self.0, &other.0) };
        Fr(out)
    }

    /// Multiplicative inverse; `None` for zero.
    pub(crate) fn inverse(&self) -> Option<Fr> {
        if self.is_zero() {
            return None;
        }
        let mut out = blst_fr::default();
        // SAFETY: as above; the input is non-zero.
        unsafe { blst_fr_inverse(&mut out, &self.0) };
        Some(Fr(out))
    }
}

/// Point on G1 (public keys) in projective form.
#[derive(Clone, Copy, Default)]
pub(crate) struct G1(blst_p1);

impl G1 {
    pub(crate) fn from_compressed(bytes: &[u8; 48]) -> Option<Self> {
        let mut affine = blst_p1_affine::default();
        // SAFETY: `bytes` is 48 readable bytes.
        let err = unsafe { blst_p1_uncompress(&mut affine, bytes.as_ptr()) };
        if err != BLST_ERROR::BLST_SUCCESS {
            return None;
        }
        let mut p = blst_p1::default();
        // SAFETY: `affine` was initialised by the successful uncompress.
        unsafe { blst_p1_from_affine(&mut p, &affine) };
        Some(Self(p))
    }

    pub(crate) fn to_compressed(&self) -> [u8; 48] {
        let mut out = [0u8; 48];
        // SAFETY: `out` has room for a compressed G1 point.
        unsafe { blst_p1_compress(out.as_mut_ptr(), &self.0) };
        out
    }

    pub(crate) fn add(&self, other: &G1) -> G1 {
        let mut out = blst_p1::default();
        // SAFETY: all pointers reference initialised points.
        unsafe { blst_p1_add_or_double(&mut out, &self.0, &other.0) };
        G1(out)
    }

    pub(crate) fn mul(&self, k: &Fr) -> G1 {
        let mut scalar = k.to_scalar();
        let mut out = blst_p1::default();
        // SAFETY: `scalar.b` holds 32 little-endian bytes, enough for 255 bits.
        unsafe { blst_p1_mult(&mut out, &self.0, scalar.b.as_ptr(), SCALAR_BITS) };
        scalar.b.zeroize();
        G1(out)
    }

    pub(crate) fn is_identity(&self) -> bool {
        // SAFETY: reads an initialised point.
        unsafe { blst_p1_is_inf(&self.0) }
    }
}

/// Point on G2 (signatures) in projective form.
#[derive(Clone, Copy, Default)]
pub(crate) struct G2(blst_p2);

impl G2 {
    pub(crate) fn from_compressed(bytes: &[u8; 96]) -> Option<Self> {
        let mut affine = blst_p2_affine::default();
        // SAFETY: `bytes` is 96 readable bytes.
        let err = unsafe { blst_p2_uncompress(&mut affine, bytes.as_ptr()) };
        if err != BLST_ERROR::BLST_SUCCESS {
            return None;
        }
        let mut p = blst_p2::default();
        // SAFETY: `affine` was initialised by the successful uncompress.
        unsafe { blst_p2_from_affine(&mut p, &affine) };
        Some(Self(p))
    }

    pub(crate) fn to_compressed(&self) -> [u8; 96] {
        let mut out = [0u8; 96];
        // SAFETY: `out` has room for a compressed G2 point.
        unsafe { blst_p2_compress(out.as_mut_ptr(), &self.0) };
        out
    }

    pub(crate) fn add(&self, other: &G2) -> G2 {
        let mut out = blst_p2::default();
        // SAFETY: all pointers reference initialised points.
        unsafe { blst_p2_add_or_double(&mut out, &self.0, &other.0) };
        G2(out)
    }

    pub(crate) fn mul(&self, k: &Fr) -> G2 {
        let mut scalar = k.to_scalar();
        let mut out = blst_p2::default();
        // SAFETY: `scalar.b` holds 32 little-endian bytes, enough for 255 bits.
        unsafe { blst_p2_mult(&mut out, &self.0, scalar.b.as_ptr(), SCALAR_BITS) };
        scalar.b.zeroize();
        G2(out)
    }

    pub(crate) fn is_identity(&self) -> bool {
        // SAFETY: reads an initialised point.
        unsafe { blst_p2_is_inf(&self.0) }
    }
}

/// Evaluate `sum(coeffs[j] * x^j)` with Horner's rule.
pub(crate) fn eval_fr(coeffs: &[Fr], x: &Fr) -> Fr {
    coeffs
        .iter()
        .rev()
        .fold(Fr::zero(), |acc, c| acc.mul(x).add(c))
}

/// Evaluate a polynomial whose coefficients are committed in G1.
pub(crate) fn eval_g1(coeffs: &[G1], x: &Fr) -> Option<G1> {
    let (last, rest) = coeffs.split_last()?;
    Some(rest.iter().rev().fold(*last, |acc, c| acc.mul(x).add(c)))
}

/// Lagrange basis coefficients at zero for the given evaluation points.
pub(crate) fn lagrange_at_zero(xs: &[Fr]) -> Option<Vec<Fr>> {
    let mut out = Vec::with_capacity(xs.len());
    for (i, xi) in xs.iter().enumerate() {
        let mut num = Fr::one();
        let mut den = Fr::one();
        for (j, xj) in xs.iter().enumerate() {
            if i == j {
                continue;
            }
            num = num.mul(xj);
            den = den.mul(&xj.sub(xi));
        }
        // Duplicate x values make the denominator vanish
        out.push(num.mul(&den.inverse()?));
    }
    Some(out)
}
