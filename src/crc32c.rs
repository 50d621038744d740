//! CRC32C algebra for the span certification protocol.
//!
//! The digest itself comes from the `crc32c` crate. On top of it we need
//! the linear-algebra operations no off-the-shelf crate provides: combining
//! the checksum of a concatenation from the parts, extending (or
//! contracting) by runs of zero bytes, and the checksum of an XOR of two
//! equal-length streams. All three reduce to multiplying the 32-bit CRC
//! register by powers of x in GF(2)[x] mod the Castagnoli polynomial, which
//! we do with 32x32 bit matrices and square-and-multiply.

use crate::types::Crc;

const POLY: u32 = 0x82F6_3B78; // Castagnoli, reflected

pub fn crc32c(data: &[u8]) -> Crc {
    Crc(crc32c::crc32c(data))
}

pub fn crc32c_extend(crc: Crc, data: &[u8]) -> Crc {
    Crc(crc32c::crc32c_append(crc.0, data))
}

/// CRC of `a ++ b` given the two CRCs and the length of `b`.
pub fn crc32c_append(a: Crc, b: Crc, len_b: u64) -> Crc {
    Crc(shift(a.0, &byte_matrix_pow(len_b, false)) ^ b.0)
}

/// CRC after appending `zeros` zero bytes. Negative counts undo a previous
/// zero extension.
pub fn crc32c_zero_extend(crc: Crc, zeros: i64) -> Crc {
    let mat = byte_matrix_pow(zeros.unsigned_abs(), zeros < 0);
    Crc(shift(crc.0, &mat) ^ zero_term(&mat))
}

/// CRC of the byte-wise XOR of two equal-length streams.
pub fn crc32c_xor(a: Crc, b: Crc, len: u64) -> Crc {
    let mat = byte_matrix_pow(len, false);
    Crc(a.0 ^ b.0 ^ zero_term(&mat))
}

// A matrix is 32 columns, column i being the image of bit i.
type Mat = [u32; 32];

fn shift(v: u32, m: &Mat) -> u32 {
    let mut out = 0;
    let mut v = v;
    let mut i = 0;
    while v != 0 {
        if v & 1 != 0 {
            out ^= m[i];
        }
        v >>= 1;
        i += 1;
    }
    out
}

fn mat_mul(a: &Mat, b: &Mat) -> Mat {
    let mut out = [0u32; 32];
    for i in 0..32 {
        out[i] = shift(b[i], a);
    }
    out
}

fn identity() -> Mat {
    let mut m = [0u32; 32];
    for (i, col) in m.iter_mut().enumerate() {
        *col = 1 << i;
    }
    m
}

/// Register advance by a single zero byte, in the reflected representation:
/// `r' = (r >> 8) ^ T[r & 0xff]`.
fn one_zero_byte() -> Mat {
    let mut table = [0u32; 256];
    for (b, slot) in table.iter_mut().enumerate() {
        let mut r = b as u32;
        for _ in 0..8 {
            r = if r & 1 != 0 { (r >> 1) ^ POLY } else { r >> 1 };
        }
        *slot = r;
    }
    let mut m = [0u32; 32];
    for (i, col) in m.iter_mut().enumerate() {
        let v = 1u32 << i;
        *col = (v >> 8) ^ table[(v & 0xFF) as usize];
    }
    m
}

/// Gauss-Jordan inverse over GF(2). The step matrix is always invertible:
/// it is multiplication by x^8 modulo a polynomial with nonzero constant
/// term. Eliminating directly on the column-per-entry layout yields the
/// inverse in the same layout.
fn mat_inverse(m: &Mat) -> Mat {
    let mut a = *m;
    let mut inv = identity();
    for col in 0..32 {
        let pivot = (col..32)
            .find(|&r| a[r] & (1 << col) != 0)
            .expect("singular crc step matrix");
        a.swap(col, pivot);
        inv.swap(col, pivot);
        for r in 0..32 {
            if r != col && a[r] & (1 << col) != 0 {
                a[r] ^= a[col];
                inv[r] ^= inv[col];
            }
        }
    }
    inv
}

/// `M^n` for the one-zero-byte step (or its inverse when `invert`).
fn byte_matrix_pow(n: u64, invert: bool) -> Mat {
    let mut base = one_zero_byte();
    if invert {
        base = mat_inverse(&base);
    }
    let mut result = identity();
    let mut n = n;
    while n != 0 {
        if n & 1 != 0 {
            result = mat_mul(&base, &result);
        }
        base = mat_mul(&base, &base);
        n >>= 1;
    }
    result
}

/// The affine part contributed by the pre/post conditioning: the CRC of
/// `len(m)` zero bytes is `M(!0) ^ !0`.
fn zero_term(m: &Mat) -> u32 {
    shift(!0, m) ^ !0
}
