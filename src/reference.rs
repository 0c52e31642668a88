//! Naive column-major GEMM used as the oracle for generated kernels.

use crate::config::GemmShape;

/// `c += a * b` for `shape`, accumulating each element in increasing `k` order with
/// fused multiply-adds, the same order a generated kernel uses.
///
/// Panics if a slice is shorter than the shape requires.
pub fn gemm(shape: &GemmShape, a: &[f32], b: &[f32], c: &mut [f32]) {
    let (lda, ldb, ldc) = (shape.lda as usize, shape.ldb as usize, shape.ldc as usize);
    assert!(a.len() >= shape.a_len(), "A holds {} floats", a.len());
    assert!(b.len() >= shape.b_len(), "B holds {} floats", b.len());
    assert!(c.len() >= shape.c_len(), "C holds {} floats", c.len());
    for j in 0..shape.n as usize {
        for kk in 0..shape.k as usize {
            let scalar = b[kk + j * ldb];
            for i in 0..shape.m as usize {
                let acc = &mut c[i + j * ldc];
                *acc = a[i + kk * lda].mul_add(scalar, *acc);
            }
        }
    }
}

/// Deterministic operand data whose products and sums stay exact in single precision.
///
/// Values are small dyadic rationals, so every intermediate result of a GEMM up to a
/// few hundred terms is representable and the oracle comparison can be bit exact.
pub fn dyadic(len: usize, seed: u32) -> Vec<f32> {
    let mut state = seed.wrapping_mul(0x9E37_79B9) | 1;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            ((state % 33) as f32 - 16.0) / 8.0
        })
        .collect()
}
