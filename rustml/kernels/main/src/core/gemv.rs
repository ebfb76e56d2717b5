//! Matrix-vector kernels over row-major `[rows][cols]` weights.
//!
//! Two precision tiers:
//! - `gemv_ref` accumulates in f64 and is the reference for correctness checks.
//! - `gemv` accumulates in f32 with fused multiply-add where the CPU has it.
//!
//! The two agree within `GEMV_TOLERANCE` (relative to the magnitude of the
//! accumulated terms); they are not bit-identical.
//!
//! Dispatch hierarchy for the dot product:
//! - x86_64: AVX2+FMA (8 lanes, two accumulators) -> scalar
//! - aarch64: NEON FMA (4 lanes) -> scalar

use half::{bf16, f16};
use rayon::prelude::*;

use crate::api::types::WeightView;
use crate::core::runtime::gemv_par_threshold;

/// Documented relative tolerance between `gemv` and `gemv_ref`.
pub const GEMV_TOLERANCE: f32 = 1e-4;

/// Scalar dot product with four independent accumulators.
fn dot_scalar(a: &[f32], b: &[f32]) -> f32 {
    let n = a.len();
    let mut acc = [0.0f32; 4];
    let chunks = n / 4;
    for c in 0..chunks {
        let i = c * 4;
        acc[0] += a[i] * b[i];
        acc[1] += a[i + 1] * b[i + 1];
        acc[2] += a[i + 2] * b[i + 2];
        acc[3] += a[i + 3] * b[i + 3];
    }
    let mut sum = (acc[0] + acc[1]) + (acc[2] + acc[3]);
    for i in chunks * 4..n {
        sum += a[i] * b[i];
    }
    sum
}

#[cfg(target_arch = "x86_64")]
mod x86 {
    #[target_feature(enable = "avx2,fma")]
    pub(super) unsafe fn dot_avx2_fma(a: &[f32], b: &[f32]) -> f32 {
        use std::arch::x86_64::*;

        let n = a.len();
        let mut acc0 = _mm256_setzero_ps();
        let mut acc1 = _mm256_setzero_ps();
        let mut i = 0;
        while i + 16 <= n {
            let a0 = _mm256_loadu_ps(a.as_ptr().add(i));
            let b0 = _mm256_loadu_ps(b.as_ptr().add(i));
            let a1 = _mm256_loadu_ps(a.as_ptr().add(i + 8));
            let b1 = _mm256_loadu_ps(b.as_ptr().add(i + 8));
            acc0 = _mm256_fmadd_ps(a0, b0, acc0);
            acc1 = _mm256_fmadd_ps(a1, b1, acc1);
            i += 16;
        }
        while i + 8 <= n {
            let a0 = _mm256_loadu_ps(a.as_ptr().add(i));
            let b0 = _mm256_loadu_ps(b.as_ptr().add(i));
            acc0 = _mm256_fmadd_ps(a0, b0, acc0);
            i += 8;
        }

        let sum = _mm256_add_ps(acc0, acc1);
        let hi = _mm256_extractf128_ps(sum, 1);
        let lo = _mm256_castps256_ps128(sum);
        let sum128 = _mm_add_ps(lo, hi);
        let shuf = _mm_movehdup_ps(sum128);
        let sums = _mm_add_ps(sum128, shuf);
        let shuf2 = _mm_movehl_ps(sums, sums);
        let result = _mm_add_ss(sums, shuf2);
        let mut total = _mm_cvtss_f32(result);

        // Scalar remainder
        while i < n {
            total += a[i] * b[i];
            i += 1;
        }
        total
    }
}

#[cfg(target_arch = "aarch64")]
mod neon {
    pub(super) unsafe fn dot_neon(a: &[f32], b: &[f32]) -> f32 {
        use std::arch::aarch64::*;

        let n = a.len();
        let mut acc = vdupq_n_f32(0.0);
        let mut i = 0;
        while i + 4 <= n {
            let va = vld1q_f32(a.as_ptr().add(i));
            let vb = vld1q_f32(b.as_ptr().add(i));
            acc = vfmaq_f32(acc, va, vb);
            i += 4;
        }
        let mut total = vaddvq_f32(acc);
        while i < n {
            total += a[i] * b[i];
            i += 1;
        }
        total
    }
}

/// Dot product of two equal-length slices.
///
/// Panics if `b` is shorter than `a`.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    let b = &b[..a.len()];

    #[cfg(target_arch = "x86_64")]
    if a.len() >= 8 && is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma") {
        // SAFETY: features checked above, `b` has been sliced to `a.len()`.
        return unsafe { x86::dot_avx2_fma(a, b) };
    }

    #[cfg(target_arch = "aarch64")]
    if a.len() >= 4 {
        // SAFETY: NEON is mandatory on aarch64, `b` has been sliced to `a.len()`.
        return unsafe { neon::dot_neon(a, b) };
    }

    dot_scalar(a, b)
}

/// `y += alpha * x`
pub fn axpy(alpha: f32, x: &[f32], y: &mut [f32]) {
    for (yi, &xi) in y.iter_mut().zip(x.iter()) {
        *yi += alpha * xi;
    }
}

/// Reference GEMV with f64 accumulation: `y = W x (+ b)`.
pub fn gemv_ref(w: &[f32], rows: usize, cols: usize, x: &[f32], bias: Option<&[f32]>, y: &mut [f32]) {
    assert!(w.len() >= rows * cols, "gemv_ref: weight has {} elements, need {}", w.len(), rows * cols);
    for r in 0..rows {
        let row = &w[r * cols..(r + 1) * cols];
        let mut acc = 0.0f64;
        for (&wi, &xi) in row.iter().zip(x[..cols].iter()) {
            acc += wi as f64 * xi as f64;
        }
        if let Some(b) = bias {
            acc += b[r] as f64;
        }
        y[r] = acc as f32;
    }
}

fn dot_f16(row: &[u16], x: &[f32]) -> f32 {
    let mut acc = 0.0f32;
    for (&bits, &xi) in row.iter().zip(x.iter()) {
        acc += f16::from_bits(bits).to_f32() * xi;
    }
    acc
}

fn dot_bf16(row: &[u16], x: &[f32]) -> f32 {
    let mut acc = 0.0f32;
    for (&bits, &xi) in row.iter().zip(x.iter()) {
        acc += bf16::from_bits(bits).to_f32() * xi;
    }
    acc
}

#[inline]
fn row_dot(w: WeightView<'_>, r: usize, cols: usize, x: &[f32]) -> f32 {
    let range = r * cols..(r + 1) * cols;
    match w {
        WeightView::F32(w) => dot(&w[range], x),
        WeightView::F16(w) => dot_f16(&w[range], x),
        WeightView::BF16(w) => dot_bf16(&w[range], x),
    }
}

/// High-throughput GEMV: `y = W x (+ b)` for `W: [rows, cols]`.
///
/// Rows are computed in parallel once `rows * cols` reaches the configured
/// threshold. Each output row is owned by exactly one task, so results do not
/// depend on the thread count.
pub fn gemv(w: WeightView<'_>, rows: usize, cols: usize, x: &[f32], bias: Option<&[f32]>, y: &mut [f32]) {
    assert!(w.len() >= rows * cols, "gemv: weight has {} elements, need {}", w.len(), rows * cols);
    assert!(x.len() >= cols, "gemv: input has {} elements, need {}", x.len(), cols);
    let x = &x[..cols];
    let y = &mut y[..rows];

    let compute = |r: usize| -> f32 {
        let mut acc = row_dot(w, r, cols, x);
        if let Some(b) = bias {
            acc += b[r];
        }
        acc
    };

    if rows * cols >= gemv_par_threshold() && rows > 1 {
        y.par_iter_mut().enumerate().for_each(|(r, out)| *out = compute(r));
    } else {
        for (r, out) in y.iter_mut().enumerate() {
            *out = compute(r);
        }
    }
}

/// GEMV over FP16 bit-pattern weights.
pub fn gemv_f16(w: &[u16], rows: usize, cols: usize, x: &[f32], bias: Option<&[f32]>, y: &mut [f32]) {
    gemv(WeightView::F16(w), rows, cols, x, bias, y);
}

/// GEMV over BF16 bit-pattern weights.
pub fn gemv_bf16(w: &[u16], rows: usize, cols: usize, x: &[f32], bias: Option<&[f32]>, y: &mut [f32]) {
    gemv(WeightView::BF16(w), rows, cols, x, bias, y);
}

/// Backward through a GEMV with respect to its input: `dx += Wᵀ dy`.
pub fn gemv_transposed_acc(w: WeightView<'_>, rows: usize, cols: usize, dy: &[f32], dx: &mut [f32]) {
    assert!(w.len() >= rows * cols, "gemv_transposed_acc: weight too small");
    let dx = &mut dx[..cols];
    for r in 0..rows {
        let g = dy[r];
        if g == 0.0 {
            continue;
        }
        let range = r * cols..(r + 1) * cols;
        match w {
            WeightView::F32(w) => axpy(g, &w[range], dx),
            WeightView::F16(w) => {
                for (d, &bits) in dx.iter_mut().zip(w[range].iter()) {
                    *d += g * f16::from_bits(bits).to_f32();
                }
            }
            WeightView::BF16(w) => {
                for (d, &bits) in dx.iter_mut().zip(w[range].iter()) {
                    *d += g * bf16::from_bits(bits).to_f32();
                }
            }
        }
    }
}

/// Weight-gradient accumulation: `dW += dy ⊗ x` for `dW: [rows, cols]`.
pub fn outer_acc(dw: &mut [f32], rows: usize, cols: usize, dy: &[f32], x: &[f32]) {
    assert!(dw.len() >= rows * cols, "outer_acc: gradient buffer too small");
    let x = &x[..cols];
    for r in 0..rows {
        let g = dy[r];
        if g == 0.0 {
            continue;
        }
        axpy(g, x, &mut dw[r * cols..(r + 1) * cols]);
    }
}

/// Row-batched GEMM: `y[n] = W x[n] (+ b)` for `n` rows of `x: [n, cols]`, `y: [n, rows]`.
pub fn matmul_rows(
    w: WeightView<'_>,
    rows: usize,
    cols: usize,
    x: &[f32],
    n: usize,
    bias: Option<&[f32]>,
    y: &mut [f32],
) {
    for t in 0..n {
        gemv(
            w,
            rows,
            cols,
            &x[t * cols..(t + 1) * cols],
            bias,
            &mut y[t * rows..(t + 1) * rows],
        );
    }
}

/// Row-batched `dx[n] += Wᵀ dy[n]`.
pub fn matmul_rows_transposed_acc(
    w: WeightView<'_>,
    rows: usize,
    cols: usize,
    dy: &[f32],
    n: usize,
    dx: &mut [f32],
) {
    for t in 0..n {
        gemv_transposed_acc(
            w,
            rows,
            cols,
            &dy[t * rows..(t + 1) * rows],
            &mut dx[t * cols..(t + 1) * cols],
        );
    }
}

/// Row-batched `dW += Σ_n dy[n] ⊗ x[n]`.
pub fn outer_acc_rows(dw: &mut [f32], rows: usize, cols: usize, dy: &[f32], x: &[f32], n: usize) {
    for t in 0..n {
        outer_acc(
            dw,
            rows,
            cols,
            &dy[t * rows..(t + 1) * rows],
            &x[t * cols..(t + 1) * cols],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dot_matches_scalar() {
        let a: Vec<f32> = (0..37).map(|i| i as f32 * 0.25 - 3.0).collect();
        let b: Vec<f32> = (0..37).map(|i| (i as f32).sin()).collect();
        let fast = dot(&a, &b);
        let slow = dot_scalar(&a, &b);
        assert!((fast - slow).abs() < 1e-4, "{} vs {}", fast, slow);
    }

    #[test]
    fn test_gemv_bias() {
        let w = [1.0, 0.0, 0.0, 1.0, 1.0, 1.0];
        let mut y = [0.0; 3];
        gemv(WeightView::F32(&w), 3, 2, &[2.0, 3.0], Some(&[0.5, 0.5, 0.5]), &mut y);
        assert_eq!(y, [2.5, 3.5, 5.5]);
    }

    #[test]
    fn test_transposed_and_outer() {
        // W = [[1,2],[3,4]]
        let w = [1.0, 2.0, 3.0, 4.0];
        let mut dx = [0.0; 2];
        gemv_transposed_acc(WeightView::F32(&w), 2, 2, &[1.0, 1.0], &mut dx);
        assert_eq!(dx, [4.0, 6.0]);

        let mut dw = [0.0; 4];
        outer_acc(&mut dw, 2, 2, &[1.0, 2.0], &[3.0, 4.0]);
        assert_eq!(dw, [3.0, 4.0, 6.0, 8.0]);
    }

    #[test]
    fn test_gemv_packed_f16() {
        let w: Vec<u16> = [1.0f32, -2.0, 0.5, 4.0]
            .iter()
            .map(|&v| f16::from_f32(v).to_bits())
            .collect();
        let mut y = [0.0; 2];
        gemv(WeightView::F16(&w), 2, 2, &[1.0, 1.0], None, &mut y);
        assert_eq!(y, [-1.0, 4.5]);
    }
}
