//! Rotary Position Encoding (RoPE) and sinusoidal position tables.
//!
//! RoPE pairs element `i` with element `i + head_dim/2` of each head and
//! rotates the pair by `pos * theta^(-2i/head_dim)`.

use std::time::Instant;

use crate::api::error::{KernelError, KernelResult};

/// Rotate half_dim pairs in place using AVX2.
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn rope_rotate_avx2(x: &mut [f32], cos: &[f32], sin: &[f32], half_dim: usize, sign: f32) {
    use std::arch::x86_64::*;
    let v_sign = _mm256_set1_ps(sign);
    let mut i = 0;
    while i + 8 <= half_dim {
        let v_x1 = _mm256_loadu_ps(x.as_ptr().add(i));
        let v_x2 = _mm256_loadu_ps(x.as_ptr().add(half_dim + i));
        let v_cos = _mm256_loadu_ps(cos.as_ptr().add(i));
        let v_sin = _mm256_mul_ps(_mm256_loadu_ps(sin.as_ptr().add(i)), v_sign);

        // first_half[i] = x1*cos - x2*sin
        let first = _mm256_sub_ps(_mm256_mul_ps(v_x1, v_cos), _mm256_mul_ps(v_x2, v_sin));
        // second_half[i] = x1*sin + x2*cos
        let second = _mm256_add_ps(_mm256_mul_ps(v_x1, v_sin), _mm256_mul_ps(v_x2, v_cos));

        _mm256_storeu_ps(x.as_mut_ptr().add(i), first);
        _mm256_storeu_ps(x.as_mut_ptr().add(half_dim + i), second);
        i += 8;
    }
    rope_rotate_scalar(x, cos, sin, half_dim, sign, i);
}

/// Rotate half_dim pairs in place using NEON.
#[cfg(target_arch = "aarch64")]
unsafe fn rope_rotate_neon(x: &mut [f32], cos: &[f32], sin: &[f32], half_dim: usize, sign: f32) {
    use std::arch::aarch64::*;
    let v_sign = vdupq_n_f32(sign);
    let mut i = 0;
    while i + 4 <= half_dim {
        let v_x1 = vld1q_f32(x.as_ptr().add(i));
        let v_x2 = vld1q_f32(x.as_ptr().add(half_dim + i));
        let v_cos = vld1q_f32(cos.as_ptr().add(i));
        let v_sin = vmulq_f32(vld1q_f32(sin.as_ptr().add(i)), v_sign);

        let first = vsubq_f32(vmulq_f32(v_x1, v_cos), vmulq_f32(v_x2, v_sin));
        let second = vaddq_f32(vmulq_f32(v_x1, v_sin), vmulq_f32(v_x2, v_cos));

        vst1q_f32(x.as_mut_ptr().add(i), first);
        vst1q_f32(x.as_mut_ptr().add(half_dim + i), second);
        i += 4;
    }
    rope_rotate_scalar(x, cos, sin, half_dim, sign, i);
}

fn rope_rotate_scalar(x: &mut [f32], cos: &[f32], sin: &[f32], half_dim: usize, sign: f32, start: usize) {
    for i in start..half_dim {
        let x1 = x[i];
        let x2 = x[half_dim + i];
        let s = sin[i] * sign;
        x[i] = x1 * cos[i] - x2 * s;
        x[half_dim + i] = x1 * s + x2 * cos[i];
    }
}

/// Precomputed cos/sin tables for Rotary Position Encoding.
#[derive(Debug, Clone)]
pub struct RopeTable {
    cos_table: Vec<f32>, // [max_len, head_dim/2]
    sin_table: Vec<f32>, // [max_len, head_dim/2]
    half_dim: usize,
    max_len: usize,
}

impl RopeTable {
    /// Build cos/sin tables for the given head_dim and maximum sequence length.
    pub fn new(head_dim: usize, max_len: usize, theta: f32) -> KernelResult<Self> {
        if head_dim == 0 || head_dim % 2 != 0 {
            return Err(KernelError::InvalidArgument(format!(
                "RoPE needs an even, non-zero head_dim, got {}",
                head_dim
            )));
        }
        let half_dim = head_dim / 2;
        let mut cos_table = Vec::with_capacity(max_len * half_dim);
        let mut sin_table = Vec::with_capacity(max_len * half_dim);

        for pos in 0..max_len {
            for i in 0..half_dim {
                let freq = 1.0 / (theta as f64).powf(2.0 * i as f64 / head_dim as f64);
                let angle = pos as f64 * freq;
                cos_table.push(angle.cos() as f32);
                sin_table.push(angle.sin() as f32);
            }
        }

        Ok(Self { cos_table, sin_table, half_dim, max_len })
    }

    pub fn head_dim(&self) -> usize {
        self.half_dim * 2
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    fn rotate(&self, head: &mut [f32], pos: usize, sign: f32) {
        assert!(pos < self.max_len, "RoPE position {} beyond table length {}", pos, self.max_len);
        let half = self.half_dim;
        let head = &mut head[..half * 2];
        let offset = pos * half;
        let cos = &self.cos_table[offset..offset + half];
        let sin = &self.sin_table[offset..offset + half];

        #[cfg(target_arch = "x86_64")]
        if half >= 8 && is_x86_feature_detected!("avx2") {
            // SAFETY: feature checked, slices are exactly half/2*half long.
            unsafe { rope_rotate_avx2(head, cos, sin, half, sign) };
            return;
        }

        #[cfg(target_arch = "aarch64")]
        if half >= 4 {
            // SAFETY: NEON is mandatory on aarch64, slices sized above.
            unsafe { rope_rotate_neon(head, cos, sin, half, sign) };
            return;
        }

        rope_rotate_scalar(head, cos, sin, half, sign, 0);
    }

    /// Rotate one head vector in place for absolute position `pos`.
    pub fn apply(&self, head: &mut [f32], pos: usize) {
        self.rotate(head, pos, 1.0);
    }

    /// Inverse rotation; this is the backward pass of `apply`.
    pub fn apply_inverse(&self, head: &mut [f32], pos: usize) {
        self.rotate(head, pos, -1.0);
    }

    /// Rotate every head of a packed `[num_heads * head_dim]` row.
    pub fn apply_heads(&self, row: &mut [f32], num_heads: usize, pos: usize) {
        let hd = self.head_dim();
        for h in 0..num_heads {
            self.apply(&mut row[h * hd..(h + 1) * hd], pos);
        }
    }

    /// Inverse rotation of every head of a packed row.
    pub fn apply_heads_inverse(&self, row: &mut [f32], num_heads: usize, pos: usize) {
        let hd = self.head_dim();
        for h in 0..num_heads {
            self.apply_inverse(&mut row[h * hd..(h + 1) * hd], pos);
        }
    }

    /// Rotate `rows` packed rows whose first row sits at position `start_pos`.
    pub fn apply_rows(&self, data: &mut [f32], rows: usize, num_heads: usize, start_pos: usize) {
        let _t = if log::log_enabled!(log::Level::Trace) { Some(Instant::now()) } else { None };
        let width = num_heads * self.head_dim();
        for r in 0..rows {
            self.apply_heads(&mut data[r * width..(r + 1) * width], num_heads, start_pos + r);
        }
        if let Some(t) = _t {
            log::trace!("[perf] rope::apply_rows rows={} heads={} {:.3}ms", rows, num_heads, t.elapsed().as_secs_f64() * 1000.0);
        }
    }

    /// Inverse of `apply_rows`.
    pub fn apply_rows_inverse(&self, data: &mut [f32], rows: usize, num_heads: usize, start_pos: usize) {
        let width = num_heads * self.head_dim();
        for r in 0..rows {
            self.apply_heads_inverse(&mut data[r * width..(r + 1) * width], num_heads, start_pos + r);
        }
    }
}

/// Write the sinusoidal encoding of `pos` into `out` (length = model dim).
///
/// `out[2i] = sin(pos / 10000^(2i/d))`, `out[2i+1] = cos(pos / 10000^(2i/d))`.
pub fn sinusoidal_encoding(pos: usize, out: &mut [f32]) {
    let d = out.len();
    for i in 0..d {
        let pair = (i / 2) as f64;
        let angle = pos as f64 / 10000f64.powf(2.0 * pair / d as f64);
        out[i] = if i % 2 == 0 { angle.sin() as f32 } else { angle.cos() as f32 };
    }
}

/// Precomputed sinusoidal position table `[max_len, dim]`.
#[derive(Debug, Clone)]
pub struct SinusoidalTable {
    data: Vec<f32>,
    dim: usize,
    max_len: usize,
}

impl SinusoidalTable {
    pub fn new(dim: usize, max_len: usize) -> Self {
        let mut data = vec![0.0f32; dim * max_len];
        for pos in 0..max_len {
            sinusoidal_encoding(pos, &mut data[pos * dim..(pos + 1) * dim]);
        }
        Self { data, dim, max_len }
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    pub fn row(&self, pos: usize) -> &[f32] {
        &self.data[pos * self.dim..(pos + 1) * self.dim]
    }

    /// `x += table[pos]`
    pub fn add_to(&self, x: &mut [f32], pos: usize) {
        for (xi, &p) in x.iter_mut().zip(self.row(pos)) {
            *xi += p;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rope_odd_head_dim_rejected() {
        assert!(RopeTable::new(7, 16, 10000.0).is_err());
    }

    #[test]
    fn test_rope_position_zero_is_identity() {
        let rope = RopeTable::new(32, 8, 10000.0).unwrap();
        let original: Vec<f32> = (0..32).map(|i| i as f32 * 0.1).collect();
        let mut x = original.clone();
        rope.apply(&mut x, 0);
        for (a, b) in x.iter().zip(&original) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_rope_inverse_round_trip() {
        let rope = RopeTable::new(20, 64, 10000.0).unwrap();
        let original: Vec<f32> = (0..20).map(|i| (i as f32).cos()).collect();
        let mut x = original.clone();
        rope.apply(&mut x, 37);
        rope.apply_inverse(&mut x, 37);
        for (a, b) in x.iter().zip(&original) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_rope_preserves_norm() {
        let rope = RopeTable::new(16, 32, 10000.0).unwrap();
        let mut x: Vec<f32> = (0..16).map(|i| i as f32 - 8.0).collect();
        let before: f32 = x.iter().map(|v| v * v).sum();
        rope.apply(&mut x, 11);
        let after: f32 = x.iter().map(|v| v * v).sum();
        assert!((before - after).abs() / before < 1e-5);
    }

    #[test]
    fn test_sinusoidal_position_zero() {
        let table = SinusoidalTable::new(6, 4);
        assert_eq!(table.row(0), &[0.0, 1.0, 0.0, 1.0, 0.0, 1.0]);
    }
}
