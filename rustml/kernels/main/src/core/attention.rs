//! Scaled dot-product attention over strided, packed rows.
//!
//! Query, key, value and output rows are read in place: row `i` of a head
//! starts at `i * stride` of the slice handed in, so a head of a packed
//! `[T, H * head_dim]` buffer is addressed by slicing at `h * head_dim` and
//! passing `stride = H * head_dim`.
//!
//! A query row whose keys are all masked produces a zero output row and
//! contributes no gradient.

use std::time::Instant;

use crate::api::error::{KernelError, KernelResult};
use crate::api::types::AttentionStrategy;
use crate::core::gemv::{axpy, dot};
use crate::core::softmax::softmax_in_place;

/// Keys processed per block by the online-softmax strategy.
pub const FLASH_BLOCK: usize = 64;

/// `1 / sqrt(head_dim)`
pub fn default_scale(head_dim: usize) -> f32 {
    1.0 / (head_dim as f32).sqrt()
}

/// Shapes and row strides for one attention head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttentionDims {
    pub q_len: usize,
    pub kv_len: usize,
    pub head_dim: usize,
    pub q_stride: usize,
    pub kv_stride: usize,
    pub out_stride: usize,
}

impl AttentionDims {
    /// Dense single-head layout where every stride equals `head_dim`.
    pub fn contiguous(q_len: usize, kv_len: usize, head_dim: usize) -> Self {
        Self { q_len, kv_len, head_dim, q_stride: head_dim, kv_stride: head_dim, out_stride: head_dim }
    }

    fn span(rows: usize, stride: usize, head_dim: usize) -> usize {
        if rows == 0 {
            0
        } else {
            (rows - 1) * stride + head_dim
        }
    }

    pub fn validate(&self, q: usize, k: usize, v: usize, out: usize) -> KernelResult<()> {
        if self.head_dim == 0 {
            return Err(KernelError::InvalidArgument("attention head_dim must be > 0".into()));
        }
        if self.q_stride < self.head_dim || self.kv_stride < self.head_dim || self.out_stride < self.head_dim {
            return Err(KernelError::InvalidArgument(format!(
                "attention strides ({}, {}, {}) smaller than head_dim {}",
                self.q_stride, self.kv_stride, self.out_stride, self.head_dim
            )));
        }
        let need_q = Self::span(self.q_len, self.q_stride, self.head_dim);
        let need_kv = Self::span(self.kv_len, self.kv_stride, self.head_dim);
        let need_out = Self::span(self.q_len, self.out_stride, self.head_dim);
        if q < need_q || k < need_kv || v < need_kv || out < need_out {
            return Err(KernelError::ShapeMismatch(format!(
                "attention buffers q={} k={} v={} out={}, need q={} kv={} out={}",
                q, k, v, out, need_q, need_kv, need_out
            )));
        }
        Ok(())
    }

    #[inline]
    fn q_row<'a>(&self, q: &'a [f32], i: usize) -> &'a [f32] {
        &q[i * self.q_stride..i * self.q_stride + self.head_dim]
    }

    #[inline]
    fn kv_row<'a>(&self, kv: &'a [f32], u: usize) -> &'a [f32] {
        &kv[u * self.kv_stride..u * self.kv_stride + self.head_dim]
    }
}

/// Which (query, key) pairs may attend.
///
/// Key `u` sits at absolute position `u`; query row `i` sits at
/// `q_offset + i`. With `causal` set, a query only sees keys at or before its
/// own position.
#[derive(Debug, Clone, Copy, Default)]
pub struct AttentionMask<'a> {
    pub causal: bool,
    pub q_offset: usize,
    pub key_valid: Option<&'a [bool]>,
}

impl<'a> AttentionMask<'a> {
    pub fn causal(q_offset: usize) -> Self {
        Self { causal: true, q_offset, key_valid: None }
    }

    pub fn with_key_valid(mut self, key_valid: &'a [bool]) -> Self {
        self.key_valid = Some(key_valid);
        self
    }

    #[inline]
    pub fn allows(&self, qi: usize, u: usize) -> bool {
        if self.causal && u > self.q_offset + qi {
            return false;
        }
        match self.key_valid {
            Some(valid) => valid[u],
            None => true,
        }
    }
}

impl AttentionStrategy {
    /// Scratch length one head needs for `attention_forward`.
    pub fn work_len(self, q_len: usize, kv_len: usize) -> usize {
        match self {
            AttentionStrategy::Materialized => q_len * kv_len,
            AttentionStrategy::Recompute => kv_len,
            AttentionStrategy::Flash => FLASH_BLOCK,
        }
    }
}

/// Masked, scaled scores of query row `i` into `row`, then softmax.
/// Returns `false` when every key is masked (row left all zeros).
fn probability_row(
    q: &[f32],
    k: &[f32],
    dims: &AttentionDims,
    mask: &AttentionMask<'_>,
    scale: f32,
    i: usize,
    row: &mut [f32],
) -> bool {
    let qi = dims.q_row(q, i);
    for (u, s) in row.iter_mut().enumerate().take(dims.kv_len) {
        *s = if mask.allows(i, u) { dot(qi, dims.kv_row(k, u)) * scale } else { f32::NEG_INFINITY };
    }
    softmax_in_place(&mut row[..dims.kv_len])
}

fn weighted_sum(p: &[f32], v: &[f32], dims: &AttentionDims, out_row: &mut [f32]) {
    out_row.fill(0.0);
    for (u, &pu) in p.iter().enumerate() {
        if pu != 0.0 {
            axpy(pu, dims.kv_row(v, u), out_row);
        }
    }
}

/// Keeps the full `[q_len, kv_len]` probability matrix in `probs` for the backward pass.
pub fn attention_forward_materialized(
    q: &[f32],
    k: &[f32],
    v: &[f32],
    dims: &AttentionDims,
    mask: &AttentionMask<'_>,
    scale: f32,
    probs: &mut [f32],
    out: &mut [f32],
) {
    let kv = dims.kv_len;
    for i in 0..dims.q_len {
        let row = &mut probs[i * kv..(i + 1) * kv];
        let o = i * dims.out_stride;
        let out_row = &mut out[o..o + dims.head_dim];
        if probability_row(q, k, dims, mask, scale, i, row) {
            weighted_sum(row, v, dims, out_row);
        } else {
            out_row.fill(0.0);
        }
    }
}

/// Same result as the materialized path using one `kv_len` scratch row.
pub fn attention_forward_recompute(
    q: &[f32],
    k: &[f32],
    v: &[f32],
    dims: &AttentionDims,
    mask: &AttentionMask<'_>,
    scale: f32,
    row: &mut [f32],
    out: &mut [f32],
) {
    for i in 0..dims.q_len {
        let o = i * dims.out_stride;
        let out_row = &mut out[o..o + dims.head_dim];
        if probability_row(q, k, dims, mask, scale, i, row) {
            weighted_sum(&row[..dims.kv_len], v, dims, out_row);
        } else {
            out_row.fill(0.0);
        }
    }
}

/// Online softmax over blocks of `FLASH_BLOCK` keys.
///
/// Per query row a running maximum `m` and partial sum `l` are kept; when a
/// block raises the maximum, the accumulated output and sum are rescaled by
/// `exp(m_old - m_new)`.
pub fn attention_forward_flash(
    q: &[f32],
    k: &[f32],
    v: &[f32],
    dims: &AttentionDims,
    mask: &AttentionMask<'_>,
    scale: f32,
    block: &mut [f32],
    out: &mut [f32],
) {
    let block_size = block.len().min(FLASH_BLOCK).max(1);
    for i in 0..dims.q_len {
        let qi = dims.q_row(q, i);
        let o = i * dims.out_stride;
        let acc = &mut out[o..o + dims.head_dim];
        acc.fill(0.0);
        let mut m = f32::NEG_INFINITY;
        let mut l = 0.0f32;

        let mut start = 0;
        while start < dims.kv_len {
            let end = (start + block_size).min(dims.kv_len);
            let scores = &mut block[..end - start];
            let mut block_max = f32::NEG_INFINITY;
            for (j, s) in scores.iter_mut().enumerate() {
                let u = start + j;
                *s = if mask.allows(i, u) { dot(qi, dims.kv_row(k, u)) * scale } else { f32::NEG_INFINITY };
                block_max = block_max.max(*s);
            }
            if block_max > f32::NEG_INFINITY {
                let m_new = m.max(block_max);
                let correction = (m - m_new).exp();
                if correction != 1.0 {
                    for a in acc.iter_mut() {
                        *a *= correction;
                    }
                    l *= correction;
                }
                for (j, &s) in scores.iter().enumerate() {
                    if s == f32::NEG_INFINITY {
                        continue;
                    }
                    let p = (s - m_new).exp();
                    l += p;
                    axpy(p, dims.kv_row(v, start + j), acc);
                }
                m = m_new;
            }
            start = end;
        }

        if l > 0.0 {
            let inv = 1.0 / l;
            for a in acc.iter_mut() {
                *a *= inv;
            }
        }
    }
}

/// Single-head attention forward with the chosen strategy.
///
/// `work` must hold at least `strategy.work_len(q_len, kv_len)` floats; for
/// `Materialized` it receives the probabilities needed by `attention_backward`.
#[allow(clippy::too_many_arguments)]
pub fn attention_forward(
    strategy: AttentionStrategy,
    q: &[f32],
    k: &[f32],
    v: &[f32],
    dims: &AttentionDims,
    mask: &AttentionMask<'_>,
    scale: f32,
    work: &mut [f32],
    out: &mut [f32],
) -> KernelResult<()> {
    dims.validate(q.len(), k.len(), v.len(), out.len())?;
    let need = strategy.work_len(dims.q_len, dims.kv_len);
    if work.len() < need {
        return Err(KernelError::ShapeMismatch(format!(
            "{:?} attention needs {} scratch floats, got {}",
            strategy,
            need,
            work.len()
        )));
    }
    if let Some(valid) = mask.key_valid {
        if valid.len() < dims.kv_len {
            return Err(KernelError::ShapeMismatch(format!(
                "key mask has {} entries for {} keys",
                valid.len(),
                dims.kv_len
            )));
        }
    }
    match strategy {
        AttentionStrategy::Materialized => attention_forward_materialized(q, k, v, dims, mask, scale, work, out),
        AttentionStrategy::Recompute => attention_forward_recompute(q, k, v, dims, mask, scale, work, out),
        AttentionStrategy::Flash => attention_forward_flash(q, k, v, dims, mask, scale, &mut work[..need], out),
    }
    Ok(())
}

/// Single-head attention backward.
///
/// Accumulates into `dq`, `dk`, `dv` (strided like `q`, `k`, `v`). When
/// `probs` is `None` the probabilities are recomputed row by row. `scratch`
/// must hold `2 * kv_len` floats.
///
/// With `P = softmax(S)` and `dP_u = dOut · v_u`, the score gradient is
/// `dS_u = P_u (dP_u - Σ_j P_j dP_j)`.
#[allow(clippy::too_many_arguments)]
pub fn attention_backward(
    q: &[f32],
    k: &[f32],
    v: &[f32],
    dims: &AttentionDims,
    mask: &AttentionMask<'_>,
    scale: f32,
    probs: Option<&[f32]>,
    d_out: &[f32],
    dq: &mut [f32],
    dk: &mut [f32],
    dv: &mut [f32],
    scratch: &mut [f32],
) -> KernelResult<()> {
    dims.validate(q.len(), k.len(), v.len(), d_out.len())?;
    let kv = dims.kv_len;
    let hd = dims.head_dim;
    if scratch.len() < 2 * kv {
        return Err(KernelError::ShapeMismatch(format!(
            "attention backward needs {} scratch floats, got {}",
            2 * kv,
            scratch.len()
        )));
    }
    if let Some(p) = probs {
        if p.len() < dims.q_len * kv {
            return Err(KernelError::ShapeMismatch("cached attention probabilities too short".into()));
        }
    }
    let (row_buf, dp) = scratch.split_at_mut(kv);
    let dp = &mut dp[..kv];

    for i in 0..dims.q_len {
        let p: &[f32] = match probs {
            Some(all) => &all[i * kv..(i + 1) * kv],
            None => {
                probability_row(q, k, dims, mask, scale, i, row_buf);
                &row_buf[..kv]
            }
        };
        if p.iter().all(|&x| x == 0.0) {
            continue;
        }
        let o = i * dims.out_stride;
        let g = &d_out[o..o + hd];

        let mut weighted = 0.0f32;
        for u in 0..kv {
            if p[u] == 0.0 {
                dp[u] = 0.0;
                continue;
            }
            dp[u] = dot(g, dims.kv_row(v, u));
            weighted += p[u] * dp[u];
            let vo = u * dims.kv_stride;
            axpy(p[u], g, &mut dv[vo..vo + hd]);
        }

        let qo = i * dims.q_stride;
        for u in 0..kv {
            if p[u] == 0.0 {
                continue;
            }
            let ds = p[u] * (dp[u] - weighted) * scale;
            if ds == 0.0 {
                continue;
            }
            let ko = u * dims.kv_stride;
            axpy(ds, &k[ko..ko + hd], &mut dq[qo..qo + hd]);
            axpy(ds, &q[qo..qo + hd], &mut dk[ko..ko + hd]);
        }
    }
    Ok(())
}

/// Head layout of packed `[T, H * head_dim]` query and `[T, H_kv * head_dim]`
/// key/value buffers. Query head `h` reads key/value head `h / (H / H_kv)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadLayout {
    pub num_heads: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
}

impl HeadLayout {
    pub fn new(num_heads: usize, num_kv_heads: usize, head_dim: usize) -> KernelResult<Self> {
        if num_heads == 0 || num_kv_heads == 0 || head_dim == 0 {
            return Err(KernelError::InvalidArgument("head counts and head_dim must be > 0".into()));
        }
        if num_heads % num_kv_heads != 0 {
            return Err(KernelError::InvalidArgument(format!(
                "num_kv_heads ({}) must divide num_heads ({})",
                num_kv_heads, num_heads
            )));
        }
        Ok(Self { num_heads, num_kv_heads, head_dim })
    }

    pub fn q_width(&self) -> usize {
        self.num_heads * self.head_dim
    }

    pub fn kv_width(&self) -> usize {
        self.num_kv_heads * self.head_dim
    }

    #[inline]
    pub fn kv_head(&self, h: usize) -> usize {
        h / (self.num_heads / self.num_kv_heads)
    }

    fn dims(&self, q_len: usize, kv_len: usize) -> AttentionDims {
        AttentionDims {
            q_len,
            kv_len,
            head_dim: self.head_dim,
            q_stride: self.q_width(),
            kv_stride: self.kv_width(),
            out_stride: self.q_width(),
        }
    }

    /// Scratch `multi_head_forward` needs. Materialized keeps every head's probabilities.
    pub fn work_len(&self, strategy: AttentionStrategy, q_len: usize, kv_len: usize) -> usize {
        match strategy {
            AttentionStrategy::Materialized => self.num_heads * q_len * kv_len,
            other => other.work_len(q_len, kv_len),
        }
    }
}

/// Multi-head (GQA) attention forward over packed rows.
#[allow(clippy::too_many_arguments)]
pub fn multi_head_forward(
    strategy: AttentionStrategy,
    layout: &HeadLayout,
    q_len: usize,
    kv_len: usize,
    q: &[f32],
    k: &[f32],
    v: &[f32],
    mask: &AttentionMask<'_>,
    work: &mut [f32],
    out: &mut [f32],
) -> KernelResult<()> {
    let _t = if log::log_enabled!(log::Level::Trace) { Some(Instant::now()) } else { None };
    let hd = layout.head_dim;
    let dims = layout.dims(q_len, kv_len);
    let scale = default_scale(hd);
    let per_head = strategy.work_len(q_len, kv_len);
    if work.len() < layout.work_len(strategy, q_len, kv_len) {
        return Err(KernelError::ShapeMismatch(format!(
            "multi-head attention scratch {} < {}",
            work.len(),
            layout.work_len(strategy, q_len, kv_len)
        )));
    }
    for h in 0..layout.num_heads {
        let kvh = layout.kv_head(h);
        let head_work = match strategy {
            AttentionStrategy::Materialized => &mut work[h * per_head..(h + 1) * per_head],
            _ => &mut work[..per_head],
        };
        attention_forward(
            strategy,
            &q[h * hd..],
            &k[kvh * hd..],
            &v[kvh * hd..],
            &dims,
            mask,
            scale,
            head_work,
            &mut out[h * hd..],
        )?;
    }
    if let Some(t) = _t {
        log::trace!(
            "[perf] attention::{:?} q_len={} kv_len={} heads={} {:.3}ms",
            strategy,
            q_len,
            kv_len,
            layout.num_heads,
            t.elapsed().as_secs_f64() * 1000.0
        );
    }
    Ok(())
}

/// Multi-head backward. `probs` is the materialized forward work buffer,
/// or `None` to recompute. `scratch` must hold `2 * kv_len` floats.
#[allow(clippy::too_many_arguments)]
pub fn multi_head_backward(
    layout: &HeadLayout,
    q_len: usize,
    kv_len: usize,
    q: &[f32],
    k: &[f32],
    v: &[f32],
    mask: &AttentionMask<'_>,
    probs: Option<&[f32]>,
    d_out: &[f32],
    dq: &mut [f32],
    dk: &mut [f32],
    dv: &mut [f32],
    scratch: &mut [f32],
) -> KernelResult<()> {
    let hd = layout.head_dim;
    let dims = layout.dims(q_len, kv_len);
    let scale = default_scale(hd);
    let per_head = q_len * kv_len;
    for h in 0..layout.num_heads {
        let kvh = layout.kv_head(h);
        let head_probs = probs.map(|p| &p[h * per_head..(h + 1) * per_head]);
        attention_backward(
            &q[h * hd..],
            &k[kvh * hd..],
            &v[kvh * hd..],
            &dims,
            mask,
            scale,
            head_probs,
            &d_out[h * hd..],
            &mut dq[h * hd..],
            &mut dk[kvh * hd..],
            &mut dv[kvh * hd..],
            scratch,
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_key_copies_value() {
        let q = [0.3, -0.2];
        let k = [1.0, 1.0];
        let v = [4.0, 5.0];
        let mut out = [0.0; 2];
        let mut work = [0.0; 1];
        let dims = AttentionDims::contiguous(1, 1, 2);
        attention_forward(
            AttentionStrategy::Materialized,
            &q,
            &k,
            &v,
            &dims,
            &AttentionMask::default(),
            1.0,
            &mut work,
            &mut out,
        )
        .unwrap();
        assert_eq!(out, [4.0, 5.0]);
        assert_eq!(work, [1.0]);
    }

    #[test]
    fn test_fully_masked_row_is_zero() {
        let q = [1.0; 4];
        let k = [1.0; 4];
        let v = [3.0; 4];
        let valid = [false, false];
        let mask = AttentionMask::default().with_key_valid(&valid);
        let dims = AttentionDims::contiguous(2, 2, 2);
        for strategy in [AttentionStrategy::Materialized, AttentionStrategy::Recompute, AttentionStrategy::Flash] {
            let mut out = [7.0; 4];
            let mut work = vec![0.0; strategy.work_len(2, 2)];
            attention_forward(strategy, &q, &k, &v, &dims, &mask, 0.5, &mut work, &mut out).unwrap();
            assert_eq!(out, [0.0; 4], "{:?}", strategy);
        }
    }

    #[test]
    fn test_short_scratch_rejected() {
        let dims = AttentionDims::contiguous(2, 2, 2);
        let mut out = [0.0; 4];
        let err = attention_forward(
            AttentionStrategy::Materialized,
            &[0.0; 4],
            &[0.0; 4],
            &[0.0; 4],
            &dims,
            &AttentionMask::default(),
            1.0,
            &mut [0.0; 3],
            &mut out,
        );
        assert!(matches!(err, Err(KernelError::ShapeMismatch(_))));
    }

    #[test]
    fn test_gqa_layout() {
        let layout = HeadLayout::new(4, 2, 8).unwrap();
        assert_eq!(layout.kv_head(0), 0);
        assert_eq!(layout.kv_head(1), 0);
        assert_eq!(layout.kv_head(3), 1);
        assert!(HeadLayout::new(3, 2, 8).is_err());
    }
}
