//! LayerNorm and RMSNorm with per-row statistics for an O(D) backward.
//!
//! Both norms apply a learned scale and shift: `y = x̂ * scale + shift`, where
//! `x̂ = (x - mean) * rstd` for LayerNorm and `x̂ = x * rstd` (rstd = 1/rms)
//! for RMSNorm.

use crate::api::types::NormKind;

/// Per-row statistics cached by the forward pass.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NormStats {
    /// Row mean (always 0 for RMSNorm).
    pub mean: f32,
    /// Inverse standard deviation (LayerNorm) or inverse RMS (RMSNorm).
    pub rstd: f32,
}

pub fn layer_norm_forward(x: &[f32], scale: &[f32], shift: &[f32], eps: f32, y: &mut [f32]) -> NormStats {
    let d = x.len();
    let mean = x.iter().map(|&v| v as f64).sum::<f64>() / d as f64;
    let var = x
        .iter()
        .map(|&v| {
            let c = v as f64 - mean;
            c * c
        })
        .sum::<f64>()
        / d as f64;
    let rstd = 1.0 / (var + eps as f64).sqrt();
    let (mean, rstd) = (mean as f32, rstd as f32);
    for i in 0..d {
        y[i] = (x[i] - mean) * rstd * scale[i] + shift[i];
    }
    NormStats { mean, rstd }
}

/// Backward of `layer_norm_forward`.
///
/// Writes `dx`; accumulates into `dscale` and `dshift`.
pub fn layer_norm_backward(
    x: &[f32],
    scale: &[f32],
    stats: NormStats,
    dy: &[f32],
    dx: &mut [f32],
    dscale: &mut [f32],
    dshift: &mut [f32],
) {
    let d = x.len();
    let mut mean_g = 0.0f32;
    let mut mean_gx = 0.0f32;
    for i in 0..d {
        let xhat = (x[i] - stats.mean) * stats.rstd;
        let g = dy[i] * scale[i];
        mean_g += g;
        mean_gx += g * xhat;
        dscale[i] += dy[i] * xhat;
        dshift[i] += dy[i];
    }
    mean_g /= d as f32;
    mean_gx /= d as f32;
    for i in 0..d {
        let xhat = (x[i] - stats.mean) * stats.rstd;
        let g = dy[i] * scale[i];
        dx[i] = stats.rstd * (g - mean_g - xhat * mean_gx);
    }
}

pub fn rms_norm_forward(x: &[f32], scale: &[f32], shift: &[f32], eps: f32, y: &mut [f32]) -> NormStats {
    let d = x.len();
    let ms = x.iter().map(|&v| (v as f64) * (v as f64)).sum::<f64>() / d as f64;
    let rstd = (1.0 / (ms + eps as f64).sqrt()) as f32;
    for i in 0..d {
        y[i] = x[i] * rstd * scale[i] + shift[i];
    }
    NormStats { mean: 0.0, rstd }
}

/// Backward of `rms_norm_forward`.
///
/// Writes `dx`; accumulates into `dscale` and `dshift`.
pub fn rms_norm_backward(
    x: &[f32],
    scale: &[f32],
    stats: NormStats,
    dy: &[f32],
    dx: &mut [f32],
    dscale: &mut [f32],
    dshift: &mut [f32],
) {
    let d = x.len();
    let mut mean_gx = 0.0f32;
    for i in 0..d {
        let xhat = x[i] * stats.rstd;
        let g = dy[i] * scale[i];
        mean_gx += g * xhat;
        dscale[i] += dy[i] * xhat;
        dshift[i] += dy[i];
    }
    mean_gx /= d as f32;
    for i in 0..d {
        let xhat = x[i] * stats.rstd;
        let g = dy[i] * scale[i];
        dx[i] = stats.rstd * (g - xhat * mean_gx);
    }
}

/// Normalize `rows` rows of width `dim`, recording one `NormStats` per row.
#[allow(clippy::too_many_arguments)]
pub fn norm_rows_forward(
    kind: NormKind,
    x: &[f32],
    rows: usize,
    dim: usize,
    scale: &[f32],
    shift: &[f32],
    eps: f32,
    y: &mut [f32],
    stats: &mut [NormStats],
) {
    for r in 0..rows {
        let range = r * dim..(r + 1) * dim;
        stats[r] = match kind {
            NormKind::LayerNorm => layer_norm_forward(&x[range.clone()], scale, shift, eps, &mut y[range]),
            NormKind::RmsNorm => rms_norm_forward(&x[range.clone()], scale, shift, eps, &mut y[range]),
        };
    }
}

/// Row-wise backward for `norm_rows_forward`. Writes `dx`, accumulates `dscale`/`dshift`.
#[allow(clippy::too_many_arguments)]
pub fn norm_rows_backward(
    kind: NormKind,
    x: &[f32],
    rows: usize,
    dim: usize,
    scale: &[f32],
    stats: &[NormStats],
    dy: &[f32],
    dx: &mut [f32],
    dscale: &mut [f32],
    dshift: &mut [f32],
) {
    for r in 0..rows {
        let range = r * dim..(r + 1) * dim;
        match kind {
            NormKind::LayerNorm => layer_norm_backward(
                &x[range.clone()],
                scale,
                stats[r],
                &dy[range.clone()],
                &mut dx[range],
                dscale,
                dshift,
            ),
            NormKind::RmsNorm => rms_norm_backward(
                &x[range.clone()],
                scale,
                stats[r],
                &dy[range.clone()],
                &mut dx[range],
                dscale,
                dshift,
            ),
        }
    }
}
