//! Numerically stable softmax variants.
//!
//! Every variant subtracts the row maximum before exponentiating. A row with
//! no finite candidate (empty, all `-inf`, or fully masked) becomes all zeros,
//! never a uniform distribution.

/// In-place softmax. Returns `false` (and zeroes the row) when no entry is finite.
pub fn softmax_in_place(x: &mut [f32]) -> bool {
    let max = x.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    if max == f32::NEG_INFINITY || max.is_nan() {
        x.fill(0.0);
        return false;
    }
    let mut sum = 0.0f32;
    for v in x.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    let inv = 1.0 / sum;
    for v in x.iter_mut() {
        *v *= inv;
    }
    true
}

/// Softmax over the entries for which `allowed(i)` holds; the rest become 0.
///
/// Returns `false` when nothing is allowed, leaving the row all zeros.
pub fn masked_softmax_in_place<F: Fn(usize) -> bool>(x: &mut [f32], allowed: F) -> bool {
    for (i, v) in x.iter_mut().enumerate() {
        if !allowed(i) {
            *v = f32::NEG_INFINITY;
        }
    }
    softmax_in_place(x)
}

/// `log(Σ exp(x))`, stable. Returns `-inf` for an empty or all `-inf` row.
pub fn log_sum_exp(x: &[f32]) -> f32 {
    let max = x.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    if max == f32::NEG_INFINITY {
        return f32::NEG_INFINITY;
    }
    let sum: f32 = x.iter().map(|&v| (v - max).exp()).sum();
    max + sum.ln()
}

/// In-place log-softmax.
pub fn log_softmax_in_place(x: &mut [f32]) {
    let lse = log_sum_exp(x);
    for v in x.iter_mut() {
        *v -= lse;
    }
}

/// Index of the largest element (first one on ties).
pub fn argmax(x: &[f32]) -> usize {
    let mut best = 0usize;
    let mut max_val = f32::NEG_INFINITY;
    for (i, &v) in x.iter().enumerate() {
        if v > max_val {
            max_val = v;
            best = i;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_softmax_sums_to_one() {
        let mut x = vec![1000.0, 1001.0, 999.0, -5.0];
        assert!(softmax_in_place(&mut x));
        let sum: f32 = x.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert!(x.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_fully_masked_row_is_zero() {
        let mut x = vec![0.5, 0.1, 0.9];
        assert!(!masked_softmax_in_place(&mut x, |_| false));
        assert_eq!(x, vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_partially_masked_row() {
        let mut x = vec![2.0, 2.0, 100.0];
        assert!(masked_softmax_in_place(&mut x, |i| i < 2));
        assert!((x[0] - 0.5).abs() < 1e-6);
        assert!((x[1] - 0.5).abs() < 1e-6);
        assert_eq!(x[2], 0.0);
    }

    #[test]
    fn test_log_sum_exp() {
        let x = [0.0f32, 0.0];
        assert!((log_sum_exp(&x) - 2.0f32.ln()).abs() < 1e-6);
        assert_eq!(log_sum_exp(&[]), f32::NEG_INFINITY);
    }
}
