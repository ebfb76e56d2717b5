//! Bounded finite-value checks for hot buffers.

/// Samples checked per buffer unless configured otherwise.
pub const DEFAULT_FINITE_SAMPLES: usize = 64;

/// Index of the first non-finite value among at most `max_samples` evenly
/// spaced positions of `buf` (always including the first and last element).
///
/// Buffers no longer than `max_samples` are scanned completely. Sampling is
/// deterministic, so repeated checks of the same buffer agree.
pub fn first_non_finite_sampled(buf: &[f32], max_samples: usize) -> Option<usize> {
    let n = buf.len();
    if n == 0 {
        return None;
    }
    if max_samples == 0 || n <= max_samples {
        return buf.iter().position(|v| !v.is_finite());
    }
    if max_samples == 1 {
        return (!buf[0].is_finite()).then_some(0);
    }
    (0..max_samples)
        .map(|s| s * (n - 1) / (max_samples - 1))
        .find(|&i| !buf[i].is_finite())
}

/// Full scan.
pub fn all_finite(buf: &[f32]) -> bool {
    buf.iter().all(|v| v.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_buffer_scanned_fully() {
        let mut buf = vec![0.0f32; 10];
        buf[7] = f32::NAN;
        assert_eq!(first_non_finite_sampled(&buf, 64), Some(7));
    }

    #[test]
    fn test_sampling_hits_endpoints() {
        let mut buf = vec![1.0f32; 10_000];
        assert_eq!(first_non_finite_sampled(&buf, 8), None);
        buf[9_999] = f32::INFINITY;
        assert_eq!(first_non_finite_sampled(&buf, 8), Some(9_999));
    }

    #[test]
    fn test_empty() {
        assert_eq!(first_non_finite_sampled(&[], 4), None);
        assert!(all_finite(&[]));
    }
}
