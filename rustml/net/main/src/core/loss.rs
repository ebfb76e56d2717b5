//! Output losses and their gradients with respect to the pre-activation outputs.

use rustml_kernels::{log_sum_exp, softmax_in_place, Activation};

use crate::api::config::LossKind;

/// Lower bound applied to probabilities inside logarithms.
const PROB_FLOOR: f64 = 1e-12;

/// Loss of one output row and `dz = ∂loss/∂z`.
///
/// `z` is the pre-activation output, `a = act(z)` the network output and `y`
/// the expected row. BCE assumes a sigmoid output and CE an identity output
/// (both fused with their activation); MSE differentiates through `act`.
pub fn output_loss(kind: LossKind, act: Activation, z: &[f32], a: &[f32], y: &[f32], dz: &mut [f32]) -> f64 {
    let n = a.len().max(1) as f32;
    match kind {
        LossKind::MeanSquared => {
            let mut loss = 0.0f64;
            for i in 0..a.len() {
                let diff = a[i] - y[i];
                loss += (diff as f64) * (diff as f64);
                dz[i] = 2.0 * diff / n * act.derivative(z[i], a[i]);
            }
            loss / n as f64
        }
        LossKind::BinaryCrossEntropy => {
            let mut loss = 0.0f64;
            for i in 0..a.len() {
                let p = (a[i] as f64).clamp(PROB_FLOOR, 1.0 - PROB_FLOOR);
                let t = y[i] as f64;
                loss -= t * p.ln() + (1.0 - t) * (1.0 - p).ln();
                dz[i] = (a[i] - y[i]) / n;
            }
            loss / n as f64
        }
        LossKind::CrossEntropy => {
            let lse = log_sum_exp(z) as f64;
            let mut loss = 0.0f64;
            let mut mass = 0.0f32;
            for i in 0..z.len() {
                if y[i] != 0.0 {
                    loss -= y[i] as f64 * (z[i] as f64 - lse);
                }
                mass += y[i];
            }
            dz.copy_from_slice(z);
            softmax_in_place(dz);
            // soft targets: dz = p·Σy - y
            for i in 0..dz.len() {
                dz[i] = dz[i] * mass - y[i];
            }
            loss
        }
    }
}

/// Full-vocabulary cross-entropy of one position. Writes `p - onehot(target)`
/// into `dlogits` and returns `(loss, predicted token)`.
pub fn token_cross_entropy(logits: &[f32], target: usize, dlogits: &mut [f32]) -> (f64, usize) {
    let lse = log_sum_exp(logits);
    let loss = (lse - logits[target]) as f64;
    dlogits.copy_from_slice(logits);
    softmax_in_place(dlogits);
    let pred = rustml_kernels::argmax(dlogits);
    dlogits[target] -= 1.0;
    (loss, pred)
}

/// Cross-entropy over a candidate set whose first entry is the true token.
/// Writes the candidate-logit gradient into `dlogits`.
pub fn sampled_cross_entropy(logits: &[f32], dlogits: &mut [f32]) -> f64 {
    let lse = log_sum_exp(logits);
    let loss = (lse - logits[0]) as f64;
    dlogits.copy_from_slice(logits);
    softmax_in_place(dlogits);
    dlogits[0] -= 1.0;
    loss
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numeric(kind: LossKind, act: Activation, z: &[f32], y: &[f32], i: usize) -> f64 {
        let eps = 1e-3f32;
        let eval = |shift: f32| {
            let mut zz = z.to_vec();
            zz[i] += shift;
            let mut a = vec![0.0; z.len()];
            act.forward(&zz, &mut a);
            let mut dz = vec![0.0; z.len()];
            output_loss(kind, act, &zz, &a, y, &mut dz)
        };
        (eval(eps) - eval(-eps)) / (2.0 * eps as f64)
    }

    #[test]
    fn test_gradients_match_numeric() {
        let z = [0.3f32, -1.2, 0.8];
        let cases = [
            (LossKind::MeanSquared, Activation::Tanh, [0.5f32, -0.5, 0.0]),
            (LossKind::BinaryCrossEntropy, Activation::Sigmoid, [1.0, 0.0, 1.0]),
            (LossKind::CrossEntropy, Activation::Identity, [0.0, 1.0, 0.0]),
        ];
        for (kind, act, y) in cases {
            let mut a = [0.0f32; 3];
            act.forward(&z, &mut a);
            let mut dz = [0.0f32; 3];
            output_loss(kind, act, &z, &a, &y, &mut dz);
            for i in 0..3 {
                let num = numeric(kind, act, &z, &y, i);
                assert!((dz[i] as f64 - num).abs() < 2e-3, "{:?} [{}]: {} vs {}", kind, i, dz[i], num);
            }
        }
    }

    #[test]
    fn test_token_cross_entropy_uniform() {
        let logits = [0.0f32; 4];
        let mut d = [0.0f32; 4];
        let (loss, _) = token_cross_entropy(&logits, 2, &mut d);
        assert!((loss - 4f64.ln()).abs() < 1e-6);
        assert!((d[2] + 0.75).abs() < 1e-6);
        assert!((d.iter().sum::<f32>()).abs() < 1e-6);
    }
}
