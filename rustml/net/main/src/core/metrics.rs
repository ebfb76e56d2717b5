//! Running epoch metrics: loss, regression sums, a confusion matrix and
//! token-level cross-entropy.

use crate::api::config::LossKind;
use crate::api::types::{ClassificationMetrics, RegressionMetrics};

/// Threshold used to binarize sigmoid outputs and targets.
const BINARY_THRESHOLD: f32 = 0.5;

#[derive(Debug, Clone)]
pub struct MetricsAccumulator {
    loss: LossKind,
    loss_sum: f64,
    samples: usize,
    // regression
    sum_squared_error: f64,
    sum_absolute_error: f64,
    sum_targets: f64,
    sum_targets_squared: f64,
    count: usize,
    // classification: confusion[actual * classes + predicted]
    classes: usize,
    confusion: Vec<u64>,
    // token language model
    token_ce_sum: f64,
    token_correct: usize,
    token_count: usize,
}

impl MetricsAccumulator {
    /// `outputs` is the output width; CE uses it as the class count.
    pub fn new(loss: LossKind, outputs: usize) -> Self {
        let classes = match loss {
            LossKind::MeanSquared => 0,
            LossKind::BinaryCrossEntropy => 2,
            LossKind::CrossEntropy => outputs.max(1),
        };
        Self {
            loss,
            loss_sum: 0.0,
            samples: 0,
            sum_squared_error: 0.0,
            sum_absolute_error: 0.0,
            sum_targets: 0.0,
            sum_targets_squared: 0.0,
            count: 0,
            classes,
            confusion: vec![0; classes * classes],
            token_ce_sum: 0.0,
            token_correct: 0,
            token_count: 0,
        }
    }

    /// Adds the loss of one output row (or one token position).
    pub fn add_loss(&mut self, loss: f64) {
        self.loss_sum += loss;
        self.samples += 1;
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    pub fn mean_loss(&self) -> f64 {
        if self.samples == 0 {
            return 0.0;
        }
        self.loss_sum / self.samples as f64
    }

    /// Records the network output `a` against the expected row `y`.
    pub fn update(&mut self, a: &[f32], y: &[f32]) {
        for (&p, &t) in a.iter().zip(y.iter()) {
            let diff = p as f64 - t as f64;
            self.sum_squared_error += diff * diff;
            self.sum_absolute_error += diff.abs();
            self.sum_targets += t as f64;
            self.sum_targets_squared += (t as f64) * (t as f64);
            self.count += 1;
        }
        match self.loss {
            LossKind::MeanSquared => {}
            LossKind::BinaryCrossEntropy => {
                for (&p, &t) in a.iter().zip(y.iter()) {
                    let actual = (t >= BINARY_THRESHOLD) as usize;
                    let predicted = (p >= BINARY_THRESHOLD) as usize;
                    self.confusion[actual * 2 + predicted] += 1;
                }
            }
            LossKind::CrossEntropy => {
                if a.is_empty() {
                    return;
                }
                let actual = rustml_kernels::argmax(y).min(self.classes - 1);
                let predicted = rustml_kernels::argmax(a).min(self.classes - 1);
                self.confusion[actual * self.classes + predicted] += 1;
            }
        }
    }

    /// Records one next-token prediction.
    pub fn update_token(&mut self, cross_entropy: f64, predicted: usize, target: usize) {
        self.token_ce_sum += cross_entropy;
        self.token_count += 1;
        if predicted == target {
            self.token_correct += 1;
        }
    }

    pub fn regression(&self) -> Option<RegressionMetrics> {
        if self.count == 0 {
            return None;
        }
        let n = self.count as f64;
        let ss_tot = self.sum_targets_squared - self.sum_targets * self.sum_targets / n;
        let r_squared = if ss_tot > 0.0 {
            1.0 - self.sum_squared_error / ss_tot
        } else if self.sum_squared_error == 0.0 {
            1.0
        } else {
            0.0
        };
        Some(RegressionMetrics { mse: self.sum_squared_error / n, mae: self.sum_absolute_error / n, r_squared })
    }

    pub fn classification(&self) -> Option<ClassificationMetrics> {
        let k = self.classes;
        let total: u64 = self.confusion.iter().sum();
        if k == 0 || total == 0 {
            return None;
        }
        let mut correct = 0u64;
        let mut predicted = vec![0u64; k];
        let mut actual = vec![0u64; k];
        for a in 0..k {
            for p in 0..k {
                let c = self.confusion[a * k + p];
                actual[a] += c;
                predicted[p] += c;
                if a == p {
                    correct += c;
                }
            }
        }

        let (mut precision, mut recall, mut f1) = (0.0f64, 0.0f64, 0.0f64);
        let mut present = 0usize;
        for c in 0..k {
            if actual[c] == 0 && predicted[c] == 0 {
                continue;
            }
            present += 1;
            let tp = self.confusion[c * k + c] as f64;
            let p = if predicted[c] > 0 { tp / predicted[c] as f64 } else { 0.0 };
            let r = if actual[c] > 0 { tp / actual[c] as f64 } else { 0.0 };
            precision += p;
            recall += r;
            f1 += if p + r > 0.0 { 2.0 * p * r / (p + r) } else { 0.0 };
        }
        let present = present.max(1) as f64;

        // multiclass MCC: (c·s − Σ p_k t_k) / sqrt((s² − Σ p_k²)(s² − Σ t_k²))
        let s = total as f64;
        let c = correct as f64;
        let pt: f64 = predicted.iter().zip(actual.iter()).map(|(&p, &t)| p as f64 * t as f64).sum();
        let pp: f64 = predicted.iter().map(|&p| (p as f64).powi(2)).sum();
        let tt: f64 = actual.iter().map(|&t| (t as f64).powi(2)).sum();
        let denom = ((s * s - pp) * (s * s - tt)).sqrt();
        let mcc = if denom > 0.0 { (c * s - pt) / denom } else { 0.0 };

        Some(ClassificationMetrics {
            accuracy: c / s,
            precision: precision / present,
            recall: recall / present,
            f1: f1 / present,
            mcc,
        })
    }

    /// Next-token accuracy and perplexity `exp(mean CE)`.
    pub fn token_metrics(&self) -> Option<(f64, f64)> {
        if self.token_count == 0 {
            return None;
        }
        let n = self.token_count as f64;
        Some((self.token_correct as f64 / n, (self.token_ce_sum / n).exp()))
    }

    /// Top-1 accuracy from whichever source recorded predictions.
    pub fn accuracy(&self) -> Option<f64> {
        self.token_metrics().map(|(acc, _)| acc).or_else(|| self.classification().map(|c| c.accuracy))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_regression_perfect_fit() {
        let mut m = MetricsAccumulator::new(LossKind::MeanSquared, 1);
        m.update(&[1.0, 2.0, 3.0], &[1.0, 2.0, 3.0]);
        let r = m.regression().unwrap();
        assert_eq!(r.mse, 0.0);
        assert_eq!(r.r_squared, 1.0);
        assert!(m.classification().is_none());
    }

    #[test]
    fn test_binary_confusion() {
        let mut m = MetricsAccumulator::new(LossKind::BinaryCrossEntropy, 1);
        m.update(&[0.9], &[1.0]);
        m.update(&[0.2], &[0.0]);
        m.update(&[0.7], &[0.0]);
        m.update(&[0.1], &[1.0]);
        let c = m.classification().unwrap();
        assert!((c.accuracy - 0.5).abs() < 1e-12);
        assert!(c.mcc.abs() < 1e-12);
    }

    #[test]
    fn test_multiclass_perfect_mcc() {
        let mut m = MetricsAccumulator::new(LossKind::CrossEntropy, 3);
        for c in 0..3 {
            let mut y = [0.0f32; 3];
            y[c] = 1.0;
            m.update(&y, &y);
        }
        let c = m.classification().unwrap();
        assert!((c.accuracy - 1.0).abs() < 1e-12);
        assert!((c.mcc - 1.0).abs() < 1e-12);
        assert!((c.f1 - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_token_perplexity() {
        let mut m = MetricsAccumulator::new(LossKind::CrossEntropy, 0);
        m.update_token(4f64.ln(), 1, 1);
        m.update_token(4f64.ln(), 0, 2);
        let (acc, ppl) = m.token_metrics().unwrap();
        assert!((acc - 0.5).abs() < 1e-12);
        assert!((ppl - 4.0).abs() < 1e-9);
    }
}
