//! Next-token selection from raw logits.
//!
//! Every random draw goes through the request-owned `StdRng` inside
//! `Sampler`; there is no thread-local generator.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustml_net::argmax;

use crate::api::types::GenerationConfig;

/// Candidates considered by nucleus sampling.
///
/// `apply_top_p` only looks at the `NUCLEUS_PREFILTER_K` largest logits. When
/// the nucleus would need more tokens than that, the kept set is cut at the
/// prefilter boundary, so this is an approximation of full-vocabulary nucleus
/// sampling rather than an exact implementation.
pub const NUCLEUS_PREFILTER_K: usize = 256;

/// Greedy pick; the first of equal logits wins.
pub fn greedy_token(logits: &[f32]) -> u32 {
    argmax(logits) as u32
}

/// Positive logits of seen tokens are divided by `penalty`, negative ones
/// multiplied.
pub fn apply_repetition_penalty(logits: &mut [f32], past_tokens: &[u32], penalty: f32) {
    for &tok in past_tokens {
        if let Some(v) = logits.get_mut(tok as usize) {
            if *v > 0.0 {
                *v /= penalty;
            } else {
                *v *= penalty;
            }
        }
    }
}

/// Masks everything below the k-th largest logit to `-inf`.
pub fn apply_top_k(logits: &mut [f32], k: usize) {
    if k == 0 || k >= logits.len() {
        return;
    }
    let mut vals = logits.to_vec();
    let pivot = vals.len() - k;
    vals.select_nth_unstable_by(pivot, |a, b| a.total_cmp(b));
    let threshold = vals[pivot];
    for v in logits.iter_mut() {
        if *v < threshold {
            *v = f32::NEG_INFINITY;
        }
    }
}

/// Keeps the smallest prefix of the top `NUCLEUS_PREFILTER_K` candidates whose
/// probability mass (under the full softmax) reaches `p`.
pub fn apply_top_p(logits: &mut [f32], p: f32) {
    if p >= 1.0 || logits.is_empty() {
        return;
    }
    let mut candidates: Vec<usize> = (0..logits.len()).collect();
    let k = NUCLEUS_PREFILTER_K.min(logits.len());
    if k < logits.len() {
        candidates.select_nth_unstable_by(k - 1, |&a, &b| logits[b].total_cmp(&logits[a]));
        candidates.truncate(k);
    }
    candidates.sort_unstable_by(|&a, &b| logits[b].total_cmp(&logits[a]));

    let max_val = logits[candidates[0]];
    if !max_val.is_finite() {
        return;
    }
    let total: f32 = logits.iter().map(|&v| (v - max_val).exp()).sum();
    let mut cumsum = 0.0f32;
    let mut cutoff = candidates.len();
    for (rank, &idx) in candidates.iter().enumerate() {
        cumsum += (logits[idx] - max_val).exp() / total;
        if cumsum >= p {
            cutoff = rank + 1;
            break;
        }
    }
    let threshold = logits[candidates[cutoff - 1]];
    for v in logits.iter_mut() {
        if *v < threshold {
            *v = f32::NEG_INFINITY;
        }
    }
}

/// Draws from the softmax of `logits`. Falls back to `argmax` when the
/// distribution is degenerate.
pub fn sample_categorical<R: Rng>(logits: &[f32], rng: &mut R) -> u32 {
    let max_val = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    if !max_val.is_finite() {
        return greedy_token(logits);
    }
    let sum: f32 = logits.iter().map(|&v| (v - max_val).exp()).sum();
    if !(sum.is_finite() && sum > 0.0) {
        return greedy_token(logits);
    }
    let r: f32 = rng.gen::<f32>() * sum;
    let mut cumsum = 0.0;
    for (i, &v) in logits.iter().enumerate() {
        cumsum += (v - max_val).exp();
        if r < cumsum {
            return i as u32;
        }
    }
    greedy_token(logits)
}

/// Per-request sampling state.
#[derive(Debug, Clone)]
pub struct Sampler {
    temperature: f32,
    top_k: Option<usize>,
    top_p: Option<f32>,
    repetition_penalty: f32,
    rng: StdRng,
    work: Vec<f32>,
}

impl Sampler {
    pub fn new(config: &GenerationConfig) -> Self {
        Self {
            temperature: config.temperature,
            top_k: config.top_k,
            top_p: config.top_p,
            repetition_penalty: config.repetition_penalty,
            rng: StdRng::seed_from_u64(config.seed),
            work: Vec::new(),
        }
    }

    /// Picks the next token. `history` is every token seen so far (prompt and
    /// generated) and only matters when a repetition penalty is set.
    pub fn sample(&mut self, logits: &[f32], history: &[u32]) -> u32 {
        self.work.clear();
        self.work.extend_from_slice(logits);
        if self.repetition_penalty != 1.0 {
            apply_repetition_penalty(&mut self.work, history, self.repetition_penalty);
        }
        if self.temperature <= 0.0 {
            return greedy_token(&self.work);
        }
        let inv_t = 1.0 / self.temperature;
        for v in self.work.iter_mut() {
            *v *= inv_t;
        }
        if let Some(k) = self.top_k {
            apply_top_k(&mut self.work, k);
        }
        if let Some(p) = self.top_p {
            apply_top_p(&mut self.work, p);
        }
        sample_categorical(&self.work, &mut self.rng)
    }
}
