//! Optimizer updates, gradient clipping and dynamic loss scaling over the
//! packed parameter arena.

use crate::api::config::{GradClip, MixedPrecisionConfig, OptimizerKind};
use crate::core::params::{Gradients, ParamStore};

/// Optimizer kind plus the global step counter (AdamW bias correction).
#[derive(Debug, Clone)]
pub struct Optimizer {
    kind: OptimizerKind,
    step: u64,
}

impl Optimizer {
    pub fn new(kind: OptimizerKind) -> Self {
        Self { kind, step: 0 }
    }

    pub fn step_count(&self) -> u64 {
        self.step
    }

    pub fn set_step_count(&mut self, step: u64) {
        self.step = step;
    }

    pub fn set_kind(&mut self, kind: OptimizerKind) {
        self.kind = kind;
    }

    /// One update of every tensor with its accumulated gradient.
    pub fn apply(&mut self, store: &mut ParamStore, grads: &Gradients, lr: f32) {
        self.step += 1;
        match self.kind {
            OptimizerKind::Sgd { momentum } => {
                for (t, g) in store.iter_mut().zip(grads.iter()) {
                    // v = μv + lr·g; w -= v
                    for ((w, v), &gi) in t.value.iter_mut().zip(t.m.iter_mut()).zip(g.iter()) {
                        *v = momentum * *v + lr * gi;
                        *w -= *v;
                    }
                }
            }
            OptimizerKind::AdamW { beta1, beta2, eps, weight_decay } => {
                let t_step = self.step.min(i32::MAX as u64) as i32;
                let bc1 = 1.0 - beta1.powi(t_step);
                let bc2 = 1.0 - beta2.powi(t_step);
                for (t, g) in store.iter_mut().zip(grads.iter()) {
                    let decay = if t.decay { lr * weight_decay } else { 0.0 };
                    for i in 0..t.value.len() {
                        let gi = g[i];
                        t.m[i] = beta1 * t.m[i] + (1.0 - beta1) * gi;
                        t.v[i] = beta2 * t.v[i] + (1.0 - beta2) * gi * gi;
                        let m_hat = t.m[i] / bc1;
                        let v_hat = t.v[i] / bc2;
                        // decoupled weight decay before the adaptive step
                        t.value[i] -= decay * t.value[i];
                        t.value[i] -= lr * m_hat / (v_hat.sqrt() + eps);
                    }
                }
            }
        }
    }
}

/// Scales every gradient by `min(1, max_norm / ‖g‖)`. Returns the norm before clipping.
pub fn clip_global_norm(grads: &mut Gradients, max_norm: f32) -> f32 {
    let norm = grads.global_norm();
    if norm > max_norm && norm > 0.0 {
        grads.scale(max_norm / norm);
    }
    norm
}

/// Clamps every gradient element to `[-max_value, max_value]`.
pub fn clip_value(grads: &mut Gradients, max_value: f32) {
    let c = max_value.abs();
    for buf in grads.iter_mut() {
        for g in buf.iter_mut() {
            *g = g.clamp(-c, c);
        }
    }
}

/// Applies `clip`: global-norm scaling first, then the element clamp.
/// Returns the norm before scaling when a norm bound is set.
pub fn clip_gradients(grads: &mut Gradients, clip: &GradClip) -> Option<f32> {
    let norm = clip.max_norm.map(|max_norm| clip_global_norm(grads, max_norm));
    if let Some(max_value) = clip.max_value {
        clip_value(grads, max_value);
    }
    norm
}

/// Dynamic loss scale for low-precision training.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossScaler {
    scale: f32,
    good_steps: usize,
    cfg: MixedPrecisionConfig,
}

impl LossScaler {
    pub fn new(cfg: MixedPrecisionConfig) -> Self {
        Self { scale: cfg.initial_scale, good_steps: 0, cfg }
    }

    pub fn enabled(&self) -> bool {
        self.cfg.mode.is_some()
    }

    /// Factor the loss gradient is multiplied by before backward (1 when disabled).
    pub fn scale(&self) -> f32 {
        if self.enabled() {
            self.scale
        } else {
            1.0
        }
    }

    pub fn good_steps(&self) -> usize {
        self.good_steps
    }

    pub fn restore(&mut self, scale: f32, good_steps: usize) {
        self.scale = scale;
        self.good_steps = good_steps;
    }

    /// Records the outcome of one boundary. Overflow halves (backs off) the
    /// scale and resets the streak; `growth_interval` good steps in a row grow it.
    pub fn update(&mut self, overflow: bool) {
        if !self.enabled() {
            return;
        }
        if overflow {
            let old = self.scale;
            self.scale = (self.scale * self.cfg.backoff_factor).max(f32::MIN_POSITIVE);
            self.good_steps = 0;
            log::warn!("Gradient overflow: skipping step, loss scale {} -> {}", old, self.scale);
        } else {
            self.good_steps += 1;
            if self.good_steps >= self.cfg.growth_interval {
                let grown = self.scale * self.cfg.growth_factor;
                if grown.is_finite() {
                    log::debug!("Loss scale {} -> {}", self.scale, grown);
                    self.scale = grown;
                }
                self.good_steps = 0;
            }
        }
    }
}
