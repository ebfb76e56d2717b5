//! Packed parameter arena.
//!
//! Every trainable tensor of a network lives in one `ParamStore`, addressed by
//! `ParamId`. Architecture structs only hold ids, so the optimizer, clipping,
//! persistence and the legacy graph export all walk the same flat list.
//! Gradients are kept in a parallel `Gradients` arena so a backward pass can
//! read weights and write gradients at the same time.

use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::{Distribution, Normal};
use rustml_kernels::{first_non_finite_sampled, pack, PackedDType, WeightView};
use smallvec::SmallVec;

use crate::api::error::{NetError, NetResult};

pub type Shape = SmallVec<[usize; 4]>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParamId(usize);

impl ParamId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// How a tensor is initialized.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Init {
    Zeros,
    Constant(f32),
    /// Uniform in `±sqrt(6 / (fan_in + fan_out))` for a `[fan_out, fan_in]` matrix.
    Xavier,
    Normal { std: f32 },
}

#[derive(Debug, Clone)]
pub struct ParamTensor {
    pub name: String,
    pub shape: Shape,
    pub value: Vec<f32>,
    /// First moment (AdamW) or velocity (SGD momentum).
    pub m: Vec<f32>,
    /// Second moment (AdamW).
    pub v: Vec<f32>,
    /// Low-precision copy read by forward/backward under mixed precision.
    pub shadow: Option<Vec<u16>>,
    /// Decoupled weight decay applies (matrices, not biases or norm params).
    pub decay: bool,
}

impl ParamTensor {
    pub fn numel(&self) -> usize {
        self.value.len()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ParamStore {
    tensors: Vec<ParamTensor>,
    shadow_dtype: Option<PackedDType>,
}

impl ParamStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a tensor and initializes it from `rng`.
    pub fn add(&mut self, name: impl Into<String>, shape: &[usize], init: Init, decay: bool, rng: &mut StdRng) -> ParamId {
        let numel: usize = shape.iter().product();
        let mut value = vec![0.0f32; numel];
        match init {
            Init::Zeros => {}
            Init::Constant(c) => value.fill(c),
            Init::Xavier => {
                let fan_out = shape.first().copied().unwrap_or(1);
                let fan_in = shape.get(1).copied().unwrap_or(1);
                let limit = (6.0 / (fan_in + fan_out) as f32).sqrt();
                for v in value.iter_mut() {
                    *v = rng.gen_range(-limit..limit);
                }
            }
            Init::Normal { std } => {
                // std > 0 is a construction-time constant
                if let Ok(dist) = Normal::new(0.0f32, std) {
                    for v in value.iter_mut() {
                        *v = dist.sample(rng);
                    }
                }
            }
        }
        let id = ParamId(self.tensors.len());
        self.tensors.push(ParamTensor {
            name: name.into(),
            shape: SmallVec::from_slice(shape),
            m: vec![0.0; numel],
            v: vec![0.0; numel],
            value,
            shadow: None,
            decay,
        });
        id
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn get(&self, id: ParamId) -> &ParamTensor {
        &self.tensors[id.0]
    }

    pub fn get_mut(&mut self, id: ParamId) -> &mut ParamTensor {
        &mut self.tensors[id.0]
    }

    pub fn value(&self, id: ParamId) -> &[f32] {
        &self.tensors[id.0].value
    }

    pub fn value_mut(&mut self, id: ParamId) -> &mut [f32] {
        &mut self.tensors[id.0].value
    }

    /// Weights as read by forward and backward: the packed shadow when mixed
    /// precision is on, the f32 master copy otherwise.
    pub fn weight(&self, id: ParamId) -> WeightView<'_> {
        let t = &self.tensors[id.0];
        match (&t.shadow, self.shadow_dtype) {
            (Some(bits), Some(PackedDType::F16)) => WeightView::F16(bits),
            (Some(bits), Some(PackedDType::BF16)) => WeightView::BF16(bits),
            _ => WeightView::F32(&t.value),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ParamId, &ParamTensor)> {
        self.tensors.iter().enumerate().map(|(i, t)| (ParamId(i), t))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ParamTensor> {
        self.tensors.iter_mut()
    }

    pub fn find(&self, name: &str) -> Option<ParamId> {
        self.tensors.iter().position(|t| t.name == name).map(ParamId)
    }

    pub fn total_elements(&self) -> usize {
        self.tensors.iter().map(|t| t.numel()).sum()
    }

    pub fn shadow_dtype(&self) -> Option<PackedDType> {
        self.shadow_dtype
    }

    /// Turns shadow weights on (packing every matrix) or off.
    pub fn set_shadow_dtype(&mut self, dtype: Option<PackedDType>) {
        self.shadow_dtype = dtype;
        if dtype.is_none() {
            for t in self.tensors.iter_mut() {
                t.shadow = None;
            }
        }
        self.refresh_shadows();
    }

    /// Re-packs shadow copies of every matrix after an optimizer update.
    pub fn refresh_shadows(&mut self) {
        let Some(dtype) = self.shadow_dtype else { return };
        for t in self.tensors.iter_mut().filter(|t| t.shape.len() == 2) {
            let bits = t.shadow.get_or_insert_with(|| vec![0u16; t.value.len()]);
            pack(dtype, &t.value, bits);
        }
    }

    pub fn reset_optimizer_state(&mut self) {
        for t in self.tensors.iter_mut() {
            t.m.fill(0.0);
            t.v.fill(0.0);
        }
    }
}

/// Gradient accumulators parallel to a `ParamStore`.
#[derive(Debug, Clone, Default)]
pub struct Gradients {
    bufs: Vec<Vec<f32>>,
}

impl Gradients {
    pub fn for_store(store: &ParamStore) -> Self {
        Self { bufs: store.tensors.iter().map(|t| vec![0.0; t.numel()]).collect() }
    }

    /// Resizes to match `store`, reusing existing allocations.
    pub fn match_store(&mut self, store: &ParamStore) {
        self.bufs.resize_with(store.len(), Vec::new);
        for (buf, t) in self.bufs.iter_mut().zip(store.tensors.iter()) {
            buf.resize(t.numel(), 0.0);
        }
    }

    pub fn get(&self, id: ParamId) -> &[f32] {
        &self.bufs[id.0]
    }

    pub fn get_mut(&mut self, id: ParamId) -> &mut [f32] {
        &mut self.bufs[id.0]
    }

    /// Two distinct gradient buffers at once.
    pub fn pair_mut(&mut self, a: ParamId, b: ParamId) -> (&mut [f32], &mut [f32]) {
        assert_ne!(a, b, "pair_mut needs distinct ids");
        if a.0 < b.0 {
            let (lo, hi) = self.bufs.split_at_mut(b.0);
            (&mut lo[a.0], &mut hi[0])
        } else {
            let (lo, hi) = self.bufs.split_at_mut(a.0);
            (&mut hi[0], &mut lo[b.0])
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &[f32]> {
        self.bufs.iter().map(|b| b.as_slice())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Vec<f32>> {
        self.bufs.iter_mut()
    }

    pub fn zero(&mut self) {
        for b in self.bufs.iter_mut() {
            b.fill(0.0);
        }
    }

    pub fn scale(&mut self, factor: f32) {
        for b in self.bufs.iter_mut() {
            for g in b.iter_mut() {
                *g *= factor;
            }
        }
    }

    /// Global L2 norm, accumulated in f64.
    pub fn global_norm(&self) -> f32 {
        let sq: f64 = self.bufs.iter().flat_map(|b| b.iter()).map(|&g| (g as f64) * (g as f64)).sum();
        sq.sqrt() as f32
    }

    /// Full scan used for loss-scale overflow detection.
    pub fn all_finite(&self) -> bool {
        self.bufs.iter().all(|b| b.iter().all(|g| g.is_finite()))
    }

    /// Bounded check over every buffer; names the offending tensor.
    pub fn check_finite(&self, store: &ParamStore, max_samples: usize) -> NetResult<()> {
        for (buf, t) in self.bufs.iter().zip(store.tensors.iter()) {
            if let Some(index) = first_non_finite_sampled(buf, max_samples) {
                return Err(NetError::NonFinite { what: format!("gradient of {}", t.name), index });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_xavier_bounds_and_lookup() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut store = ParamStore::new();
        let w = store.add("w", &[8, 4], Init::Xavier, true, &mut rng);
        let b = store.add("b", &[8], Init::Zeros, false, &mut rng);
        let limit = (6.0f32 / 12.0).sqrt();
        assert!(store.value(w).iter().all(|v| v.abs() <= limit));
        assert!(store.value(b).iter().all(|&v| v == 0.0));
        assert_eq!(store.find("b"), Some(b));
        assert_eq!(store.total_elements(), 40);
    }

    #[test]
    fn test_shadow_only_for_matrices() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut store = ParamStore::new();
        let w = store.add("w", &[2, 2], Init::Constant(1.5), true, &mut rng);
        let b = store.add("b", &[2], Init::Constant(0.5), false, &mut rng);
        store.set_shadow_dtype(Some(PackedDType::BF16));
        assert!(matches!(store.weight(w), WeightView::BF16(_)));
        assert!(matches!(store.weight(b), WeightView::F32(_)));
        store.set_shadow_dtype(None);
        assert!(matches!(store.weight(w), WeightView::F32(_)));
    }

    #[test]
    fn test_gradient_norm_and_pair() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut store = ParamStore::new();
        let a = store.add("a", &[2], Init::Zeros, false, &mut rng);
        let b = store.add("b", &[1], Init::Zeros, false, &mut rng);
        let mut grads = Gradients::for_store(&store);
        {
            let (g_b, g_a) = grads.pair_mut(b, a);
            g_a.copy_from_slice(&[3.0, 0.0]);
            g_b[0] = 4.0;
        }
        assert!((grads.global_norm() - 5.0).abs() < 1e-6);
    }
}
