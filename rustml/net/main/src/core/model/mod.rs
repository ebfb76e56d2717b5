//! Per-architecture parameter layouts, forward passes and hand-written backward passes.

pub mod dff;
pub mod kv;
pub mod recurrent;
pub mod transformer;

use rand::rngs::StdRng;
use rustml_kernels::{bf16_bits_to_f32, f16_bits_to_f32, WeightView};

use crate::api::config::ArchitectureConfig;
use crate::api::error::{NetError, NetResult};
use crate::api::types::IoShape;
use crate::core::params::ParamStore;

use self::dff::DffModel;
use self::recurrent::RecurrentModel;
use self::transformer::TransformerModel;

#[derive(Debug, Clone)]
pub enum ModelKind {
    Dff(DffModel),
    Recurrent(RecurrentModel),
    Transformer(TransformerModel),
}

/// A built network: the parameter arena plus the architecture that indexes it.
#[derive(Debug, Clone)]
pub struct Model {
    pub store: ParamStore,
    pub io: IoShape,
    pub kind: ModelKind,
}

impl Model {
    /// Allocates and initializes every tensor for `io`.
    pub fn build(arch: &ArchitectureConfig, io: IoShape, rng: &mut StdRng) -> NetResult<Self> {
        let mut store = ParamStore::new();
        let kind = match arch {
            ArchitectureConfig::Dff(cfg) => {
                require_dense_io(io)?;
                ModelKind::Dff(DffModel::build(cfg, io, &mut store, rng))
            }
            ArchitectureConfig::Recurrent(cfg) => {
                require_dense_io(io)?;
                ModelKind::Recurrent(RecurrentModel::build(cfg, io, &mut store, rng))
            }
            ArchitectureConfig::Transformer(cfg) => {
                if cfg.token_lm.is_some() {
                    if io.inputs != 1 {
                        return Err(NetError::BuildFailed(format!(
                            "token language model needs one token per row, dataset has {} features",
                            io.inputs
                        )));
                    }
                } else {
                    require_dense_io(io)?;
                }
                ModelKind::Transformer(TransformerModel::build(cfg, io, &mut store, rng)?)
            }
        };
        log::debug!(
            "Built {} network: {} tensors, {} parameters",
            arch.kind_name(),
            store.len(),
            store.total_elements()
        );
        Ok(Self { store, io, kind })
    }

    pub fn transformer(&self) -> Option<&TransformerModel> {
        match &self.kind {
            ModelKind::Transformer(t) => Some(t),
            _ => None,
        }
    }
}

fn require_dense_io(io: IoShape) -> NetResult<()> {
    if io.inputs == 0 || io.outputs == 0 {
        return Err(NetError::BuildFailed(format!(
            "network needs at least one input and one output, got {} / {}",
            io.inputs, io.outputs
        )));
    }
    Ok(())
}

/// Row `row` of a `[_, cols]` matrix, unpacked to f32.
pub(crate) fn copy_row(view: WeightView<'_>, row: usize, cols: usize, out: &mut [f32]) {
    let range = row * cols..(row + 1) * cols;
    match view {
        WeightView::F32(w) => out.copy_from_slice(&w[range]),
        WeightView::F16(w) => {
            for (o, &b) in out.iter_mut().zip(&w[range]) {
                *o = f16_bits_to_f32(b);
            }
        }
        WeightView::BF16(w) => {
            for (o, &b) in out.iter_mut().zip(&w[range]) {
                *o = bf16_bits_to_f32(b);
            }
        }
    }
}

/// Grows `buf` to at least `len` without shrinking capacity.
#[inline]
pub(crate) fn ensure_len(buf: &mut Vec<f32>, len: usize) {
    if buf.len() < len {
        buf.resize(len, 0.0);
    }
}

/// `dst[i] += src[i]`
#[inline]
pub(crate) fn add_into(dst: &mut [f32], src: &[f32]) {
    for (d, &s) in dst.iter_mut().zip(src) {
        *d += s;
    }
}

/// Column sums of `rows` rows into `db` (bias gradient).
#[inline]
pub(crate) fn add_rows(db: &mut [f32], d: &[f32], rows: usize) {
    let w = db.len();
    for r in 0..rows {
        add_into(db, &d[r * w..(r + 1) * w]);
    }
}
