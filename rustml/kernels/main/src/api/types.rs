//! Shared kernel types

use serde::{Deserialize, Serialize};

/// Normalization applied before each attention and feed-forward block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormKind {
    #[default]
    LayerNorm,
    RmsNorm,
}

/// Element-wise activation function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    Identity,
    Sigmoid,
    #[default]
    Tanh,
    Relu,
    Gelu,
    Silu,
}

/// Low-precision storage format for shadow weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackedDType {
    F16,
    BF16,
}

/// How scaled-dot-product attention computes its probabilities.
///
/// All three strategies produce the same result within floating-point
/// tolerance; they differ in how much scratch memory they need.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttentionStrategy {
    /// Keep the full `[q_len, kv_len]` probability matrix.
    #[default]
    Materialized,
    /// Recompute one probability row at a time.
    Recompute,
    /// Online softmax over blocks of keys (running max and partial sum).
    Flash,
}

/// Borrowed row-major weight matrix in one of the supported storage formats.
#[derive(Debug, Clone, Copy)]
pub enum WeightView<'a> {
    F32(&'a [f32]),
    /// IEEE binary16 bit patterns.
    F16(&'a [u16]),
    /// bfloat16 bit patterns.
    BF16(&'a [u16]),
}

impl WeightView<'_> {
    /// Number of stored elements.
    pub fn len(&self) -> usize {
        match self {
            WeightView::F32(w) => w.len(),
            WeightView::F16(w) | WeightView::BF16(w) => w.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
