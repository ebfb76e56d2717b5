//! # RustML Kernels
//!
//! Hand-written CPU kernels behind the rustml training and serving engine.
//!
//! Every kernel is a function over raw `f32` (or packed f16/bf16) slices with
//! explicit shapes. Call sites own their buffers; nothing here allocates on a
//! per-call basis except table construction (`RopeTable`, `SinusoidalTable`).
//!
//! - GEMV / row-batched matmul with AVX2+FMA, NEON and scalar paths
//! - LayerNorm and RMSNorm forward/backward
//! - Rotary and sinusoidal position encodings
//! - Stable softmax variants
//! - Scaled-dot-product attention (materialized, recompute, flash) and backward
//! - FP16/BF16 packing
//!
//! ## Example
//!
//! ```rust
//! use rustml_kernels::{gemv, WeightView};
//!
//! let w = [1.0f32, 2.0, 3.0, 4.0];
//! let mut y = [0.0f32; 2];
//! gemv(WeightView::F32(&w), 2, 2, &[1.0, 1.0], None, &mut y);
//! assert_eq!(y, [3.0, 7.0]);
//! ```

pub mod api;
mod core;
mod saf;

pub use saf::*;
