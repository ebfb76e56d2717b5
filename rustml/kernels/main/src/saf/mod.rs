//! Facade re-exports for rustml-kernels

pub use crate::api::error::*;
pub use crate::api::types::*;
pub use crate::core::activation::sigmoid;
pub use crate::core::attention::{
    attention_backward, attention_forward, attention_forward_flash, attention_forward_materialized,
    attention_forward_recompute, default_scale, multi_head_backward, multi_head_forward, AttentionDims,
    AttentionMask, HeadLayout, FLASH_BLOCK,
};
pub use crate::core::finite::{all_finite, first_non_finite_sampled, DEFAULT_FINITE_SAMPLES};
pub use crate::core::gemv::{
    axpy, dot, gemv, gemv_bf16, gemv_f16, gemv_ref, gemv_transposed_acc, matmul_rows,
    matmul_rows_transposed_acc, outer_acc, outer_acc_rows, GEMV_TOLERANCE,
};
pub use crate::core::norm::{
    layer_norm_backward, layer_norm_forward, norm_rows_backward, norm_rows_forward, rms_norm_backward,
    rms_norm_forward, NormStats,
};
pub use crate::core::precision::{bf16_bits_to_f32, f16_bits_to_f32, f32_to_bf16_bits, f32_to_f16_bits, pack, unpack};
pub use crate::core::rope::{sinusoidal_encoding, RopeTable, SinusoidalTable};
pub use crate::core::runtime::KernelConfig;
pub use crate::core::softmax::{argmax, log_softmax_in_place, log_sum_exp, masked_softmax_in_place, softmax_in_place};
