//! Facade re-exports for rustml-serve

pub use crate::api::error::*;
pub use crate::api::traits::*;
pub use crate::api::types::*;
pub use crate::core::batcher::{GenerationRequest, Submitted, TransformerServeBatcher};
pub use crate::core::generate::{generate, GENERATE_MAX_LEN};
pub use crate::core::sampling::{
    apply_repetition_penalty, apply_top_k, apply_top_p, greedy_token, sample_categorical, Sampler, NUCLEUS_PREFILTER_K,
};
pub use crate::core::serving::TransformerServingLayer;
pub use crate::core::session::{BatchedKvSession, KvSession};
