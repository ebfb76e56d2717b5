//! # RustML Serve
//!
//! Incremental decoding and continuous batching for `rustml-net` token
//! language models.
//!
//! - `KvSession` / `BatchedKvSession` cache keys and values so each appended
//!   token costs one attention row instead of a full re-forward
//! - `TransformerServeBatcher` multiplexes requests over a fixed slot pool,
//!   one token per active slot per `step`
//! - `TransformerServingLayer` wraps the batcher behind a mutex for callers
//!   on several threads
//! - `generate` runs a single request to completion
//!
//! ## Example
//!
//! ```rust,ignore
//! use rustml_serve::*;
//!
//! let config = GenerationConfig::with_top_k(32, 40, 0.8).with_eos(2);
//! let result = generate(&network, &[1, 17, 4], &config, |_tok| TokenControl::Continue)?;
//! println!("{:?} after {} tokens", result.stop, result.tokens.len());
//! ```

pub mod api;
mod core;
mod saf;

pub use saf::*;
