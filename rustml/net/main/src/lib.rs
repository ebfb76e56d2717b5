//! # RustML Net
//!
//! Packed-tensor training engine for dense feed-forward, recurrent
//! (RNN / GRU / LSTM) and Transformer networks, including token-level
//! language models.
//!
//! Parameters live in one arena (`ParamStore`) of named tensors; every
//! forward, backward and optimizer step is written out by hand on top of the
//! `rustml-kernels` primitives. There is no autodiff tape.
//!
//! - `Network` owns the parameters and runs train / test / validate passes
//!   behind a non-blocking run guard
//! - `Dataset` is the single capability trait datasets implement
//!   (`InMemoryDataset`, `TokenDataset`, `MmapDataset`)
//! - model packages and sharded checkpoints persist the packed tensors
//!
//! ## Example
//!
//! ```rust,ignore
//! use rustml_net::*;
//!
//! let arch = ArchitectureConfig::Dff(DffConfig::new(vec![8]));
//! let network = Network::new(arch, TrainingConfig::default())?;
//! let summary = network.run(&dataset, RunMode::Train, &mut LoggingCallbacks)?;
//! println!("final loss {:.4}", summary.last().map(|m| m.loss).unwrap_or(0.0));
//! ```

pub mod api;
mod core;
mod saf;

pub use saf::*;
