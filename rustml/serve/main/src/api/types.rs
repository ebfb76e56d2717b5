//! Public configuration and result types for generation

use rustml_net::ErrorCode;
use serde::{Deserialize, Serialize};

use crate::api::error::{ServeError, ServeResult};

/// Identifier handed out by `TransformerServeBatcher::submit`.
pub type RequestId = u64;

/// Sampling and stopping parameters for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Maximum number of tokens to generate
    pub max_new_tokens: usize,
    /// Temperature for sampling; `<= 0` selects greedy decoding
    pub temperature: f32,
    /// Top-k filtering (None = disabled)
    pub top_k: Option<usize>,
    /// Top-p / nucleus filtering (None = disabled)
    pub top_p: Option<f32>,
    /// Repetition penalty (1.0 = disabled)
    pub repetition_penalty: f32,
    /// End-of-sequence token
    pub eos_token: Option<u32>,
    /// Further tokens that end generation
    pub stop_tokens: Vec<u32>,
    /// Seed of the request-owned sampling RNG
    pub seed: u64,
    /// KV capacity for the request; defaults to prompt length + `max_new_tokens`
    pub max_len: Option<usize>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 64,
            temperature: 1.0,
            top_k: None,
            top_p: None,
            repetition_penalty: 1.0,
            eos_token: None,
            stop_tokens: Vec::new(),
            seed: 0,
            max_len: None,
        }
    }
}

impl GenerationConfig {
    /// Greedy decoding.
    pub fn greedy(max_new_tokens: usize) -> Self {
        Self { max_new_tokens, temperature: 0.0, ..Self::default() }
    }

    /// Plain temperature sampling.
    pub fn with_temperature(max_new_tokens: usize, temperature: f32) -> Self {
        Self { max_new_tokens, temperature, ..Self::default() }
    }

    /// Top-k sampling.
    pub fn with_top_k(max_new_tokens: usize, k: usize, temperature: f32) -> Self {
        Self { max_new_tokens, temperature, top_k: Some(k), ..Self::default() }
    }

    /// Nucleus sampling.
    pub fn with_top_p(max_new_tokens: usize, p: f32, temperature: f32) -> Self {
        Self { max_new_tokens, temperature, top_p: Some(p), ..Self::default() }
    }

    pub fn with_eos(mut self, token: u32) -> Self {
        self.eos_token = Some(token);
        self
    }

    pub fn with_stop_tokens(mut self, tokens: Vec<u32>) -> Self {
        self.stop_tokens = tokens;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_repetition_penalty(mut self, penalty: f32) -> Self {
        self.repetition_penalty = penalty;
        self
    }

    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = Some(max_len);
        self
    }

    pub fn is_greedy(&self) -> bool {
        self.temperature <= 0.0
    }

    /// Rejects malformed parameters before a request is accepted.
    pub fn validate(&self) -> ServeResult<()> {
        if self.max_new_tokens == 0 {
            return Err(ServeError::InvalidArgument("max_new_tokens must be > 0".into()));
        }
        if !self.temperature.is_finite() {
            return Err(ServeError::InvalidArgument(format!(
                "temperature must be finite, got {}",
                self.temperature
            )));
        }
        if self.top_k == Some(0) {
            return Err(ServeError::InvalidArgument("top_k must be > 0".into()));
        }
        if let Some(p) = self.top_p {
            if !(p > 0.0 && p <= 1.0) {
                return Err(ServeError::InvalidArgument(format!("top_p must be in (0, 1], got {}", p)));
            }
        }
        if !(self.repetition_penalty.is_finite() && self.repetition_penalty > 0.0) {
            return Err(ServeError::InvalidArgument(format!(
                "repetition_penalty must be positive, got {}",
                self.repetition_penalty
            )));
        }
        if self.max_len == Some(0) {
            return Err(ServeError::InvalidArgument("max_len must be > 0".into()));
        }
        Ok(())
    }

    /// Checks the configured token ids against a vocabulary.
    pub fn validate_for_vocab(&self, vocab_size: usize) -> ServeResult<()> {
        self.validate()?;
        let out_of_range = self.eos_token.iter().chain(self.stop_tokens.iter()).find(|&&t| t as usize >= vocab_size);
        match out_of_range {
            Some(t) => Err(ServeError::InvalidArgument(format!(
                "stop token {} outside vocabulary of {}",
                t, vocab_size
            ))),
            None => Ok(()),
        }
    }

    pub(crate) fn is_stop_token(&self, token: u32) -> Option<StopReason> {
        if self.eos_token == Some(token) {
            Some(StopReason::Eos)
        } else if self.stop_tokens.contains(&token) {
            Some(StopReason::StopToken)
        } else {
            None
        }
    }
}

/// Why a request finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// The EOS token was sampled (not included in the output).
    Eos,
    /// One of `stop_tokens` was sampled (not included in the output).
    StopToken,
    MaxNewTokens,
    /// A token callback or stop poll asked to stop, or the cancel flag was set.
    Cancelled,
    /// The request's KV capacity ran out before any other stop condition.
    LengthCap,
    /// The slot was freed with `remove`.
    Removed,
    Failed { code: ErrorCode, message: String },
}

impl StopReason {
    pub(crate) fn failed(err: &ServeError) -> Self {
        StopReason::Failed { code: err.code(), message: err.to_string() }
    }
}

/// Outcome of one request.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationResult {
    pub id: RequestId,
    pub prompt_len: usize,
    /// Generated tokens, excluding the prompt and any stop token.
    pub tokens: Vec<u32>,
    pub stop: StopReason,
}

/// Returned by token callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenControl {
    Continue,
    Stop,
}

/// Lifecycle of a `KvSession`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Ready { len: usize },
    Full { len: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_bad_params() {
        assert!(GenerationConfig::greedy(4).validate().is_ok());
        assert!(GenerationConfig::greedy(0).validate().is_err());
        assert!(GenerationConfig::with_top_p(4, 1.5, 1.0).validate().is_err());
        assert!(GenerationConfig::with_top_p(4, 0.0, 1.0).validate().is_err());
        assert!(GenerationConfig::with_top_k(4, 0, 1.0).validate().is_err());
        assert!(GenerationConfig::with_temperature(4, f32::NAN).validate().is_err());
        assert!(GenerationConfig::greedy(4).with_repetition_penalty(0.0).validate().is_err());
    }

    #[test]
    fn test_stop_tokens_checked_against_vocab() {
        let cfg = GenerationConfig::greedy(4).with_eos(3).with_stop_tokens(vec![9]);
        assert!(cfg.validate_for_vocab(10).is_ok());
        let err = cfg.validate_for_vocab(8).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
    }

    #[test]
    fn test_stop_reason_lookup() {
        let cfg = GenerationConfig::greedy(4).with_eos(1).with_stop_tokens(vec![2, 1]);
        assert_eq!(cfg.is_stop_token(1), Some(StopReason::Eos));
        assert_eq!(cfg.is_stop_token(2), Some(StopReason::StopToken));
        assert_eq!(cfg.is_stop_token(3), None);
    }
}
