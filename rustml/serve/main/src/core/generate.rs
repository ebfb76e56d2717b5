//! Single-request generation on top of `KvSession`.

use rustml_net::Network;

use crate::api::error::{ServeError, ServeResult};
use crate::api::types::{GenerationConfig, GenerationResult, StopReason, TokenControl};
use crate::core::sampling::Sampler;
use crate::core::session::KvSession;

/// Upper bound on the KV positions `generate` allocates for one call.
pub const GENERATE_MAX_LEN: usize = 4096;

/// Rejects empty prompts and ids outside the vocabulary.
pub(crate) fn check_prompt(prompt: &[u32], vocab_size: usize) -> ServeResult<()> {
    if prompt.is_empty() {
        return Err(ServeError::InvalidArgument("prompt must not be empty".into()));
    }
    if let Some((pos, tok)) = prompt.iter().enumerate().find(|(_, &t)| t as usize >= vocab_size) {
        return Err(ServeError::InvalidArgument(format!(
            "prompt token {} at position {} outside vocabulary of {}",
            tok, pos, vocab_size
        )));
    }
    Ok(())
}

/// KV positions a request may use, bounded by `limit`.
pub(crate) fn request_capacity(prompt_len: usize, config: &GenerationConfig, limit: usize) -> ServeResult<usize> {
    let cap = config.max_len.unwrap_or(prompt_len.saturating_add(config.max_new_tokens)).min(limit);
    if prompt_len > cap {
        return Err(ServeError::InvalidArgument(format!(
            "prompt of {} tokens exceeds KV capacity {}",
            prompt_len, cap
        )));
    }
    Ok(cap)
}

/// Generates from `prompt` until a stop condition, calling `on_token` for
/// every generated token.
///
/// The cache holds at most `GENERATE_MAX_LEN` positions. Without an explicit
/// `max_len` a longer request ends with `StopReason::LengthCap`; an explicit
/// `max_len` above the bound is rejected.
///
/// Holds a shared read of the network for the whole call, so a concurrent
/// `Network::run` fails with `InvalidState` instead of changing weights
/// underneath the decoder.
pub fn generate<F>(
    network: &Network,
    prompt: &[u32],
    config: &GenerationConfig,
    mut on_token: F,
) -> ServeResult<GenerationResult>
where
    F: FnMut(u32) -> TokenControl,
{
    config.validate()?;
    let guard = network.read()?;
    let tf = guard.transformer()?;
    config.validate_for_vocab(tf.vocab_size())?;
    check_prompt(prompt, tf.vocab_size())?;
    if let Some(max_len) = config.max_len.filter(|&m| m > GENERATE_MAX_LEN) {
        return Err(ServeError::InvalidArgument(format!(
            "max_len {} exceeds the generate limit of {}",
            max_len, GENERATE_MAX_LEN
        )));
    }
    let cap = request_capacity(prompt.len(), config, GENERATE_MAX_LEN)?;

    let mut session = KvSession::new();
    session.reset_with(&tf, cap)?;
    let mut sampler = Sampler::new(config);
    let mut tokens = prompt.to_vec();
    let mut fed = 0;

    let stop = loop {
        let logits = session.append_with(&tf, tokens[fed])?;
        fed += 1;
        if fed < tokens.len() {
            continue;
        }
        let tok = sampler.sample(logits, &tokens);
        if let Some(reason) = config.is_stop_token(tok) {
            break reason;
        }
        tokens.push(tok);
        if on_token(tok) == TokenControl::Stop {
            break StopReason::Cancelled;
        }
        if tokens.len() - prompt.len() >= config.max_new_tokens {
            break StopReason::MaxNewTokens;
        }
        if session.is_full() {
            break StopReason::LengthCap;
        }
    };

    log::debug!("generate: {} new tokens, stop {:?}", tokens.len() - prompt.len(), stop);
    Ok(GenerationResult { id: 0, prompt_len: prompt.len(), tokens: tokens.split_off(prompt.len()), stop })
}
