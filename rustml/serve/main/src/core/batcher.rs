//! Continuous batching over a fixed pool of decode slots.
//!
//! Every `step` moves each active slot forward by exactly one token. A slot
//! still in its prompt appends the next prompt token (prefill). A slot past
//! its prompt appends the token it sampled last step and samples the next
//! one (decode). Requests join and leave between steps, so short and long
//! prompts share the pool without padding.
//!
//! The per-slot forward steps run on the rayon pool. Stop polls and token
//! callbacks run afterwards on the thread calling `step`.

use rayon::prelude::*;
use rustml_net::{Network, TransformerHandle};

use crate::api::error::{ServeError, ServeResult};
use crate::api::traits::{StopPoll, TokenCallback};
use crate::api::types::{GenerationConfig, GenerationResult, RequestId, StopReason, TokenControl};
use crate::core::generate::{check_prompt, request_capacity};
use crate::core::sampling::Sampler;
use crate::core::session::KvSession;

/// A prompt plus its generation parameters and optional hooks.
pub struct GenerationRequest {
    pub prompt: Vec<u32>,
    pub config: GenerationConfig,
    on_token: Option<Box<dyn TokenCallback>>,
    stop_poll: Option<Box<dyn StopPoll>>,
}

impl GenerationRequest {
    pub fn new(prompt: Vec<u32>, config: GenerationConfig) -> Self {
        Self { prompt, config, on_token: None, stop_poll: None }
    }

    pub fn with_callback(mut self, callback: impl TokenCallback + 'static) -> Self {
        self.on_token = Some(Box::new(callback));
        self
    }

    pub fn with_stop_poll(mut self, poll: impl StopPoll + 'static) -> Self {
        self.stop_poll = Some(Box::new(poll));
        self
    }
}

impl std::fmt::Debug for GenerationRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationRequest")
            .field("prompt", &self.prompt)
            .field("config", &self.config)
            .field("on_token", &self.on_token.is_some())
            .field("stop_poll", &self.stop_poll.is_some())
            .finish()
    }
}

/// Where an accepted request landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submitted {
    pub id: RequestId,
    pub slot: usize,
}

struct ActiveSlot {
    id: RequestId,
    config: GenerationConfig,
    /// Prompt followed by generated tokens.
    tokens: Vec<u32>,
    prompt_len: usize,
    /// Tokens already appended to the KV cache; always `< tokens.len()`
    /// between steps.
    fed: usize,
    sampler: Sampler,
    on_token: Option<Box<dyn TokenCallback>>,
    stop_poll: Option<Box<dyn StopPoll>>,
}

enum Advance {
    Prefilled,
    Sampled(u32),
    Failed(ServeError),
}

impl ActiveSlot {
    fn generated(&self) -> usize {
        self.tokens.len() - self.prompt_len
    }

    fn advance(&mut self, tf: &TransformerHandle<'_>, session: &mut KvSession) -> Advance {
        let logits = match session.append_with(tf, self.tokens[self.fed]) {
            Ok(logits) => logits,
            Err(e) => return Advance::Failed(e),
        };
        self.fed += 1;
        if self.fed < self.tokens.len() {
            return Advance::Prefilled;
        }
        Advance::Sampled(self.sampler.sample(logits, &self.tokens))
    }
}

/// Fixed-size pool of generation slots sharing one network.
pub struct TransformerServeBatcher {
    slots: Vec<Option<ActiveSlot>>,
    sessions: Vec<KvSession>,
    max_len: usize,
    next_id: RequestId,
}

impl std::fmt::Debug for TransformerServeBatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformerServeBatcher")
            .field("slots", &self.slots.len())
            .field("active", &self.active())
            .field("max_len", &self.max_len)
            .finish()
    }
}

impl TransformerServeBatcher {
    /// `num_slots` concurrent requests, each with at most `max_len` KV positions.
    pub fn new(num_slots: usize, max_len: usize) -> ServeResult<Self> {
        if num_slots == 0 {
            return Err(ServeError::InvalidArgument("num_slots must be > 0".into()));
        }
        if max_len == 0 {
            return Err(ServeError::InvalidArgument("max_len must be > 0".into()));
        }
        Ok(Self {
            slots: (0..num_slots).map(|_| None).collect(),
            sessions: (0..num_slots).map(|_| KvSession::new()).collect(),
            max_len,
            next_id: 1,
        })
    }

    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    pub fn active(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_idle(&self) -> bool {
        self.active() == 0
    }

    pub fn slot_of(&self, id: RequestId) -> Option<usize> {
        self.slots.iter().position(|s| s.as_ref().is_some_and(|a| a.id == id))
    }

    /// KV positions currently held by `slot`.
    pub fn slot_len(&self, slot: usize) -> Option<usize> {
        self.sessions.get(slot).map(KvSession::len)
    }

    /// Places `request` in the lowest free slot.
    pub fn submit(&mut self, network: &Network, request: GenerationRequest) -> ServeResult<Submitted> {
        request.config.validate()?;
        let slot = self.slots.iter().position(Option::is_none).ok_or_else(|| {
            ServeError::InvalidState(format!("all {} slots are busy", self.slots.len()))
        })?;

        let guard = network.read()?;
        let tf = guard.transformer()?;
        request.config.validate_for_vocab(tf.vocab_size())?;
        check_prompt(&request.prompt, tf.vocab_size())?;
        let cap = request_capacity(request.prompt.len(), &request.config, self.max_len)?;
        self.sessions[slot].reset_with(&tf, cap)?;

        let id = self.next_id;
        self.next_id += 1;
        log::debug!("submit: request {} -> slot {} (prompt {}, capacity {})", id, slot, request.prompt.len(), cap);
        self.slots[slot] = Some(ActiveSlot {
            id,
            sampler: Sampler::new(&request.config),
            prompt_len: request.prompt.len(),
            tokens: request.prompt,
            config: request.config,
            fed: 0,
            on_token: request.on_token,
            stop_poll: request.stop_poll,
        });
        Ok(Submitted { id, slot })
    }

    /// Advances every active slot by one token and returns the requests that
    /// finished during this step.
    ///
    /// Fails without touching any slot when the network cannot be read (for
    /// example while it is training). A forward error inside one slot ends
    /// only that request, with `StopReason::Failed`.
    pub fn step(&mut self, network: &Network) -> ServeResult<Vec<GenerationResult>> {
        let mut finished = Vec::new();
        if self.is_idle() {
            return Ok(finished);
        }
        let guard = network.read()?;
        let tf = guard.transformer()?;

        for i in 0..self.slots.len() {
            let cancelled = match &self.slots[i] {
                Some(s) => s.stop_poll.as_ref().is_some_and(|p| p.should_stop(s.id)),
                None => false,
            };
            if cancelled {
                finished.extend(self.finish(i, StopReason::Cancelled, false));
            }
        }

        let outcomes: Vec<Option<Advance>> = self
            .slots
            .par_iter_mut()
            .zip(self.sessions.par_iter_mut())
            .map(|(slot, session)| slot.as_mut().map(|s| s.advance(&tf, session)))
            .collect();
        drop(guard);

        for (i, outcome) in outcomes.into_iter().enumerate() {
            let reason = match outcome {
                None | Some(Advance::Prefilled) => None,
                Some(Advance::Failed(err)) => {
                    log::warn!("slot {} failed: {}", i, err);
                    Some(StopReason::failed(&err))
                }
                Some(Advance::Sampled(tok)) => self.accept(i, tok),
            };
            if let Some(reason) = reason {
                finished.extend(self.finish(i, reason, false));
            }
        }
        Ok(finished)
    }

    /// Steps until every slot is free.
    pub fn run_to_completion(&mut self, network: &Network) -> ServeResult<Vec<GenerationResult>> {
        let mut results = Vec::new();
        while !self.is_idle() {
            results.extend(self.step(network)?);
        }
        Ok(results)
    }

    /// Frees `slot`, ending its request with `StopReason::Removed`. `zero_kv`
    /// also overwrites the cached keys and values.
    pub fn remove(&mut self, slot: usize, zero_kv: bool) -> ServeResult<GenerationResult> {
        if slot >= self.slots.len() {
            return Err(ServeError::InvalidArgument(format!(
                "slot {} out of range for pool of {}",
                slot,
                self.slots.len()
            )));
        }
        self.finish(slot, StopReason::Removed, zero_kv)
            .ok_or_else(|| ServeError::InvalidState(format!("slot {} is not active", slot)))
    }

    /// Records a sampled token; returns a stop reason if the request is done.
    fn accept(&mut self, i: usize, tok: u32) -> Option<StopReason> {
        let full = self.sessions[i].is_full();
        let slot = self.slots[i].as_mut()?;
        if let Some(reason) = slot.config.is_stop_token(tok) {
            return Some(reason);
        }
        slot.tokens.push(tok);
        let index = slot.generated() - 1;
        if let Some(cb) = slot.on_token.as_mut() {
            if cb.on_token(slot.id, tok, index) == TokenControl::Stop {
                return Some(StopReason::Cancelled);
            }
        }
        if slot.generated() >= slot.config.max_new_tokens {
            return Some(StopReason::MaxNewTokens);
        }
        if full {
            return Some(StopReason::LengthCap);
        }
        None
    }

    fn finish(&mut self, i: usize, stop: StopReason, zero_kv: bool) -> Option<GenerationResult> {
        let mut slot = self.slots[i].take()?;
        self.sessions[i].clear(zero_kv);
        log::debug!("finish: request {} in slot {} after {} tokens, {:?}", slot.id, i, slot.generated(), stop);
        Some(GenerationResult {
            id: slot.id,
            prompt_len: slot.prompt_len,
            tokens: slot.tokens.split_off(slot.prompt_len),
            stop,
        })
    }
}
