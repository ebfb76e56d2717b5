//! Thread-safe facade over `TransformerServeBatcher`.

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, ThreadId};

use rustml_net::Network;

use crate::api::error::{ServeError, ServeResult};
use crate::api::types::GenerationResult;
use crate::core::batcher::{GenerationRequest, Submitted, TransformerServeBatcher};

/// Owns a batcher and the network it serves. Every entry point takes the
/// internal mutex. Token callbacks run inside `step` while that mutex is held,
/// so an entry point called from a callback fails with `InvalidState`
/// instead of deadlocking.
pub struct TransformerServingLayer {
    network: Arc<Network>,
    batcher: Mutex<TransformerServeBatcher>,
    stepping: Mutex<Option<ThreadId>>,
}

impl std::fmt::Debug for TransformerServingLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformerServingLayer").field("network", &self.network).finish_non_exhaustive()
    }
}

/// Clears the stepping marker when `step` returns or unwinds.
struct SteppingMark<'a>(&'a Mutex<Option<ThreadId>>);

impl Drop for SteppingMark<'_> {
    fn drop(&mut self) {
        if let Ok(mut current) = self.0.lock() {
            *current = None;
        }
    }
}

impl TransformerServingLayer {
    pub fn new(network: Arc<Network>, num_slots: usize, max_len: usize) -> ServeResult<Self> {
        Ok(Self {
            network,
            batcher: Mutex::new(TransformerServeBatcher::new(num_slots, max_len)?),
            stepping: Mutex::new(None),
        })
    }

    pub fn network(&self) -> &Arc<Network> {
        &self.network
    }

    pub fn submit(&self, request: GenerationRequest) -> ServeResult<Submitted> {
        self.lock()?.submit(&self.network, request)
    }

    /// One batcher step; see `TransformerServeBatcher::step`.
    pub fn step(&self) -> ServeResult<Vec<GenerationResult>> {
        let mut batcher = self.lock()?;
        let _mark = self.mark_stepping()?;
        batcher.step(&self.network)
    }

    pub fn remove(&self, slot: usize, zero_kv: bool) -> ServeResult<GenerationResult> {
        self.lock()?.remove(slot, zero_kv)
    }

    pub fn active(&self) -> ServeResult<usize> {
        Ok(self.lock()?.active())
    }

    /// Steps until no request is left, releasing the mutex between steps so
    /// other threads can submit.
    pub fn run_until_idle(&self) -> ServeResult<Vec<GenerationResult>> {
        let mut results = Vec::new();
        while self.active()? > 0 {
            results.extend(self.step()?);
        }
        Ok(results)
    }

    fn lock(&self) -> ServeResult<MutexGuard<'_, TransformerServeBatcher>> {
        let me = thread::current().id();
        let stepping = *self.stepping.lock().map_err(|_| ServeError::Internal("stepping marker poisoned".into()))?;
        if stepping == Some(me) {
            return Err(ServeError::InvalidState("serving layer called from inside a step callback".into()));
        }
        self.batcher.lock().map_err(|_| ServeError::Internal("serving batcher mutex poisoned".into()))
    }

    fn mark_stepping(&self) -> ServeResult<SteppingMark<'_>> {
        let mut current = self.stepping.lock().map_err(|_| ServeError::Internal("stepping marker poisoned".into()))?;
        *current = Some(thread::current().id());
        Ok(SteppingMark(&self.stepping))
    }
}
