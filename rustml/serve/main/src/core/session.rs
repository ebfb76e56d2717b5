//! KV-cache decoding sessions.
//!
//! A session owns its cache, positional tables, scratch and logits, and only
//! borrows the model for the duration of one call, so any number of sessions
//! can decode against one network at the same time.

use rayon::prelude::*;
use rustml_net::{DecodeScratch, KvBuffers, Network, PositionalCache, TransformerHandle};

use crate::api::error::{ServeError, ServeResult};
use crate::api::types::SessionState;

struct Cache {
    kv: KvBuffers,
    positions: PositionalCache,
}

/// Incremental decoder for one token stream.
pub struct KvSession {
    cache: Option<Cache>,
    scratch: DecodeScratch,
    logits: Vec<f32>,
}

impl Default for KvSession {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for KvSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvSession").field("state", &self.state()).finish()
    }
}

impl KvSession {
    /// An uninitialized session; call `reset` before appending.
    pub fn new() -> Self {
        Self { cache: None, scratch: DecodeScratch::new(), logits: Vec::new() }
    }

    pub fn state(&self) -> SessionState {
        match &self.cache {
            None => SessionState::Uninitialized,
            Some(c) if c.kv.is_full() => SessionState::Full { len: c.kv.len() },
            Some(c) => SessionState::Ready { len: c.kv.len() },
        }
    }

    pub fn len(&self) -> usize {
        self.cache.as_ref().map_or(0, |c| c.kv.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_len(&self) -> usize {
        self.cache.as_ref().map_or(0, |c| c.kv.max_len())
    }

    pub fn is_full(&self) -> bool {
        matches!(self.state(), SessionState::Full { .. })
    }

    /// Validity of each cached position.
    pub fn valid_mask(&self) -> &[bool] {
        self.cache.as_ref().map_or(&[][..], |c| c.kv.valid())
    }

    /// Logits produced by the most recent `append`.
    pub fn last_logits(&self) -> Option<&[f32]> {
        (!self.is_empty()).then_some(self.logits.as_slice())
    }

    /// Prepares an empty cache of `max_len` positions for `network`.
    pub fn reset(&mut self, network: &Network, max_len: usize) -> ServeResult<()> {
        let guard = network.read()?;
        let tf = guard.transformer()?;
        self.reset_with(&tf, max_len)
    }

    /// `reset` against an already borrowed model. Buffers with a matching
    /// geometry are reused.
    pub fn reset_with(&mut self, tf: &TransformerHandle<'_>, max_len: usize) -> ServeResult<()> {
        if max_len == 0 {
            return Err(ServeError::InvalidArgument("session max_len must be > 0".into()));
        }
        let positions = tf.positional_cache(max_len)?;
        let kv = match self.cache.take() {
            Some(mut c) if c.kv.fits(tf.num_layers(), tf.kv_width(), max_len) => {
                c.kv.clear(false);
                c.kv
            }
            _ => tf.new_kv(max_len),
        };
        self.cache = Some(Cache { kv, positions });
        self.logits.clear();
        self.logits.resize(tf.vocab_size(), 0.0);
        Ok(())
    }

    /// Forgets every cached position; `zero` also overwrites the stored rows.
    pub fn clear(&mut self, zero: bool) {
        if let Some(c) = self.cache.as_mut() {
            c.kv.clear(zero);
        }
        if zero {
            self.logits.fill(0.0);
        }
    }

    /// Drops the cache; the session is uninitialized again.
    pub fn release(&mut self) {
        self.cache = None;
    }

    /// Appends `token` and returns the logits for its position.
    pub fn append(&mut self, network: &Network, token: u32) -> ServeResult<&[f32]> {
        let guard = network.read()?;
        let tf = guard.transformer()?;
        self.append_with(&tf, token)?;
        Ok(&self.logits)
    }

    /// `append` against an already borrowed model.
    pub fn append_with(&mut self, tf: &TransformerHandle<'_>, token: u32) -> ServeResult<&[f32]> {
        let cache = self
            .cache
            .as_mut()
            .ok_or_else(|| ServeError::InvalidState("session has not been reset".into()))?;
        if cache.kv.is_full() {
            return Err(ServeError::InvalidState(format!(
                "session is full at {} positions",
                cache.kv.max_len()
            )));
        }
        if self.logits.len() != tf.vocab_size() {
            return Err(ServeError::InvalidArgument(format!(
                "session was reset for a vocabulary of {}, model has {}",
                self.logits.len(),
                tf.vocab_size()
            )));
        }
        tf.decode_step(&mut cache.kv, &cache.positions, token, &mut self.scratch, &mut self.logits)?;
        Ok(&self.logits)
    }
}

/// Independent sessions advanced together; rows may hold different lengths.
#[derive(Debug, Default)]
pub struct BatchedKvSession {
    rows: Vec<KvSession>,
}

impl BatchedKvSession {
    pub fn new(batch: usize) -> Self {
        Self { rows: (0..batch).map(|_| KvSession::new()).collect() }
    }

    pub fn batch_size(&self) -> usize {
        self.rows.len()
    }

    pub fn row(&self, row: usize) -> Option<&KvSession> {
        self.rows.get(row)
    }

    pub fn lens(&self) -> Vec<usize> {
        self.rows.iter().map(KvSession::len).collect()
    }

    pub fn valid_mask(&self, row: usize) -> &[bool] {
        self.rows.get(row).map_or(&[][..], KvSession::valid_mask)
    }

    /// Resets every row to an empty cache of `max_len` positions.
    pub fn reset(&mut self, network: &Network, max_len: usize) -> ServeResult<()> {
        let guard = network.read()?;
        let tf = guard.transformer()?;
        for row in self.rows.iter_mut() {
            row.reset_with(&tf, max_len)?;
        }
        Ok(())
    }

    pub fn reset_row(&mut self, network: &Network, row: usize, max_len: usize) -> ServeResult<()> {
        let guard = network.read()?;
        let tf = guard.transformer()?;
        self.row_mut(row)?.reset_with(&tf, max_len)
    }

    pub fn clear_row(&mut self, row: usize, zero: bool) -> ServeResult<()> {
        self.row_mut(row)?.clear(zero);
        Ok(())
    }

    /// Appends `tokens[i]` to row `i`; `None` leaves that row untouched. Rows
    /// run in parallel. The first failing row's error is returned, but rows
    /// that succeeded keep their new position.
    pub fn append_batch(&mut self, network: &Network, tokens: &[Option<u32>]) -> ServeResult<()> {
        if tokens.len() != self.rows.len() {
            return Err(ServeError::InvalidArgument(format!(
                "append_batch: {} tokens for {} rows",
                tokens.len(),
                self.rows.len()
            )));
        }
        let guard = network.read()?;
        let tf = guard.transformer()?;
        let results: Vec<ServeResult<()>> = self
            .rows
            .par_iter_mut()
            .zip(tokens.par_iter())
            .map(|(row, tok)| match tok {
                Some(t) => row.append_with(&tf, *t).map(|_| ()),
                None => Ok(()),
            })
            .collect();
        results.into_iter().collect()
    }

    /// Logits of the last append on `row`.
    pub fn logits(&self, row: usize) -> Option<&[f32]> {
        self.rows.get(row).and_then(KvSession::last_logits)
    }

    fn row_mut(&mut self, row: usize) -> ServeResult<&mut KvSession> {
        let n = self.rows.len();
        self.rows
            .get_mut(row)
            .ok_or_else(|| ServeError::InvalidArgument(format!("row {} out of range for batch of {}", row, n)))
    }
}
