//! Positional tables and the key/value cache used by incremental decoding.

use rustml_kernels::{
    gemv, multi_head_forward, norm_rows_forward, AttentionMask, AttentionStrategy, NormStats, RopeTable,
    SinusoidalTable,
};

use crate::api::config::{PositionalKind, TransformerConfig};
use crate::api::error::{NetError, NetResult};
use crate::core::model::transformer::{ffn_forward, InputParams, TransformerModel};
use crate::core::model::{add_into, copy_row, ensure_len};
use crate::core::params::ParamStore;

/// Precomputed positional information for positions `0..max_len`.
#[derive(Debug, Clone)]
pub enum PositionalCache {
    Sinusoidal(SinusoidalTable),
    Rope(RopeTable),
    None,
}

impl PositionalCache {
    pub fn new(cfg: &TransformerConfig, max_len: usize) -> NetResult<Self> {
        Ok(match cfg.positional {
            PositionalKind::Sinusoidal => PositionalCache::Sinusoidal(SinusoidalTable::new(cfg.d_model, max_len)),
            PositionalKind::Rope => PositionalCache::Rope(RopeTable::new(cfg.head_dim(), max_len, cfg.rope_theta)?),
            PositionalKind::None => PositionalCache::None,
        })
    }

    /// Adds the sinusoidal encoding of `pos` to an input row.
    pub fn add_input(&self, x: &mut [f32], pos: usize) {
        if let PositionalCache::Sinusoidal(table) = self {
            table.add_to(x, pos);
        }
    }

    /// Rotates packed query and key rows whose first row sits at `start_pos`.
    #[allow(clippy::too_many_arguments)]
    pub fn rotate(&self, q: &mut [f32], k: &mut [f32], rows: usize, heads: usize, kv_heads: usize, start_pos: usize) {
        if let PositionalCache::Rope(rope) = self {
            rope.apply_rows(q, rows, heads, start_pos);
            rope.apply_rows(k, rows, kv_heads, start_pos);
        }
    }

    /// Backward of `rotate`.
    #[allow(clippy::too_many_arguments)]
    pub fn rotate_inverse(&self, dq: &mut [f32], dk: &mut [f32], rows: usize, heads: usize, kv_heads: usize, start_pos: usize) {
        if let PositionalCache::Rope(rope) = self {
            rope.apply_rows_inverse(dq, rows, heads, start_pos);
            rope.apply_rows_inverse(dk, rows, kv_heads, start_pos);
        }
    }
}

/// Per-layer key/value rows for positions `0..len`, plus a validity mask.
#[derive(Debug, Clone)]
pub struct KvBuffers {
    keys: Vec<Vec<f32>>,
    values: Vec<Vec<f32>>,
    valid: Vec<bool>,
    len: usize,
    max_len: usize,
    kv_width: usize,
}

impl KvBuffers {
    pub fn new(num_layers: usize, kv_width: usize, max_len: usize) -> Self {
        Self {
            keys: vec![vec![0.0; max_len * kv_width]; num_layers],
            values: vec![vec![0.0; max_len * kv_width]; num_layers],
            valid: vec![false; max_len],
            len: 0,
            max_len,
            kv_width,
        }
    }

    /// `true` when the buffers already have this geometry and can be reused.
    pub fn fits(&self, num_layers: usize, kv_width: usize, max_len: usize) -> bool {
        self.keys.len() == num_layers && self.kv_width == kv_width && self.max_len == max_len
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    pub fn is_full(&self) -> bool {
        self.len >= self.max_len
    }

    pub fn valid(&self) -> &[bool] {
        &self.valid[..self.len]
    }

    /// Forgets every position; `zero` also overwrites the stored rows.
    pub fn clear(&mut self, zero: bool) {
        self.len = 0;
        self.valid.fill(false);
        if zero {
            for buf in self.keys.iter_mut().chain(self.values.iter_mut()) {
                buf.fill(0.0);
            }
        }
    }
}

/// Per-step activations of one decoding stream.
#[derive(Debug, Clone, Default)]
pub struct DecodeScratch {
    x: Vec<f32>,
    n: Vec<f32>,
    q: Vec<f32>,
    att: Vec<f32>,
    tmp: Vec<f32>,
    h_pre: Vec<f32>,
    u: Vec<f32>,
    h_act: Vec<f32>,
    work: Vec<f32>,
}

impl DecodeScratch {
    pub fn new() -> Self {
        Self::default()
    }

    fn prepare(&mut self, cfg: &TransformerConfig, kv_len: usize) {
        let d = cfg.d_model;
        let qw = cfg.num_heads * cfg.head_dim();
        ensure_len(&mut self.x, d);
        ensure_len(&mut self.n, d);
        ensure_len(&mut self.tmp, d);
        ensure_len(&mut self.q, qw);
        ensure_len(&mut self.att, qw);
        ensure_len(&mut self.h_pre, cfg.ffn_hidden);
        ensure_len(&mut self.u, cfg.ffn_hidden);
        ensure_len(&mut self.h_act, cfg.ffn_hidden);
        ensure_len(&mut self.work, AttentionStrategy::Recompute.work_len(1, kv_len));
    }
}

impl TransformerModel {
    /// One cached decoding step: appends `token` at position `kv.len()` and
    /// writes the next-token logits. Reads the model immutably, so any number
    /// of streams can decode against one network at once.
    pub fn decode_step(
        &self,
        store: &ParamStore,
        kv: &mut KvBuffers,
        positions: &PositionalCache,
        token: u32,
        scratch: &mut DecodeScratch,
        logits: &mut [f32],
    ) -> NetResult<()> {
        let cfg = &self.cfg;
        let vocab = self
            .vocab_size()
            .ok_or_else(|| NetError::InvalidState("incremental decoding needs a token language model".into()))?;
        let embed = match self.input {
            InputParams::Embedding(id) => id,
            InputParams::Projection { .. } => {
                return Err(NetError::InvalidState("incremental decoding needs a token embedding".into()))
            }
        };
        if token as usize >= vocab {
            return Err(NetError::InvalidArgument(format!("token {} outside vocabulary of {}", token, vocab)));
        }
        if logits.len() != vocab {
            return Err(NetError::InvalidArgument(format!(
                "logits buffer holds {} values for vocabulary {}",
                logits.len(),
                vocab
            )));
        }
        if kv.is_full() {
            return Err(NetError::InvalidState(format!("KV cache full at {} positions", kv.max_len)));
        }
        if !kv.fits(self.blocks.len(), self.layout.kv_width(), kv.max_len) {
            return Err(NetError::InvalidArgument("KV buffers were built for a different network".into()));
        }

        let pos = kv.len;
        let d = cfg.d_model;
        let qw = self.layout.q_width();
        let kvw = self.layout.kv_width();
        scratch.prepare(cfg, pos + 1);
        let mut stats = [NormStats::default()];

        let x = &mut scratch.x[..d];
        copy_row(store.weight(embed), token as usize, d, x);
        positions.add_input(x, pos);
        kv.valid[pos] = true;

        for (l, b) in self.blocks.iter().enumerate() {
            let n = &mut scratch.n[..d];
            norm_rows_forward(
                cfg.norm,
                x,
                1,
                d,
                store.value(b.norm1.scale),
                store.value(b.norm1.shift),
                cfg.norm_eps,
                n,
                &mut stats,
            );
            let q = &mut scratch.q[..qw];
            let k_row = &mut kv.keys[l][pos * kvw..(pos + 1) * kvw];
            let v_row = &mut kv.values[l][pos * kvw..(pos + 1) * kvw];
            gemv(store.weight(b.wq), qw, d, n, None, q);
            gemv(store.weight(b.wk), kvw, d, n, None, k_row);
            gemv(store.weight(b.wv), kvw, d, n, None, v_row);
            positions.rotate(q, k_row, 1, self.layout.num_heads, self.layout.num_kv_heads, pos);

            let mask = AttentionMask::causal(pos).with_key_valid(&kv.valid);
            let att = &mut scratch.att[..qw];
            multi_head_forward(
                AttentionStrategy::Recompute,
                &self.layout,
                1,
                pos + 1,
                q,
                &kv.keys[l],
                &kv.values[l],
                &mask,
                &mut scratch.work,
                att,
            )?;
            let tmp = &mut scratch.tmp[..d];
            gemv(store.weight(b.wo), d, qw, att, None, tmp);
            add_into(x, tmp);

            norm_rows_forward(
                cfg.norm,
                x,
                1,
                d,
                store.value(b.norm2.scale),
                store.value(b.norm2.shift),
                cfg.norm_eps,
                n,
                &mut stats,
            );
            ffn_forward(
                store,
                &b.ffn,
                d,
                cfg.ffn_hidden,
                n,
                1,
                &mut scratch.h_pre,
                &mut scratch.u,
                &mut scratch.h_act,
                tmp,
            );
            add_into(x, tmp);
        }

        let n = &mut scratch.n[..d];
        norm_rows_forward(
            cfg.norm,
            x,
            1,
            d,
            store.value(self.final_norm.scale),
            store.value(self.final_norm.shift),
            cfg.norm_eps,
            n,
            &mut stats,
        );
        gemv(store.weight(self.head), vocab, d, n, None, logits);
        kv.len = pos + 1;
        Ok(())
    }
}
