//! Pre-norm Transformer blocks over packed `[T, width]` rows, with either a
//! token embedding (language model) or a dense input projection.

use rand::rngs::StdRng;
use rand::Rng;
use rustml_kernels::{
    axpy, dot, matmul_rows, matmul_rows_transposed_acc, multi_head_backward, multi_head_forward, norm_rows_backward,
    norm_rows_forward, outer_acc_rows, Activation, AttentionMask, AttentionStrategy, HeadLayout, NormStats,
};

use crate::api::config::{FeedForwardKind, LmLoss, TransformerConfig};
use crate::api::error::{NetError, NetResult};
use crate::api::types::IoShape;
use crate::core::loss::{sampled_cross_entropy, token_cross_entropy};
use crate::core::metrics::MetricsAccumulator;
use crate::core::model::kv::PositionalCache;
use crate::core::model::{add_into, add_rows, copy_row, ensure_len};
use crate::core::params::{Gradients, Init, ParamId, ParamStore};

const EMBED_INIT_STD: f32 = 0.02;

#[derive(Debug, Clone, Copy)]
pub struct NormParams {
    pub scale: ParamId,
    pub shift: ParamId,
}

#[derive(Debug, Clone, Copy)]
pub enum FfnParams {
    Mlp { w1: ParamId, b1: ParamId, w2: ParamId, b2: ParamId },
    SwiGlu { wg: ParamId, wu: ParamId, wd: ParamId },
}

#[derive(Debug, Clone, Copy)]
pub struct BlockParams {
    pub norm1: NormParams,
    pub wq: ParamId,
    pub wk: ParamId,
    pub wv: ParamId,
    pub wo: ParamId,
    pub norm2: NormParams,
    pub ffn: FfnParams,
}

#[derive(Debug, Clone, Copy)]
pub enum InputParams {
    Embedding(ParamId),
    Projection { weight: ParamId, bias: ParamId },
}

/// What a training window feeds the first block.
#[derive(Debug, Clone, Copy)]
pub enum WindowInput<'a> {
    Tokens(&'a [u32]),
    /// Feature rows `[T, inputs]`.
    Rows(&'a [f32]),
}

#[derive(Debug, Clone, Default)]
struct BlockCache {
    x_in: Vec<f32>,
    n1: Vec<f32>,
    stats1: Vec<NormStats>,
    q: Vec<f32>,
    k: Vec<f32>,
    v: Vec<f32>,
    /// Attention scratch; the per-head probabilities when materialized.
    work: Vec<f32>,
    att: Vec<f32>,
    x_mid: Vec<f32>,
    n2: Vec<f32>,
    stats2: Vec<NormStats>,
    h_pre: Vec<f32>,
    u: Vec<f32>,
    h_act: Vec<f32>,
}

#[derive(Debug, Clone, Default)]
struct Scratch {
    rows: usize,
    tokens: Vec<u32>,
    x_rows: Vec<f32>,
    blocks: Vec<BlockCache>,
    x_final: Vec<f32>,
    nf: Vec<f32>,
    stats_f: Vec<NormStats>,
    /// Head output: logits `[T, V]` or pre-activations `[T, O]`.
    logits: Vec<f32>,
    a_out: Vec<f32>,
    dlogits: Vec<f32>,
    d_nf: Vec<f32>,
    dx: Vec<f32>,
    dtmp: Vec<f32>,
    dn: Vec<f32>,
    datt: Vec<f32>,
    dq: Vec<f32>,
    dk: Vec<f32>,
    dv: Vec<f32>,
    dh: Vec<f32>,
    dgate: Vec<f32>,
    du: Vec<f32>,
    attn_scratch: Vec<f32>,
    cand: Vec<u32>,
    cand_logits: Vec<f32>,
    cand_grads: Vec<f32>,
    cand_rows: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct TransformerModel {
    pub(crate) cfg: TransformerConfig,
    io: IoShape,
    pub(crate) layout: HeadLayout,
    pub(crate) input: InputParams,
    pub(crate) blocks: Vec<BlockParams>,
    pub(crate) final_norm: NormParams,
    pub(crate) head: ParamId,
    head_bias: Option<ParamId>,
    positions: PositionalCache,
    s: Scratch,
}

fn add_norm(store: &mut ParamStore, prefix: &str, d: usize, rng: &mut StdRng) -> NormParams {
    NormParams {
        scale: store.add(format!("{}.scale", prefix), &[d], Init::Constant(1.0), false, rng),
        shift: store.add(format!("{}.shift", prefix), &[d], Init::Zeros, false, rng),
    }
}

impl TransformerModel {
    pub fn build(cfg: &TransformerConfig, io: IoShape, store: &mut ParamStore, rng: &mut StdRng) -> NetResult<Self> {
        let d = cfg.d_model;
        let f = cfg.ffn_hidden;
        let layout = HeadLayout::new(cfg.num_heads, cfg.num_kv_heads, cfg.head_dim())?;
        let (qw, kvw) = (layout.q_width(), layout.kv_width());

        let input = match &cfg.token_lm {
            Some(lm) => InputParams::Embedding(store.add(
                "tf.embed",
                &[lm.vocab_size, d],
                Init::Normal { std: EMBED_INIT_STD },
                false,
                rng,
            )),
            None => InputParams::Projection {
                weight: store.add("tf.in.weight", &[d, io.inputs], Init::Xavier, true, rng),
                bias: store.add("tf.in.bias", &[d], Init::Zeros, false, rng),
            },
        };

        let blocks = (0..cfg.num_layers)
            .map(|l| {
                let p = format!("tf.{}", l);
                let norm1 = add_norm(store, &format!("{}.norm1", p), d, rng);
                let wq = store.add(format!("{}.wq", p), &[qw, d], Init::Xavier, true, rng);
                let wk = store.add(format!("{}.wk", p), &[kvw, d], Init::Xavier, true, rng);
                let wv = store.add(format!("{}.wv", p), &[kvw, d], Init::Xavier, true, rng);
                let wo = store.add(format!("{}.wo", p), &[d, qw], Init::Xavier, true, rng);
                let norm2 = add_norm(store, &format!("{}.norm2", p), d, rng);
                let ffn = match cfg.ffn {
                    FeedForwardKind::Mlp => FfnParams::Mlp {
                        w1: store.add(format!("{}.ffn.w1", p), &[f, d], Init::Xavier, true, rng),
                        b1: store.add(format!("{}.ffn.b1", p), &[f], Init::Zeros, false, rng),
                        w2: store.add(format!("{}.ffn.w2", p), &[d, f], Init::Xavier, true, rng),
                        b2: store.add(format!("{}.ffn.b2", p), &[d], Init::Zeros, false, rng),
                    },
                    FeedForwardKind::SwiGlu => FfnParams::SwiGlu {
                        wg: store.add(format!("{}.ffn.wg", p), &[f, d], Init::Xavier, true, rng),
                        wu: store.add(format!("{}.ffn.wu", p), &[f, d], Init::Xavier, true, rng),
                        wd: store.add(format!("{}.ffn.wd", p), &[d, f], Init::Xavier, true, rng),
                    },
                };
                BlockParams { norm1, wq, wk, wv, wo, norm2, ffn }
            })
            .collect();
        let final_norm = add_norm(store, "tf.norm", d, rng);

        let (head, head_bias) = match (&cfg.token_lm, input) {
            (Some(lm), InputParams::Embedding(embed)) if lm.tie_embeddings => (embed, None),
            (Some(lm), _) => (
                store.add("tf.head.weight", &[lm.vocab_size, d], Init::Normal { std: EMBED_INIT_STD }, true, rng),
                None,
            ),
            (None, _) => (
                store.add("tf.head.weight", &[io.outputs, d], Init::Xavier, true, rng),
                Some(store.add("tf.head.bias", &[io.outputs], Init::Zeros, false, rng)),
            ),
        };

        Ok(Self {
            positions: PositionalCache::new(cfg, cfg.max_seq_len)?,
            cfg: cfg.clone(),
            io,
            layout,
            input,
            blocks,
            final_norm,
            head,
            head_bias,
            s: Scratch::default(),
        })
    }

    pub fn config(&self) -> &TransformerConfig {
        &self.cfg
    }

    pub fn vocab_size(&self) -> Option<usize> {
        self.cfg.token_lm.as_ref().map(|lm| lm.vocab_size)
    }

    pub fn num_layers(&self) -> usize {
        self.blocks.len()
    }

    pub fn kv_width(&self) -> usize {
        self.layout.kv_width()
    }

    fn head_rows(&self) -> usize {
        self.vocab_size().unwrap_or(self.io.outputs)
    }

    /// Number of rows in the last forward window.
    pub fn window_len(&self) -> usize {
        self.s.rows
    }

    fn prepare(&mut self, rows: usize) {
        let cfg = &self.cfg;
        let d = cfg.d_model;
        let f = cfg.ffn_hidden;
        let (qw, kvw) = (self.layout.q_width(), self.layout.kv_width());
        let work = self.layout.work_len(cfg.attention, rows, rows);
        let head = self.cfg.token_lm.as_ref().map(|lm| lm.vocab_size).unwrap_or(self.io.outputs);
        let s = &mut self.s;
        s.rows = rows;
        s.blocks.resize_with(self.blocks.len(), BlockCache::default);
        for c in s.blocks.iter_mut() {
            for buf in [&mut c.x_in, &mut c.n1, &mut c.x_mid, &mut c.n2] {
                ensure_len(buf, rows * d);
            }
            for buf in [&mut c.q, &mut c.att] {
                ensure_len(buf, rows * qw);
            }
            for buf in [&mut c.k, &mut c.v] {
                ensure_len(buf, rows * kvw);
            }
            for buf in [&mut c.h_pre, &mut c.u, &mut c.h_act] {
                ensure_len(buf, rows * f);
            }
            ensure_len(&mut c.work, work);
            c.stats1.resize(rows.max(c.stats1.len()), NormStats::default());
            c.stats2.resize(rows.max(c.stats2.len()), NormStats::default());
        }
        for buf in [&mut s.x_final, &mut s.nf, &mut s.d_nf, &mut s.dx, &mut s.dtmp, &mut s.dn] {
            ensure_len(buf, rows * d);
        }
        for buf in [&mut s.datt, &mut s.dq] {
            ensure_len(buf, rows * qw);
        }
        for buf in [&mut s.dk, &mut s.dv] {
            ensure_len(buf, rows * kvw);
        }
        for buf in [&mut s.dh, &mut s.dgate, &mut s.du] {
            ensure_len(buf, rows * f);
        }
        for buf in [&mut s.logits, &mut s.a_out, &mut s.dlogits] {
            ensure_len(buf, rows * head);
        }
        ensure_len(&mut s.attn_scratch, 2 * rows);
        s.stats_f.resize(rows.max(s.stats_f.len()), NormStats::default());
    }

    fn mask(&self) -> AttentionMask<'static> {
        AttentionMask { causal: self.cfg.causal, q_offset: 0, key_valid: None }
    }

    /// Forward one window through the final norm (and the head when the
    /// model is not a language model).
    pub fn forward(&mut self, store: &ParamStore, input: WindowInput<'_>) -> NetResult<()> {
        let rows = match input {
            WindowInput::Tokens(t) => t.len(),
            WindowInput::Rows(x) => x.len() / self.io.inputs.max(1),
        };
        if rows == 0 || rows > self.cfg.max_seq_len {
            return Err(NetError::InvalidArgument(format!(
                "window of {} rows outside 1..={}",
                rows, self.cfg.max_seq_len
            )));
        }
        self.prepare(rows);
        let cfg = &self.cfg;
        let d = cfg.d_model;
        let n = rows * d;
        let (qw, kvw) = (self.layout.q_width(), self.layout.kv_width());

        {
            let x0 = &mut self.s.blocks[0].x_in[..n];
            match (input, self.input) {
                (WindowInput::Tokens(tokens), InputParams::Embedding(embed)) => {
                    let vocab = self.cfg.token_lm.as_ref().map(|lm| lm.vocab_size).unwrap_or(0);
                    for (t, &tok) in tokens.iter().enumerate() {
                        if tok as usize >= vocab {
                            return Err(NetError::InvalidArgument(format!(
                                "token {} outside vocabulary of {}",
                                tok, vocab
                            )));
                        }
                        copy_row(store.weight(embed), tok as usize, d, &mut x0[t * d..(t + 1) * d]);
                    }
                    self.s.tokens.clear();
                    self.s.tokens.extend_from_slice(tokens);
                }
                (WindowInput::Rows(x), InputParams::Projection { weight, bias }) => {
                    let inputs = self.io.inputs;
                    matmul_rows(store.weight(weight), d, inputs, x, rows, Some(store.value(bias)), x0);
                    self.s.x_rows.clear();
                    self.s.x_rows.extend_from_slice(x);
                }
                _ => return Err(NetError::InvalidArgument("window input does not match the network input".into())),
            }
            for t in 0..rows {
                self.positions.add_input(&mut x0[t * d..(t + 1) * d], t);
            }
        }

        let mask = self.mask();
        for (l, b) in self.blocks.iter().enumerate() {
            let (cur, next) = self.s.blocks.split_at_mut(l + 1);
            let c = &mut cur[l];
            norm_rows_forward(
                cfg.norm,
                &c.x_in[..n],
                rows,
                d,
                store.value(b.norm1.scale),
                store.value(b.norm1.shift),
                cfg.norm_eps,
                &mut c.n1[..n],
                &mut c.stats1[..rows],
            );
            matmul_rows(store.weight(b.wq), qw, d, &c.n1[..n], rows, None, &mut c.q[..rows * qw]);
            matmul_rows(store.weight(b.wk), kvw, d, &c.n1[..n], rows, None, &mut c.k[..rows * kvw]);
            matmul_rows(store.weight(b.wv), kvw, d, &c.n1[..n], rows, None, &mut c.v[..rows * kvw]);
            self.positions.rotate(
                &mut c.q[..rows * qw],
                &mut c.k[..rows * kvw],
                rows,
                self.layout.num_heads,
                self.layout.num_kv_heads,
                0,
            );
            multi_head_forward(
                cfg.attention,
                &self.layout,
                rows,
                rows,
                &c.q[..rows * qw],
                &c.k[..rows * kvw],
                &c.v[..rows * kvw],
                &mask,
                &mut c.work,
                &mut c.att[..rows * qw],
            )?;
            matmul_rows(store.weight(b.wo), d, qw, &c.att[..rows * qw], rows, None, &mut c.x_mid[..n]);
            add_into(&mut c.x_mid[..n], &c.x_in[..n]);
            norm_rows_forward(
                cfg.norm,
                &c.x_mid[..n],
                rows,
                d,
                store.value(b.norm2.scale),
                store.value(b.norm2.shift),
                cfg.norm_eps,
                &mut c.n2[..n],
                &mut c.stats2[..rows],
            );
            let out = match next.first_mut() {
                Some(nb) => &mut nb.x_in[..n],
                None => &mut self.s.x_final[..n],
            };
            ffn_forward(store, &b.ffn, d, cfg.ffn_hidden, &c.n2[..n], rows, &mut c.h_pre, &mut c.u, &mut c.h_act, out);
            add_into(out, &c.x_mid[..n]);
        }

        norm_rows_forward(
            cfg.norm,
            &self.s.x_final[..n],
            rows,
            d,
            store.value(self.final_norm.scale),
            store.value(self.final_norm.shift),
            cfg.norm_eps,
            &mut self.s.nf[..n],
            &mut self.s.stats_f[..rows],
        );

        if cfg.token_lm.is_none() {
            let o = self.io.outputs;
            let bias = self.head_bias.map(|b| store.value(b));
            matmul_rows(store.weight(self.head), o, d, &self.s.nf[..n], rows, bias, &mut self.s.logits[..rows * o]);
            cfg.output_activation.forward(&self.s.logits[..rows * o], &mut self.s.a_out[..rows * o]);
        }
        Ok(())
    }

    /// `(pre-activation, activation)` rows of a non-LM forward.
    pub fn output(&self) -> (&[f32], &[f32]) {
        let n = self.s.rows * self.io.outputs;
        (&self.s.logits[..n], &self.s.a_out[..n])
    }

    /// Full-vocabulary logits `[T, V]` of the last token window.
    pub fn logits(&mut self, store: &ParamStore) -> &[f32] {
        let rows = self.s.rows;
        let d = self.cfg.d_model;
        let v = self.head_rows();
        matmul_rows(store.weight(self.head), v, d, &self.s.nf[..rows * d], rows, None, &mut self.s.logits[..rows * v]);
        &self.s.logits[..rows * v]
    }

    /// Next-token loss of the last token window against `targets`.
    ///
    /// Every position's loss is added to `metrics`. With `train` set, the
    /// head gradient (times `grad_scale`) is accumulated and the gradient of
    /// the final-norm output is left for `backward`. Evaluation always uses
    /// the full softmax; sampled softmax only replaces it during training.
    pub fn lm_loss(
        &mut self,
        store: &ParamStore,
        targets: &[u32],
        rng: &mut StdRng,
        train: Option<(&mut Gradients, f32)>,
        metrics: &mut MetricsAccumulator,
    ) -> NetResult<f64> {
        let rows = self.s.rows;
        let d = self.cfg.d_model;
        let Some(lm) = self.cfg.token_lm.clone() else {
            return Err(NetError::InvalidState("network is not a token language model".into()));
        };
        let vocab = lm.vocab_size;
        if targets.len() != rows {
            return Err(NetError::InvalidArgument(format!("{} targets for a window of {}", targets.len(), rows)));
        }
        if let Some(&bad) = targets.iter().find(|&&t| t as usize >= vocab) {
            return Err(NetError::InvalidArgument(format!("token {} outside vocabulary of {}", bad, vocab)));
        }

        let mut total = 0.0f64;
        match (lm.loss, train) {
            (LmLoss::Sampled { negatives }, Some((grads, grad_scale))) => {
                let k = negatives + 1;
                let s = &mut self.s;
                s.cand.resize(k, 0);
                ensure_len(&mut s.cand_logits, k);
                ensure_len(&mut s.cand_grads, k);
                ensure_len(&mut s.cand_rows, k * d);
                s.d_nf[..rows * d].fill(0.0);
                let head = store.weight(self.head);
                for t in 0..rows {
                    let target = targets[t];
                    s.cand[0] = target;
                    for j in 1..k {
                        // uniform over the vocabulary minus the target
                        let r = rng.gen_range(0..vocab as u32 - 1);
                        s.cand[j] = if r >= target { r + 1 } else { r };
                    }
                    let h = &s.nf[t * d..(t + 1) * d];
                    for j in 0..k {
                        let row = &mut s.cand_rows[j * d..(j + 1) * d];
                        copy_row(head, s.cand[j] as usize, d, row);
                        s.cand_logits[j] = dot(row, h);
                    }
                    let loss = sampled_cross_entropy(&s.cand_logits[..k], &mut s.cand_grads[..k]);
                    metrics.add_loss(loss);
                    total += loss;
                    let dw = grads.get_mut(self.head);
                    for j in 0..k {
                        let g = s.cand_grads[j] * grad_scale;
                        let c = s.cand[j] as usize;
                        axpy(g, h, &mut dw[c * d..(c + 1) * d]);
                        axpy(g, &s.cand_rows[j * d..(j + 1) * d], &mut s.d_nf[t * d..(t + 1) * d]);
                    }
                }
            }
            (_, train) => {
                self.logits(store);
                let s = &mut self.s;
                for t in 0..rows {
                    let range = t * vocab..(t + 1) * vocab;
                    let target = targets[t] as usize;
                    let (loss, predicted) = token_cross_entropy(&s.logits[range.clone()], target, &mut s.dlogits[range]);
                    metrics.add_loss(loss);
                    metrics.update_token(loss, predicted, target);
                    total += loss;
                }
                if let Some((grads, grad_scale)) = train {
                    let dl = &mut s.dlogits[..rows * vocab];
                    for g in dl.iter_mut() {
                        *g *= grad_scale;
                    }
                    outer_acc_rows(grads.get_mut(self.head), vocab, d, dl, &s.nf[..rows * d], rows);
                    s.d_nf[..rows * d].fill(0.0);
                    matmul_rows_transposed_acc(store.weight(self.head), vocab, d, dl, rows, &mut s.d_nf[..rows * d]);
                }
            }
        }
        Ok(total)
    }

    /// Head backward of a non-LM window from `dz: [T, outputs]`.
    pub fn head_backward(&mut self, store: &ParamStore, dz: &[f32], grads: &mut Gradients) {
        let rows = self.s.rows;
        let d = self.cfg.d_model;
        let o = self.io.outputs;
        outer_acc_rows(grads.get_mut(self.head), o, d, dz, &self.s.nf[..rows * d], rows);
        if let Some(b) = self.head_bias {
            add_rows(grads.get_mut(b), dz, rows);
        }
        let d_nf = &mut self.s.d_nf[..rows * d];
        d_nf.fill(0.0);
        matmul_rows_transposed_acc(store.weight(self.head), o, d, dz, rows, d_nf);
    }

    /// Backward through the final norm, every block and the input layer,
    /// starting from the head's gradient of the final-norm output.
    pub fn backward(&mut self, store: &ParamStore, grads: &mut Gradients) -> NetResult<()> {
        let cfg = &self.cfg;
        let rows = self.s.rows;
        let d = cfg.d_model;
        let f = cfg.ffn_hidden;
        let n = rows * d;
        let (qw, kvw) = (self.layout.q_width(), self.layout.kv_width());
        let mask = AttentionMask { causal: cfg.causal, q_offset: 0, key_valid: None };
        let s = &mut self.s;

        {
            let (dscale, dshift) = grads.pair_mut(self.final_norm.scale, self.final_norm.shift);
            norm_rows_backward(
                cfg.norm,
                &s.x_final[..n],
                rows,
                d,
                store.value(self.final_norm.scale),
                &s.stats_f[..rows],
                &s.d_nf[..n],
                &mut s.dx[..n],
                dscale,
                dshift,
            );
        }

        for (l, b) in self.blocks.iter().enumerate().rev() {
            let c = &s.blocks[l];

            // feed-forward: dx is the gradient of the block output
            ffn_backward(
                store,
                &b.ffn,
                d,
                f,
                rows,
                &c.n2[..n],
                &c.h_pre,
                &c.u,
                &c.h_act,
                &s.dx[..n],
                &mut s.dh,
                &mut s.dgate,
                &mut s.du,
                &mut s.dn[..n],
                grads,
            );
            {
                let (dscale, dshift) = grads.pair_mut(b.norm2.scale, b.norm2.shift);
                norm_rows_backward(
                    cfg.norm,
                    &c.x_mid[..n],
                    rows,
                    d,
                    store.value(b.norm2.scale),
                    &c.stats2[..rows],
                    &s.dn[..n],
                    &mut s.dtmp[..n],
                    dscale,
                    dshift,
                );
            }
            add_into(&mut s.dx[..n], &s.dtmp[..n]);

            // attention: dx is now the gradient of x_mid
            outer_acc_rows(grads.get_mut(b.wo), d, qw, &s.dx[..n], &c.att[..rows * qw], rows);
            s.datt[..rows * qw].fill(0.0);
            matmul_rows_transposed_acc(store.weight(b.wo), d, qw, &s.dx[..n], rows, &mut s.datt[..rows * qw]);
            s.dq[..rows * qw].fill(0.0);
            s.dk[..rows * kvw].fill(0.0);
            s.dv[..rows * kvw].fill(0.0);
            let probs = (cfg.attention == AttentionStrategy::Materialized).then(|| &c.work[..]);
            multi_head_backward(
                &self.layout,
                rows,
                rows,
                &c.q[..rows * qw],
                &c.k[..rows * kvw],
                &c.v[..rows * kvw],
                &mask,
                probs,
                &s.datt[..rows * qw],
                &mut s.dq[..rows * qw],
                &mut s.dk[..rows * kvw],
                &mut s.dv[..rows * kvw],
                &mut s.attn_scratch,
            )?;
            self.positions.rotate_inverse(
                &mut s.dq[..rows * qw],
                &mut s.dk[..rows * kvw],
                rows,
                self.layout.num_heads,
                self.layout.num_kv_heads,
                0,
            );

            let dn1 = &mut s.dn[..n];
            dn1.fill(0.0);
            for (w, width, dproj) in [(b.wq, qw, &s.dq[..rows * qw]), (b.wk, kvw, &s.dk[..rows * kvw]), (b.wv, kvw, &s.dv[..rows * kvw])] {
                outer_acc_rows(grads.get_mut(w), width, d, dproj, &c.n1[..n], rows);
                matmul_rows_transposed_acc(store.weight(w), width, d, dproj, rows, dn1);
            }
            {
                let (dscale, dshift) = grads.pair_mut(b.norm1.scale, b.norm1.shift);
                norm_rows_backward(
                    cfg.norm,
                    &c.x_in[..n],
                    rows,
                    d,
                    store.value(b.norm1.scale),
                    &c.stats1[..rows],
                    &s.dn[..n],
                    &mut s.dtmp[..n],
                    dscale,
                    dshift,
                );
            }
            add_into(&mut s.dx[..n], &s.dtmp[..n]);
        }

        // dx is the gradient of the first block input
        match self.input {
            InputParams::Embedding(embed) => {
                let de = grads.get_mut(embed);
                for (t, &tok) in s.tokens.iter().enumerate().take(rows) {
                    let tok = tok as usize;
                    add_into(&mut de[tok * d..(tok + 1) * d], &s.dx[t * d..(t + 1) * d]);
                }
            }
            InputParams::Projection { weight, bias } => {
                let inputs = self.io.inputs;
                outer_acc_rows(grads.get_mut(weight), d, inputs, &s.dx[..n], &s.x_rows[..rows * inputs], rows);
                add_rows(grads.get_mut(bias), &s.dx[..n], rows);
            }
        }
        Ok(())
    }
}

/// Feed-forward sublayer over `rows` rows of `x: [rows, d]` into `out`.
#[allow(clippy::too_many_arguments)]
pub(crate) fn ffn_forward(
    store: &ParamStore,
    ffn: &FfnParams,
    d: usize,
    f: usize,
    x: &[f32],
    rows: usize,
    h_pre: &mut [f32],
    u: &mut [f32],
    h_act: &mut [f32],
    out: &mut [f32],
) {
    let hn = rows * f;
    match *ffn {
        FfnParams::Mlp { w1, b1, w2, b2 } => {
            matmul_rows(store.weight(w1), f, d, x, rows, Some(store.value(b1)), &mut h_pre[..hn]);
            Activation::Gelu.forward(&h_pre[..hn], &mut h_act[..hn]);
            matmul_rows(store.weight(w2), d, f, &h_act[..hn], rows, Some(store.value(b2)), out);
        }
        FfnParams::SwiGlu { wg, wu, wd } => {
            matmul_rows(store.weight(wg), f, d, x, rows, None, &mut h_pre[..hn]);
            matmul_rows(store.weight(wu), f, d, x, rows, None, &mut u[..hn]);
            for i in 0..hn {
                h_act[i] = Activation::Silu.apply(h_pre[i]) * u[i];
            }
            matmul_rows(store.weight(wd), d, f, &h_act[..hn], rows, None, out);
        }
    }
}

/// Backward of `ffn_forward`. Writes `dx` and accumulates parameter gradients.
#[allow(clippy::too_many_arguments)]
fn ffn_backward(
    store: &ParamStore,
    ffn: &FfnParams,
    d: usize,
    f: usize,
    rows: usize,
    x: &[f32],
    h_pre: &[f32],
    u: &[f32],
    h_act: &[f32],
    dy: &[f32],
    dh: &mut [f32],
    dgate: &mut [f32],
    du: &mut [f32],
    dx: &mut [f32],
    grads: &mut Gradients,
) {
    let hn = rows * f;
    let (down, down_bias) = match *ffn {
        FfnParams::Mlp { w2, b2, .. } => (w2, Some(b2)),
        FfnParams::SwiGlu { wd, .. } => (wd, None),
    };
    outer_acc_rows(grads.get_mut(down), d, f, dy, &h_act[..hn], rows);
    if let Some(b) = down_bias {
        add_rows(grads.get_mut(b), dy, rows);
    }
    let dh = &mut dh[..hn];
    dh.fill(0.0);
    matmul_rows_transposed_acc(store.weight(down), d, f, dy, rows, dh);
    dx.fill(0.0);

    match *ffn {
        FfnParams::Mlp { w1, b1, .. } => {
            let dpre = &mut dgate[..hn];
            Activation::Gelu.backward(&h_pre[..hn], &h_act[..hn], dh, dpre);
            outer_acc_rows(grads.get_mut(w1), f, d, dpre, x, rows);
            add_rows(grads.get_mut(b1), dpre, rows);
            matmul_rows_transposed_acc(store.weight(w1), f, d, dpre, rows, dx);
        }
        FfnParams::SwiGlu { wg, wu, .. } => {
            let dg = &mut dgate[..hn];
            let du = &mut du[..hn];
            for i in 0..hn {
                let g = h_pre[i];
                let sg = Activation::Silu.apply(g);
                dg[i] = dh[i] * u[i] * Activation::Silu.derivative(g, sg);
                du[i] = dh[i] * sg;
            }
            outer_acc_rows(grads.get_mut(wg), f, d, dg, x, rows);
            outer_acc_rows(grads.get_mut(wu), f, d, du, x, rows);
            matmul_rows_transposed_acc(store.weight(wg), f, d, dg, rows, dx);
            matmul_rows_transposed_acc(store.weight(wu), f, d, du, rows, dx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::config::{LossKind, PositionalKind, TokenLmConfig};
    use rand::SeedableRng;
    use rustml_kernels::NormKind;

    fn small_lm() -> TransformerConfig {
        TransformerConfig {
            d_model: 8,
            num_heads: 2,
            num_kv_heads: 1,
            num_layers: 2,
            ffn_hidden: 16,
            max_seq_len: 8,
            token_lm: Some(TokenLmConfig::new(6)),
            ..Default::default()
        }
    }

    fn assert_grad_close(name: &str, i: usize, ana: f32, num: f64) {
        let tol = 3e-3 + 2e-2 * num.abs();
        assert!((ana as f64 - num).abs() < tol, "{}[{}]: analytic {} vs numeric {}", name, i, ana, num);
    }

    fn check_lm(cfg: TransformerConfig, names: &[&str]) {
        let mut rng = StdRng::seed_from_u64(5);
        let mut store = ParamStore::new();
        let mut model = TransformerModel::build(&cfg, IoShape::new(1, 0), &mut store, &mut rng).unwrap();
        let tokens = [1u32, 4, 2, 3];
        let targets = [4u32, 2, 3, 0];

        let mut grads = Gradients::for_store(&store);
        let mut metrics = MetricsAccumulator::new(LossKind::CrossEntropy, 0);
        model.forward(&store, WindowInput::Tokens(&tokens)).unwrap();
        model.lm_loss(&store, &targets, &mut rng, Some((&mut grads, 1.0)), &mut metrics).unwrap();
        model.backward(&store, &mut grads).unwrap();

        let mut loss_at = |model: &mut TransformerModel, store: &ParamStore| {
            let mut m = MetricsAccumulator::new(LossKind::CrossEntropy, 0);
            model.forward(store, WindowInput::Tokens(&tokens)).unwrap();
            model.lm_loss(store, &targets, &mut rng, None, &mut m).unwrap()
        };
        let eps = 5e-3f32;
        for name in names {
            let id = store.find(name).unwrap_or_else(|| panic!("missing {}", name));
            for i in (0..store.value(id).len()).step_by(5) {
                let orig = store.value(id)[i];
                store.value_mut(id)[i] = orig + eps;
                let lp = loss_at(&mut model, &store);
                store.value_mut(id)[i] = orig - eps;
                let lm = loss_at(&mut model, &store);
                store.value_mut(id)[i] = orig;
                assert_grad_close(name, i, grads.get(id)[i], (lp - lm) / (2.0 * eps as f64));
            }
        }
    }

    #[test]
    fn test_lm_gradients_rope_rms_swiglu() {
        let cfg = TransformerConfig {
            positional: PositionalKind::Rope,
            norm: NormKind::RmsNorm,
            ffn: FeedForwardKind::SwiGlu,
            ..small_lm()
        };
        check_lm(cfg, &["tf.embed", "tf.0.wq", "tf.0.wk", "tf.1.wv", "tf.0.wo", "tf.0.norm1.scale", "tf.1.ffn.wg", "tf.0.ffn.wu", "tf.norm.scale"]);
    }

    #[test]
    fn test_lm_gradients_sinusoidal_untied_mlp() {
        let mut cfg = small_lm();
        cfg.attention = AttentionStrategy::Flash;
        cfg.token_lm = Some(TokenLmConfig::new(6).with_tied_embeddings(false));
        check_lm(cfg, &["tf.embed", "tf.head.weight", "tf.1.wk", "tf.0.ffn.w1", "tf.0.ffn.b1", "tf.1.ffn.w2", "tf.1.norm2.shift"]);
    }

    #[test]
    fn test_rows_head_gradients() {
        let cfg = TransformerConfig {
            d_model: 4,
            num_heads: 2,
            num_kv_heads: 2,
            num_layers: 1,
            ffn_hidden: 8,
            max_seq_len: 4,
            causal: false,
            ..Default::default()
        };
        let io = IoShape::new(3, 2);
        let mut rng = StdRng::seed_from_u64(8);
        let mut store = ParamStore::new();
        let mut model = TransformerModel::build(&cfg, io, &mut store, &mut rng).unwrap();
        let x = [0.1f32, -0.5, 0.3, 0.7, 0.2, -0.1, -0.4, 0.6, 0.0];

        let loss_at = |model: &mut TransformerModel, store: &ParamStore| {
            model.forward(store, WindowInput::Rows(&x)).unwrap();
            model.output().1.iter().map(|&a| 0.5 * (a as f64).powi(2)).sum::<f64>()
        };
        loss_at(&mut model, &store);
        let dz = model.output().1.to_vec();
        let mut grads = Gradients::for_store(&store);
        model.head_backward(&store, &dz, &mut grads);
        model.backward(&store, &mut grads).unwrap();

        let eps = 5e-3f32;
        for name in ["tf.in.weight", "tf.in.bias", "tf.0.wq", "tf.head.weight", "tf.head.bias"] {
            let id = store.find(name).unwrap();
            for i in 0..store.value(id).len() {
                let orig = store.value(id)[i];
                store.value_mut(id)[i] = orig + eps;
                let lp = loss_at(&mut model, &store);
                store.value_mut(id)[i] = orig - eps;
                let lm = loss_at(&mut model, &store);
                store.value_mut(id)[i] = orig;
                assert_grad_close(name, i, grads.get(id)[i], (lp - lm) / (2.0 * eps as f64));
            }
        }
    }
}
