//! The network: owned parameters, the run guard and the training loop.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard, TryLockError};
use std::time::Instant;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rustml_kernels::first_non_finite_sampled;

use crate::api::config::{ArchitectureConfig, FiniteCheck, TrainingConfig};
use crate::api::error::{NetError, NetResult};
use crate::api::traits::{Dataset, RunCallbacks};
use crate::api::types::{EpochMetrics, IoShape, RunMode, RunOutcome, RunSummary, Split};
use crate::core::data::spans::SequenceSpans;
use crate::core::loss::output_loss;
use crate::core::metrics::MetricsAccumulator;
use crate::core::model::kv::{DecodeScratch, KvBuffers, PositionalCache};
use crate::core::model::transformer::{TransformerModel, WindowInput};
use crate::core::model::{Model, ModelKind};
use crate::core::optim::{clip_gradients, LossScaler, Optimizer};
use crate::core::params::{Gradients, ParamStore};

/// Mutable state behind the run guard.
pub(crate) struct NetworkState {
    pub(crate) training: TrainingConfig,
    pub(crate) model: Option<Model>,
    pub(crate) rng: StdRng,
    /// Completed training epochs (global, continues across runs and resumes).
    pub(crate) epoch: usize,
    pub(crate) optimizer: Optimizer,
    pub(crate) scaler: LossScaler,
    grads: Gradients,
    dz: Vec<f32>,
    window: Vec<f32>,
    targets: Vec<f32>,
    tokens: Vec<u32>,
}

impl NetworkState {
    pub(crate) fn new(training: TrainingConfig) -> Self {
        Self {
            rng: StdRng::seed_from_u64(training.seed),
            optimizer: Optimizer::new(training.optimizer),
            scaler: LossScaler::new(training.mixed_precision),
            training,
            model: None,
            epoch: 0,
            grads: Gradients::default(),
            dz: Vec::new(),
            window: Vec::new(),
            targets: Vec::new(),
            tokens: Vec::new(),
        }
    }

    /// Builds the model for `io` on first use; afterwards the shape must match.
    pub(crate) fn ensure_model(&mut self, arch: &ArchitectureConfig, io: IoShape) -> NetResult<()> {
        match &self.model {
            Some(m) if m.io == io => Ok(()),
            Some(m) => Err(NetError::BuildFailed(format!(
                "network was built for {} inputs / {} outputs, got {} / {}",
                m.io.inputs, m.io.outputs, io.inputs, io.outputs
            ))),
            None => {
                let model = Model::build(arch, io, &mut self.rng)?;
                self.install(model);
                Ok(())
            }
        }
    }

    /// Takes ownership of a built or loaded model.
    pub(crate) fn install(&mut self, mut model: Model) {
        model.store.set_shadow_dtype(self.training.mixed_precision.mode);
        self.grads = Gradients::for_store(&model.store);
        self.model = Some(model);
    }
}

/// A trainable network.
///
/// `run` takes the state exclusively and fails immediately with
/// `InvalidState` when another run (or a serving read) holds it; nothing in
/// the network blocks.
pub struct Network {
    arch: ArchitectureConfig,
    state: RwLock<NetworkState>,
    epoch: AtomicUsize,
}

impl std::fmt::Debug for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Network")
            .field("architecture", &self.arch.kind_name())
            .field("epoch", &self.epoch())
            .finish()
    }
}

impl Network {
    pub fn new(arch: ArchitectureConfig, training: TrainingConfig) -> NetResult<Self> {
        arch.validate()?;
        training.validate_against(&arch)?;
        Ok(Self { arch, state: RwLock::new(NetworkState::new(training)), epoch: AtomicUsize::new(0) })
    }

    pub fn architecture(&self) -> &ArchitectureConfig {
        &self.arch
    }

    /// Completed training epochs.
    pub fn epoch(&self) -> usize {
        self.epoch.load(Ordering::Acquire)
    }

    pub(crate) fn write_state(&self) -> NetResult<RwLockWriteGuard<'_, NetworkState>> {
        match self.state.try_write() {
            Ok(g) => Ok(g),
            Err(TryLockError::WouldBlock) => Err(NetError::InvalidState("network is busy (a run or reader is active)".into())),
            Err(TryLockError::Poisoned(_)) => Err(NetError::Internal("network state poisoned by an earlier panic".into())),
        }
    }

    pub(crate) fn read_state(&self) -> NetResult<RwLockReadGuard<'_, NetworkState>> {
        match self.state.try_read() {
            Ok(g) => Ok(g),
            Err(TryLockError::WouldBlock) => Err(NetError::InvalidState("network is running".into())),
            Err(TryLockError::Poisoned(_)) => Err(NetError::Internal("network state poisoned by an earlier panic".into())),
        }
    }

    pub(crate) fn sync_epoch(&self, epoch: usize) {
        self.epoch.store(epoch, Ordering::Release);
    }

    pub fn training_config(&self) -> NetResult<TrainingConfig> {
        Ok(self.read_state()?.training.clone())
    }

    /// Replaces the hyperparameters. Weights, optimizer moments and the epoch
    /// counter are kept.
    pub fn set_training_config(&self, training: TrainingConfig) -> NetResult<()> {
        training.validate_against(&self.arch)?;
        let mut state = self.write_state()?;
        state.optimizer.set_kind(training.optimizer);
        if state.training.mixed_precision != training.mixed_precision {
            state.scaler = LossScaler::new(training.mixed_precision);
            if let Some(model) = state.model.as_mut() {
                model.store.set_shadow_dtype(training.mixed_precision.mode);
            }
        }
        state.training = training;
        Ok(())
    }

    /// Input/output shape once the parameters exist.
    pub fn io_shape(&self) -> NetResult<Option<IoShape>> {
        Ok(self.read_state()?.model.as_ref().map(|m| m.io))
    }

    /// Creates the parameters for `io` without a dataset.
    pub fn build(&self, io: IoShape) -> NetResult<()> {
        self.write_state()?.ensure_model(&self.arch, io)
    }

    /// Drops every tensor and resets optimizer, loss scale, RNG and epoch.
    pub fn reset_tensors(&self) -> NetResult<()> {
        let mut state = self.write_state()?;
        let training = state.training.clone();
        *state = NetworkState::new(training);
        self.sync_epoch(0);
        Ok(())
    }

    /// Names and element counts of every parameter tensor.
    pub fn tensor_names(&self) -> NetResult<Vec<(String, usize)>> {
        let state = self.read_state()?;
        Ok(state
            .model
            .as_ref()
            .map(|m| m.store.iter().map(|(_, t)| (t.name.clone(), t.numel())).collect())
            .unwrap_or_default())
    }

    /// Shared access for incremental decoding; fails while a run is active.
    pub fn read(&self) -> NetResult<NetworkReadGuard<'_>> {
        Ok(NetworkReadGuard { guard: self.read_state()? })
    }

    /// Forward one feature row. Sequence models treat it as a one-step sequence.
    pub fn predict(&self, features: &[f32]) -> NetResult<Vec<f32>> {
        let mut state = self.write_state()?;
        let model = state.model.as_mut().ok_or_else(|| NetError::InvalidState("network has not been built".into()))?;
        if features.len() != model.io.inputs {
            return Err(NetError::InvalidArgument(format!(
                "expected {} features, got {}",
                model.io.inputs,
                features.len()
            )));
        }
        let Model { store, kind, .. } = model;
        match kind {
            ModelKind::Dff(dff) => {
                dff.forward(store, features);
                Ok(dff.output().1.to_vec())
            }
            ModelKind::Recurrent(rec) => {
                rec.reset_state();
                rec.forward_window(store, features, 1);
                let out = rec.output().1.to_vec();
                rec.reset_state();
                Ok(out)
            }
            ModelKind::Transformer(tf) => {
                if tf.vocab_size().is_some() {
                    return Err(NetError::InvalidArgument("token language models predict with forward_tokens".into()));
                }
                tf.forward(store, WindowInput::Rows(features))?;
                Ok(tf.output().1.to_vec())
            }
        }
    }

    /// Uncached forward of a token sequence; logits `[tokens.len(), vocab]`.
    pub fn forward_tokens(&self, tokens: &[u32]) -> NetResult<Vec<f32>> {
        let mut state = self.write_state()?;
        let model = state.model.as_mut().ok_or_else(|| NetError::InvalidState("network has not been built".into()))?;
        let Model { store, kind, .. } = model;
        match kind {
            ModelKind::Transformer(tf) if tf.vocab_size().is_some() => {
                tf.forward(store, WindowInput::Tokens(tokens))?;
                Ok(tf.logits(store).to_vec())
            }
            _ => Err(NetError::InvalidArgument("forward_tokens needs a token language model".into())),
        }
    }

    /// Trains or evaluates on `dataset`.
    ///
    /// `on_run_end` fires exactly once, after the guard is released, whatever
    /// the outcome; errors are returned after it fires.
    pub fn run(&self, dataset: &dyn Dataset, mode: RunMode, callbacks: &mut dyn RunCallbacks) -> NetResult<RunSummary> {
        let mut state = self.write_state()?;
        callbacks.on_run_start(self, mode);
        let mut history = Vec::new();
        let result = self.run_locked(&mut state, dataset, mode, callbacks, &mut history);
        let epoch = state.epoch;
        drop(state);
        self.sync_epoch(epoch);

        let outcome = match &result {
            Ok(outcome) => outcome.clone(),
            Err(e) => {
                log::warn!("Run failed: {}", e);
                RunOutcome::Failed { code: e.code(), message: e.to_string() }
            }
        };
        callbacks.on_run_end(self, mode, &outcome);
        result.map(|outcome| RunSummary { mode, outcome, history })
    }

    fn run_locked(
        &self,
        state: &mut NetworkState,
        dataset: &dyn Dataset,
        mode: RunMode,
        callbacks: &mut dyn RunCallbacks,
        history: &mut Vec<EpochMetrics>,
    ) -> NetResult<RunOutcome> {
        let split = mode.split();
        let rows = dataset.len(split);
        if rows == 0 {
            return Err(NetError::EmptyData(format!("{:?} split has no rows", split)));
        }
        dataset.validate_shape(split)?;
        state.ensure_model(&self.arch, IoShape::new(dataset.feature_len(), dataset.output_len()))?;

        let spans = match dataset.sequence_spans(split) {
            Some(s) => s.clone(),
            None => SequenceSpans::whole(rows),
        };
        if spans.total() != rows {
            return Err(NetError::InvalidArgument(format!(
                "sequence spans cover {} rows but the split has {}",
                spans.total(),
                rows
            )));
        }
        let mut units = match &state.model {
            Some(model) => plan_units(&model.kind, &spans, rows),
            None => return Err(NetError::Internal("model missing after build".into())),
        };
        if units.is_empty() {
            return Err(NetError::EmptyData("no sequence has enough rows for a training window".into()));
        }

        let train = mode.updates_parameters();
        let termination = state.training.termination;
        let max_epochs = if train { termination.max_epochs } else { Some(1) };
        let started = Instant::now();
        let mut passes = 0usize;

        loop {
            if max_epochs.is_some_and(|m| passes >= m) {
                return Ok(RunOutcome::Completed);
            }
            if train {
                if let Some(limit) = termination.max_duration {
                    if started.elapsed() >= limit {
                        log::info!("Time limit of {:?} reached after {} epochs", limit, passes);
                        return Ok(RunOutcome::TimeLimit);
                    }
                }
            }

            let metrics = self.epoch_pass(state, dataset, split, mode, &mut units)?;
            passes += 1;
            if train {
                self.sync_epoch(state.epoch);
            }
            history.push(metrics.clone());
            let stop = callbacks.on_epoch_end(self, &metrics);

            if train {
                if let (Some(target), Some(acc)) = (termination.target_accuracy, metrics.accuracy) {
                    if acc >= target {
                        log::info!("Target accuracy {:.4} reached at epoch {}", target, metrics.epoch);
                        return Ok(RunOutcome::TargetReached);
                    }
                }
            }
            if stop {
                return Ok(RunOutcome::EarlyStopped);
            }
        }
    }

    fn epoch_pass(
        &self,
        state: &mut NetworkState,
        dataset: &dyn Dataset,
        split: Split,
        mode: RunMode,
        units: &mut [(usize, usize)],
    ) -> NetResult<EpochMetrics> {
        let t0 = Instant::now();
        let train = mode.updates_parameters();
        let loss_kind = state.training.resolved_loss(&self.arch);
        let output_activation = self.arch.output_activation();
        let factor = state.training.schedule.factor(state.epoch);
        let lr = state.training.learning_rate * factor;
        let batch_size = state.training.batch_size;
        let finite = state.training.finite_check;
        if train {
            log::debug!("Epoch {}: lr={:.6} (factor {:.4})", state.epoch + 1, lr, factor);
            if state.training.shuffle {
                units.shuffle(&mut state.rng);
            }
        }

        let NetworkState { training, model, rng, optimizer, scaler, grads, dz, window, targets, tokens, .. } = &mut *state;
        let model = model.as_mut().ok_or_else(|| NetError::Internal("model missing".into()))?;
        let outputs = model.io.outputs;
        let inputs = model.io.inputs;
        let Model { store, kind, .. } = model;
        grads.match_store(store);
        grads.zero();

        let mut acc = MetricsAccumulator::new(loss_kind, outputs);
        let mut boundary = Boundary {
            training,
            optimizer,
            scaler,
            lr,
            pending: 0,
            batch_size,
            skipped: 0,
        };
        for &(start, len) in units.iter() {
            let grad_scale = boundary.scaler.scale();
            match &mut *kind {
                ModelKind::Dff(dff) => {
                    let x = dataset.features(split, start);
                    check_finite(finite, &x, || format!("input row {}", start))?;
                    let y = dataset.expected(split, start);
                    dff.forward(store, &x);
                    let (z, a) = dff.output();
                    check_finite(finite, a, || format!("output of row {}", start))?;
                    dz.resize(outputs, 0.0);
                    let loss = output_loss(loss_kind, output_activation, z, a, &y, dz);
                    check_loss(finite, loss, start)?;
                    acc.add_loss(loss);
                    acc.update(a, &y);
                    if train {
                        scale_in_place(dz, grad_scale);
                        dff.backward(store, dz, grads);
                        boundary.sample_done(store, grads)?;
                    }
                }
                ModelKind::Recurrent(rec) => {
                    rec.reset_state();
                    let win = match rec_window(&self.arch) {
                        0 => len,
                        w => w,
                    };
                    let end = start + len;
                    let mut ws = start;
                    while ws < end {
                        let steps = win.min(end - ws);
                        gather_rows(dataset, split, ws, steps, inputs, outputs, window, targets, finite)?;
                        rec.forward_window(store, &window[..steps * inputs], steps);
                        let (z, a) = rec.output();
                        check_finite(finite, a, || format!("outputs of rows {}..{}", ws, ws + steps))?;
                        dz.resize(steps * outputs, 0.0);
                        for t in 0..steps {
                            let r = t * outputs..(t + 1) * outputs;
                            let loss = output_loss(loss_kind, output_activation, &z[r.clone()], &a[r.clone()], &targets[r.clone()], &mut dz[r.clone()]);
                            check_loss(finite, loss, ws + t)?;
                            acc.add_loss(loss);
                            acc.update(&a[r.clone()], &targets[r]);
                        }
                        if train {
                            scale_in_place(dz, grad_scale / steps as f32);
                            rec.backward_window(store, dz, grads);
                            boundary.sample_done(store, grads)?;
                        }
                        ws += steps;
                    }
                }
                ModelKind::Transformer(tf) if tf.vocab_size().is_some() => {
                    tokens.clear();
                    for i in start..start + len {
                        tokens.push(dataset.token(split, i)?);
                    }
                    let steps = len - 1;
                    tf.forward(store, WindowInput::Tokens(&tokens[..steps]))?;
                    let train_grads = if train { Some((&mut *grads, grad_scale / steps as f32)) } else { None };
                    let loss = tf.lm_loss(store, &tokens[1..], rng, train_grads, &mut acc)?;
                    check_loss(finite, loss, start)?;
                    if train {
                        tf.backward(store, grads)?;
                        boundary.sample_done(store, grads)?;
                    }
                }
                ModelKind::Transformer(tf) => {
                    gather_rows(dataset, split, start, len, inputs, outputs, window, targets, finite)?;
                    tf.forward(store, WindowInput::Rows(&window[..len * inputs]))?;
                    let (z, a) = tf.output();
                    check_finite(finite, a, || format!("outputs of rows {}..{}", start, start + len))?;
                    dz.resize(len * outputs, 0.0);
                    for t in 0..len {
                        let r = t * outputs..(t + 1) * outputs;
                        let loss = output_loss(loss_kind, output_activation, &z[r.clone()], &a[r.clone()], &targets[r.clone()], &mut dz[r.clone()]);
                        check_loss(finite, loss, start + t)?;
                        acc.add_loss(loss);
                        acc.update(&a[r.clone()], &targets[r]);
                    }
                    if train {
                        scale_in_place(dz, grad_scale / len as f32);
                        tf.head_backward(store, dz, grads);
                        tf.backward(store, grads)?;
                        boundary.sample_done(store, grads)?;
                    }
                }
            }
        }
        if train {
            boundary.flush(store, grads)?;
        }
        let skipped = boundary.skipped;

        if train {
            state.epoch += 1;
        }
        let token_lm = self.arch.token_lm().is_some();
        Ok(EpochMetrics {
            epoch: state.epoch,
            mode,
            loss: acc.mean_loss(),
            samples: acc.samples(),
            accuracy: acc.accuracy(),
            regression: if token_lm { None } else { acc.regression() },
            classification: acc.classification(),
            perplexity: acc.token_metrics().map(|(_, ppl)| ppl),
            learning_rate: lr,
            loss_scale: state.scaler.enabled().then(|| state.scaler.scale()),
            skipped_steps: skipped,
            elapsed: t0.elapsed(),
        })
    }
}

/// Minibatch accounting: averages, unscales, clips and applies the update
/// once `batch_size` samples have accumulated.
struct Boundary<'a> {
    training: &'a TrainingConfig,
    optimizer: &'a mut Optimizer,
    scaler: &'a mut LossScaler,
    lr: f32,
    pending: usize,
    batch_size: usize,
    skipped: usize,
}

impl Boundary<'_> {
    fn sample_done(&mut self, store: &mut ParamStore, grads: &mut Gradients) -> NetResult<()> {
        self.pending += 1;
        if self.pending >= self.batch_size {
            self.flush(store, grads)?;
        }
        Ok(())
    }

    fn flush(&mut self, store: &mut ParamStore, grads: &mut Gradients) -> NetResult<()> {
        if self.pending == 0 {
            return Ok(());
        }
        let count = self.pending;
        self.pending = 0;
        grads.scale(1.0 / (count as f32 * self.scaler.scale()));

        if self.scaler.enabled() {
            let overflow = !grads.all_finite();
            self.scaler.update(overflow);
            if overflow {
                grads.zero();
                self.skipped += 1;
                return Ok(());
            }
        } else if self.training.finite_check.enabled {
            grads.check_finite(store, self.training.finite_check.max_samples)?;
        }

        let clip = self.training.clip;
        if let (Some(norm), Some(max_norm)) = (clip_gradients(grads, &clip), clip.max_norm) {
            if norm > max_norm {
                log::trace!("Clipped gradient norm {:.4} to {:.4}", norm, max_norm);
            }
        }
        self.optimizer.apply(store, grads, self.lr);
        store.refresh_shadows();
        grads.zero();
        Ok(())
    }
}

/// Work units per epoch as `(first row, rows)`: single rows for DFF, whole
/// spans for recurrent networks and `max_seq_len` windows for Transformers.
/// Language-model windows include the extra target row.
fn plan_units(kind: &ModelKind, spans: &SequenceSpans, rows: usize) -> Vec<(usize, usize)> {
    match kind {
        ModelKind::Dff(_) => (0..rows).map(|i| (i, 1)).collect(),
        ModelKind::Recurrent(_) => spans.iter().collect(),
        ModelKind::Transformer(tf) => {
            let t = tf.config().max_seq_len;
            let lm = tf.vocab_size().is_some();
            let mut units = Vec::new();
            for (start, len) in spans.iter() {
                let end = start + len;
                let mut s = start;
                if lm {
                    while s + 1 < end {
                        units.push((s, (s + t + 1).min(end) - s));
                        s += t;
                    }
                } else {
                    while s < end {
                        let e = (s + t).min(end);
                        units.push((s, e - s));
                        s = e;
                    }
                }
            }
            units
        }
    }
}

fn rec_window(arch: &ArchitectureConfig) -> usize {
    match arch {
        ArchitectureConfig::Recurrent(c) => c.tbptt_window,
        _ => 0,
    }
}

#[allow(clippy::too_many_arguments)]
fn gather_rows(
    dataset: &dyn Dataset,
    split: Split,
    start: usize,
    rows: usize,
    inputs: usize,
    outputs: usize,
    window: &mut Vec<f32>,
    targets: &mut Vec<f32>,
    finite: FiniteCheck,
) -> NetResult<()> {
    window.clear();
    targets.clear();
    for r in start..start + rows {
        let x = dataset.features(split, r);
        check_finite(finite, &x, || format!("input row {}", r))?;
        if x.len() != inputs {
            return Err(NetError::BuildFailed(format!("row {} has {} features, expected {}", r, x.len(), inputs)));
        }
        window.extend_from_slice(&x);
        let y = dataset.expected(split, r);
        if y.len() != outputs {
            return Err(NetError::BuildFailed(format!("row {} has {} outputs, expected {}", r, y.len(), outputs)));
        }
        targets.extend_from_slice(&y);
    }
    Ok(())
}

fn check_finite(finite: FiniteCheck, buf: &[f32], what: impl FnOnce() -> String) -> NetResult<()> {
    if !finite.enabled {
        return Ok(());
    }
    match first_non_finite_sampled(buf, finite.max_samples) {
        Some(index) => Err(NetError::NonFinite { what: what(), index }),
        None => Ok(()),
    }
}

fn check_loss(finite: FiniteCheck, loss: f64, row: usize) -> NetResult<()> {
    if finite.enabled && !loss.is_finite() {
        return Err(NetError::NonFinite { what: "loss".into(), index: row });
    }
    Ok(())
}

fn scale_in_place(buf: &mut [f32], factor: f32) {
    if factor != 1.0 {
        for v in buf.iter_mut() {
            *v *= factor;
        }
    }
}

/// Shared, read-only view of a network used by incremental decoding.
pub struct NetworkReadGuard<'a> {
    guard: RwLockReadGuard<'a, NetworkState>,
}

impl NetworkReadGuard<'_> {
    /// The token language model, if this network is one and has been built.
    pub fn transformer(&self) -> NetResult<TransformerHandle<'_>> {
        let model = self
            .guard
            .model
            .as_ref()
            .ok_or_else(|| NetError::InvalidState("network has not been built".into()))?;
        match model.transformer() {
            Some(tf) if tf.vocab_size().is_some() => Ok(TransformerHandle { model: tf, store: &model.store }),
            _ => Err(NetError::InvalidArgument("incremental decoding needs a token language model".into())),
        }
    }
}

/// Borrowed token language model plus its parameters.
#[derive(Clone, Copy)]
pub struct TransformerHandle<'a> {
    model: &'a TransformerModel,
    store: &'a ParamStore,
}

impl TransformerHandle<'_> {
    pub fn vocab_size(&self) -> usize {
        self.model.vocab_size().unwrap_or(0)
    }

    pub fn max_seq_len(&self) -> usize {
        self.model.config().max_seq_len
    }

    pub fn num_layers(&self) -> usize {
        self.model.num_layers()
    }

    pub fn kv_width(&self) -> usize {
        self.model.kv_width()
    }

    /// Empty KV buffers for up to `max_len` positions.
    pub fn new_kv(&self, max_len: usize) -> KvBuffers {
        KvBuffers::new(self.num_layers(), self.kv_width(), max_len)
    }

    pub fn positional_cache(&self, max_len: usize) -> NetResult<PositionalCache> {
        PositionalCache::new(self.model.config(), max_len)
    }

    pub fn decode_step(
        &self,
        kv: &mut KvBuffers,
        positions: &PositionalCache,
        token: u32,
        scratch: &mut DecodeScratch,
        logits: &mut [f32],
    ) -> NetResult<()> {
        self.model.decode_step(self.store, kv, positions, token, scratch, logits)
    }
}
