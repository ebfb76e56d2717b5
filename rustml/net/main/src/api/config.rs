//! Validated architecture and training configuration records.
//!
//! Every record is checked once by `validate()` when it is handed to the
//! network (`Network::new`, `Network::set_training_config`); use sites never
//! re-check individual fields.

use std::time::Duration;

use rustml_kernels::{Activation, AttentionStrategy, NormKind, PackedDType};
use serde::{Deserialize, Serialize};

use crate::api::error::{NetError, NetResult};

/// Full-vocabulary softmax configurations whose estimated scratch exceeds this
/// many bytes are rejected unless `TokenLmConfig::allow_large_softmax` is set.
pub const FULL_SOFTMAX_SAFETY_BYTES: u64 = 1 << 30;

fn invalid(msg: impl Into<String>) -> NetError {
    NetError::InvalidArgument(msg.into())
}

// ---------------------------------------------------------------------------
// Architecture
// ---------------------------------------------------------------------------

/// Network architecture. Serialized with a `type` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ArchitectureConfig {
    Dff(DffConfig),
    Recurrent(RecurrentConfig),
    Transformer(TransformerConfig),
}

impl ArchitectureConfig {
    pub fn kind_name(&self) -> &'static str {
        match self {
            ArchitectureConfig::Dff(_) => "dff",
            ArchitectureConfig::Recurrent(_) => "recurrent",
            ArchitectureConfig::Transformer(_) => "transformer",
        }
    }

    pub fn validate(&self) -> NetResult<()> {
        match self {
            ArchitectureConfig::Dff(c) => c.validate(),
            ArchitectureConfig::Recurrent(c) => c.validate(),
            ArchitectureConfig::Transformer(c) => c.validate(),
        }
    }

    /// Activation applied to the final layer.
    pub fn output_activation(&self) -> Activation {
        match self {
            ArchitectureConfig::Dff(c) => c.output_activation,
            ArchitectureConfig::Recurrent(c) => c.output_activation,
            ArchitectureConfig::Transformer(c) => c.output_activation,
        }
    }

    pub fn token_lm(&self) -> Option<&TokenLmConfig> {
        match self {
            ArchitectureConfig::Transformer(c) => c.token_lm.as_ref(),
            _ => None,
        }
    }
}

/// Dense feed-forward network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DffConfig {
    /// Width of each hidden layer, input side first.
    pub hidden_layers: Vec<usize>,
    pub hidden_activation: Activation,
    pub output_activation: Activation,
}

impl Default for DffConfig {
    fn default() -> Self {
        Self { hidden_layers: vec![16], hidden_activation: Activation::Tanh, output_activation: Activation::Sigmoid }
    }
}

impl DffConfig {
    pub fn new(hidden_layers: Vec<usize>) -> Self {
        Self { hidden_layers, ..Default::default() }
    }

    pub fn with_hidden_activation(mut self, activation: Activation) -> Self {
        self.hidden_activation = activation;
        self
    }

    pub fn with_output_activation(mut self, activation: Activation) -> Self {
        self.output_activation = activation;
        self
    }

    pub fn validate(&self) -> NetResult<()> {
        if self.hidden_layers.iter().any(|&w| w == 0) {
            return Err(invalid("hidden layer widths must be > 0"));
        }
        Ok(())
    }
}

/// Recurrent cell type. Gates are packed contiguously per layer:
/// GRU `[z, r, n]`, LSTM `[i, f, g, o]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellKind {
    Rnn,
    Gru,
    #[default]
    Lstm,
}

impl CellKind {
    pub fn gates(self) -> usize {
        match self {
            CellKind::Rnn => 1,
            CellKind::Gru => 3,
            CellKind::Lstm => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecurrentConfig {
    pub cell: CellKind,
    pub hidden_layers: Vec<usize>,
    /// Truncated BPTT window in timesteps; 0 backpropagates through the whole span.
    pub tbptt_window: usize,
    pub output_activation: Activation,
}

impl Default for RecurrentConfig {
    fn default() -> Self {
        Self { cell: CellKind::Lstm, hidden_layers: vec![32], tbptt_window: 0, output_activation: Activation::Identity }
    }
}

impl RecurrentConfig {
    pub fn new(cell: CellKind, hidden_layers: Vec<usize>) -> Self {
        Self { cell, hidden_layers, ..Default::default() }
    }

    pub fn with_tbptt_window(mut self, window: usize) -> Self {
        self.tbptt_window = window;
        self
    }

    pub fn with_output_activation(mut self, activation: Activation) -> Self {
        self.output_activation = activation;
        self
    }

    pub fn validate(&self) -> NetResult<()> {
        if self.hidden_layers.is_empty() {
            return Err(invalid("recurrent network needs at least one hidden layer"));
        }
        if self.hidden_layers.iter().any(|&w| w == 0) {
            return Err(invalid("hidden layer widths must be > 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedForwardKind {
    /// `W2 · gelu(W1 x + b1) + b2`
    #[default]
    Mlp,
    /// `Wd · (silu(Wg x) ⊙ Wu x)`
    SwiGlu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionalKind {
    /// Added to the block input.
    #[default]
    Sinusoidal,
    /// Rotates queries and keys inside attention.
    Rope,
    None,
}

/// Token-level language model head.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenLmConfig {
    pub vocab_size: usize,
    /// Share the embedding table with the output head.
    pub tie_embeddings: bool,
    pub loss: LmLoss,
    /// Accept full-softmax configurations above `FULL_SOFTMAX_SAFETY_BYTES`.
    pub allow_large_softmax: bool,
}

impl Default for TokenLmConfig {
    fn default() -> Self {
        Self { vocab_size: 256, tie_embeddings: true, loss: LmLoss::FullSoftmax, allow_large_softmax: false }
    }
}

impl TokenLmConfig {
    pub fn new(vocab_size: usize) -> Self {
        Self { vocab_size, ..Default::default() }
    }

    pub fn with_loss(mut self, loss: LmLoss) -> Self {
        self.loss = loss;
        self
    }

    pub fn with_tied_embeddings(mut self, tie: bool) -> Self {
        self.tie_embeddings = tie;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LmLoss {
    /// Exact cross-entropy over the whole vocabulary.
    #[default]
    FullSoftmax,
    /// True token plus `negatives` uniformly sampled tokens.
    Sampled { negatives: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformerConfig {
    pub d_model: usize,
    pub num_heads: usize,
    /// Key/value heads; must divide `num_heads` (grouped-query attention).
    pub num_kv_heads: usize,
    pub num_layers: usize,
    pub ffn_hidden: usize,
    pub ffn: FeedForwardKind,
    pub norm: NormKind,
    pub positional: PositionalKind,
    pub rope_theta: f32,
    /// Longest window processed at once during training.
    pub max_seq_len: usize,
    pub causal: bool,
    pub attention: AttentionStrategy,
    pub norm_eps: f32,
    /// Applied to the head output when not a language model.
    pub output_activation: Activation,
    pub token_lm: Option<TokenLmConfig>,
}

impl Default for TransformerConfig {
    fn default() -> Self {
        Self {
            d_model: 64,
            num_heads: 4,
            num_kv_heads: 4,
            num_layers: 2,
            ffn_hidden: 256,
            ffn: FeedForwardKind::Mlp,
            norm: NormKind::LayerNorm,
            positional: PositionalKind::Sinusoidal,
            rope_theta: 10000.0,
            max_seq_len: 128,
            causal: true,
            attention: AttentionStrategy::Materialized,
            norm_eps: 1e-5,
            output_activation: Activation::Identity,
            token_lm: None,
        }
    }
}

impl TransformerConfig {
    /// Small causal language model over `vocab_size` tokens.
    pub fn token_lm(vocab_size: usize, d_model: usize, num_heads: usize, num_layers: usize) -> Self {
        Self {
            d_model,
            num_heads,
            num_kv_heads: num_heads,
            num_layers,
            ffn_hidden: 4 * d_model,
            token_lm: Some(TokenLmConfig::new(vocab_size)),
            ..Default::default()
        }
    }

    pub fn head_dim(&self) -> usize {
        self.d_model / self.num_heads.max(1)
    }

    /// Scratch estimate for full-softmax training: logits, probabilities and
    /// their gradient for one `max_seq_len` window.
    pub fn full_softmax_scratch_bytes(&self) -> u64 {
        let vocab = self.token_lm.as_ref().map(|t| t.vocab_size).unwrap_or(0) as u64;
        self.max_seq_len as u64 * vocab * 3 * 4
    }

    pub fn validate(&self) -> NetResult<()> {
        if self.d_model == 0 || self.num_heads == 0 || self.num_layers == 0 || self.ffn_hidden == 0 {
            return Err(invalid("d_model, num_heads, num_layers and ffn_hidden must be > 0"));
        }
        if self.d_model % self.num_heads != 0 {
            return Err(invalid(format!(
                "d_model ({}) must be divisible by num_heads ({})",
                self.d_model, self.num_heads
            )));
        }
        if self.num_kv_heads == 0 || self.num_heads % self.num_kv_heads != 0 {
            return Err(invalid(format!(
                "num_kv_heads ({}) must divide num_heads ({})",
                self.num_kv_heads, self.num_heads
            )));
        }
        if self.max_seq_len == 0 {
            return Err(invalid("max_seq_len must be > 0"));
        }
        if !(self.norm_eps > 0.0) {
            return Err(invalid("norm_eps must be > 0"));
        }
        if self.positional == PositionalKind::Rope {
            if self.head_dim() % 2 != 0 {
                return Err(invalid(format!("RoPE needs an even head_dim, got {}", self.head_dim())));
            }
            if !(self.rope_theta > 0.0) {
                return Err(invalid("rope_theta must be > 0"));
            }
        }
        if let Some(lm) = &self.token_lm {
            if lm.vocab_size == 0 {
                return Err(invalid("vocab_size must be > 0"));
            }
            if !self.causal {
                return Err(invalid("token language models need causal attention"));
            }
            match lm.loss {
                LmLoss::Sampled { negatives } => {
                    if negatives == 0 || negatives >= lm.vocab_size {
                        return Err(invalid(format!(
                            "sampled softmax needs 0 < negatives < vocab_size, got {} for vocab {}",
                            negatives, lm.vocab_size
                        )));
                    }
                }
                LmLoss::FullSoftmax => {
                    let bytes = self.full_softmax_scratch_bytes();
                    if bytes > FULL_SOFTMAX_SAFETY_BYTES && !lm.allow_large_softmax {
                        return Err(invalid(format!(
                            "full softmax over vocab {} at max_seq_len {} needs ~{} MiB of scratch \
                             (limit {} MiB); use sampled softmax or set allow_large_softmax",
                            lm.vocab_size,
                            self.max_seq_len,
                            bytes >> 20,
                            FULL_SOFTMAX_SAFETY_BYTES >> 20
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Training
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OptimizerKind {
    /// `v = μv + lr·g; w -= v`
    Sgd { momentum: f32 },
    /// Adam with bias correction and decoupled weight decay on matrices.
    AdamW { beta1: f32, beta2: f32, eps: f32, weight_decay: f32 },
}

impl Default for OptimizerKind {
    fn default() -> Self {
        OptimizerKind::Sgd { momentum: 0.9 }
    }
}

impl OptimizerKind {
    pub fn adamw() -> Self {
        OptimizerKind::AdamW { beta1: 0.9, beta2: 0.999, eps: 1e-8, weight_decay: 0.01 }
    }

    pub fn validate(&self) -> NetResult<()> {
        match *self {
            OptimizerKind::Sgd { momentum } => {
                if !(0.0..1.0).contains(&momentum) {
                    return Err(invalid(format!("momentum must be in [0, 1), got {}", momentum)));
                }
            }
            OptimizerKind::AdamW { beta1, beta2, eps, weight_decay } => {
                if !(0.0..1.0).contains(&beta1) || !(0.0..1.0).contains(&beta2) {
                    return Err(invalid("AdamW betas must be in [0, 1)"));
                }
                if !(eps > 0.0) || !(weight_decay >= 0.0) {
                    return Err(invalid("AdamW needs eps > 0 and weight_decay >= 0"));
                }
            }
        }
        Ok(())
    }
}

/// Per-epoch multiplicative learning-rate factor.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LrSchedule {
    #[default]
    Constant,
    /// `gamma^(epoch / every)`
    Step { every: usize, gamma: f32 },
    /// `gamma^epoch`
    Exponential { gamma: f32 },
    /// Cosine decay from 1 to `min_factor` over `total_epochs`.
    Cosine { total_epochs: usize, min_factor: f32 },
}

impl LrSchedule {
    pub fn validate(&self) -> NetResult<()> {
        match *self {
            LrSchedule::Constant => Ok(()),
            LrSchedule::Step { every, gamma } => {
                if every == 0 || !(gamma > 0.0) {
                    return Err(invalid("step schedule needs every > 0 and gamma > 0"));
                }
                Ok(())
            }
            LrSchedule::Exponential { gamma } => {
                if !(gamma > 0.0) {
                    return Err(invalid("exponential schedule needs gamma > 0"));
                }
                Ok(())
            }
            LrSchedule::Cosine { total_epochs, min_factor } => {
                if total_epochs == 0 || !(0.0..=1.0).contains(&min_factor) {
                    return Err(invalid("cosine schedule needs total_epochs > 0 and min_factor in [0, 1]"));
                }
                Ok(())
            }
        }
    }
}

/// Gradient clipping applied at each minibatch boundary.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GradClip {
    /// Scale all gradients by `min(1, max_norm / ‖g‖₂)`.
    pub max_norm: Option<f32>,
    /// Clamp every element to `[-max_value, max_value]`.
    pub max_value: Option<f32>,
}

impl GradClip {
    pub fn validate(&self) -> NetResult<()> {
        if let Some(n) = self.max_norm {
            if !(n > 0.0) {
                return Err(invalid("clip max_norm must be > 0"));
            }
        }
        if let Some(v) = self.max_value {
            if !(v > 0.0) {
                return Err(invalid("clip max_value must be > 0"));
            }
        }
        Ok(())
    }
}

/// When a training run stops. At least one of `max_epochs` and `max_duration`
/// must be set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Termination {
    pub max_epochs: Option<usize>,
    pub max_duration: Option<Duration>,
    /// Stop once epoch accuracy reaches this fraction.
    pub target_accuracy: Option<f64>,
}

impl Default for Termination {
    fn default() -> Self {
        Self { max_epochs: Some(100), max_duration: None, target_accuracy: None }
    }
}

impl Termination {
    pub fn epochs(n: usize) -> Self {
        Self { max_epochs: Some(n), ..Default::default() }
    }

    pub fn validate(&self) -> NetResult<()> {
        if self.max_epochs.is_none() && self.max_duration.is_none() {
            return Err(invalid("termination needs max_epochs or max_duration"));
        }
        if self.max_epochs == Some(0) {
            return Err(invalid("max_epochs must be > 0"));
        }
        if let Some(t) = self.target_accuracy {
            if !(t > 0.0 && t <= 1.0) {
                return Err(invalid(format!("target_accuracy must be in (0, 1], got {}", t)));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossKind {
    MeanSquared,
    /// Softmax cross-entropy over the raw outputs (identity output activation).
    CrossEntropy,
    /// Per-output binary cross-entropy on sigmoid outputs.
    BinaryCrossEntropy,
}

impl LossKind {
    /// Loss used when none is configured.
    pub fn default_for(output_activation: Activation) -> Self {
        match output_activation {
            Activation::Sigmoid => LossKind::BinaryCrossEntropy,
            _ => LossKind::MeanSquared,
        }
    }

    pub fn is_classification(self) -> bool {
        !matches!(self, LossKind::MeanSquared)
    }
}

/// Low-precision shadow weights with dynamic loss scaling.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MixedPrecisionConfig {
    /// `None` trains in plain f32.
    pub mode: Option<PackedDType>,
    pub initial_scale: f32,
    /// Consecutive good steps before the scale grows.
    pub growth_interval: usize,
    pub growth_factor: f32,
    pub backoff_factor: f32,
}

impl Default for MixedPrecisionConfig {
    fn default() -> Self {
        Self { mode: None, initial_scale: 65536.0, growth_interval: 2000, growth_factor: 2.0, backoff_factor: 0.5 }
    }
}

impl MixedPrecisionConfig {
    pub fn enabled(dtype: PackedDType) -> Self {
        Self { mode: Some(dtype), ..Default::default() }
    }

    pub fn validate(&self) -> NetResult<()> {
        if self.mode.is_none() {
            return Ok(());
        }
        if !(self.initial_scale > 0.0) || !self.initial_scale.is_finite() {
            return Err(invalid("initial loss scale must be finite and > 0"));
        }
        if self.growth_interval == 0 || !(self.growth_factor > 1.0) {
            return Err(invalid("loss-scale growth needs growth_interval > 0 and growth_factor > 1"));
        }
        if !(self.backoff_factor > 0.0 && self.backoff_factor < 1.0) {
            return Err(invalid("backoff_factor must be in (0, 1)"));
        }
        Ok(())
    }
}

/// Sampled non-finite checks on inputs, activations, losses and gradients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FiniteCheck {
    pub enabled: bool,
    pub max_samples: usize,
}

impl Default for FiniteCheck {
    fn default() -> Self {
        Self { enabled: true, max_samples: rustml_kernels::DEFAULT_FINITE_SAMPLES }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub learning_rate: f32,
    /// Samples per optimizer step (rows for DFF, windows for sequence models).
    pub batch_size: usize,
    pub optimizer: OptimizerKind,
    pub schedule: LrSchedule,
    pub clip: GradClip,
    pub termination: Termination,
    /// Seeds weight init, shuffling and negative sampling.
    pub seed: u64,
    pub shuffle: bool,
    /// `None` picks `LossKind::default_for` the output activation.
    pub loss: Option<LossKind>,
    pub mixed_precision: MixedPrecisionConfig,
    pub finite_check: FiniteCheck,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.01,
            batch_size: 1,
            optimizer: OptimizerKind::default(),
            schedule: LrSchedule::Constant,
            clip: GradClip::default(),
            termination: Termination::default(),
            seed: 42,
            shuffle: true,
            loss: None,
            mixed_precision: MixedPrecisionConfig::default(),
            finite_check: FiniteCheck::default(),
        }
    }
}

impl TrainingConfig {
    pub fn with_learning_rate(mut self, lr: f32) -> Self {
        self.learning_rate = lr;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_optimizer(mut self, optimizer: OptimizerKind) -> Self {
        self.optimizer = optimizer;
        self
    }

    pub fn with_schedule(mut self, schedule: LrSchedule) -> Self {
        self.schedule = schedule;
        self
    }

    pub fn with_clip(mut self, clip: GradClip) -> Self {
        self.clip = clip;
        self
    }

    pub fn with_epochs(mut self, epochs: usize) -> Self {
        self.termination.max_epochs = Some(epochs);
        self
    }

    pub fn with_termination(mut self, termination: Termination) -> Self {
        self.termination = termination;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_loss(mut self, loss: LossKind) -> Self {
        self.loss = Some(loss);
        self
    }

    pub fn with_mixed_precision(mut self, mixed: MixedPrecisionConfig) -> Self {
        self.mixed_precision = mixed;
        self
    }

    pub fn validate(&self) -> NetResult<()> {
        if !(self.learning_rate > 0.0) || !self.learning_rate.is_finite() {
            return Err(invalid(format!("learning_rate must be finite and > 0, got {}", self.learning_rate)));
        }
        if self.batch_size == 0 {
            return Err(invalid("batch_size must be > 0"));
        }
        if self.finite_check.enabled && self.finite_check.max_samples == 0 {
            return Err(invalid("finite_check.max_samples must be > 0"));
        }
        self.optimizer.validate()?;
        self.schedule.validate()?;
        self.clip.validate()?;
        self.termination.validate()?;
        self.mixed_precision.validate()
    }

    /// Checks that need both records: loss/activation pairing and accuracy targets.
    pub fn validate_against(&self, arch: &ArchitectureConfig) -> NetResult<()> {
        self.validate()?;
        let loss = self.resolved_loss(arch);
        if arch.token_lm().is_some() {
            if loss != LossKind::CrossEntropy {
                return Err(invalid("token language models train with cross-entropy"));
            }
            return Ok(());
        }
        match (loss, arch.output_activation()) {
            (LossKind::BinaryCrossEntropy, Activation::Sigmoid) => {}
            (LossKind::BinaryCrossEntropy, other) => {
                return Err(invalid(format!("binary cross-entropy needs a sigmoid output, got {:?}", other)));
            }
            (LossKind::CrossEntropy, Activation::Identity) => {}
            (LossKind::CrossEntropy, other) => {
                return Err(invalid(format!("cross-entropy needs an identity output (logits), got {:?}", other)));
            }
            (LossKind::MeanSquared, _) => {}
        }
        if self.termination.target_accuracy.is_some() && !loss.is_classification() {
            return Err(invalid("target_accuracy needs a classification loss"));
        }
        Ok(())
    }

    pub fn resolved_loss(&self, arch: &ArchitectureConfig) -> LossKind {
        if arch.token_lm().is_some() {
            return self.loss.unwrap_or(LossKind::CrossEntropy);
        }
        self.loss.unwrap_or_else(|| LossKind::default_for(arch.output_activation()))
    }
}
