//! Dataset capability trait and run callbacks

use std::borrow::Cow;

use crate::api::error::{NetError, NetResult};
use crate::api::types::{EpochMetrics, RunMode, RunOutcome, Split};
use crate::core::data::spans::SequenceSpans;
use crate::core::network::Network;

/// Rows sampled by the default `validate_shape` for variable-size datasets.
pub const SHAPE_SPOT_CHECKS: usize = 8;

/// Row provider consumed by the training engine.
///
/// A dataset is borrowed for the duration of one `Network::run`; ownership
/// stays with the caller. Implementations document their own thread-safety.
pub trait Dataset {
    /// Number of rows in a split.
    fn len(&self, split: Split) -> usize;

    fn is_empty(&self, split: Split) -> bool {
        self.len(split) == 0
    }

    /// Width of a feature row.
    fn feature_len(&self) -> usize;

    /// Width of an expected-output row (0 for token datasets).
    fn output_len(&self) -> usize;

    /// Feature row `idx`; borrowed when the storage allows it.
    fn features(&self, split: Split, idx: usize) -> Cow<'_, [f32]>;

    /// Expected output row `idx`.
    fn expected(&self, split: Split, idx: usize) -> Cow<'_, [f32]>;

    /// `true` when every row is known to have exactly `feature_len` /
    /// `output_len` values, which makes shape validation O(1).
    fn fixed_row_size(&self) -> bool {
        false
    }

    /// Explicit sequence boundaries; `None` means the whole split is one sequence.
    fn sequence_spans(&self, split: Split) -> Option<&SequenceSpans> {
        let _ = split;
        None
    }

    /// Token id stored in row `idx` (first feature, integral and non-negative).
    fn token(&self, split: Split, idx: usize) -> NetResult<u32> {
        let row = self.features(split, idx);
        let v = *row
            .first()
            .ok_or_else(|| NetError::InvalidArgument(format!("row {} has no token", idx)))?;
        if !(v >= 0.0) || v.fract() != 0.0 || v > u32::MAX as f32 {
            return Err(NetError::InvalidArgument(format!("row {} holds {} which is not a token id", idx, v)));
        }
        Ok(v as u32)
    }

    /// Bounded shape check used instead of materializing every row.
    ///
    /// Fixed-size datasets pass immediately; otherwise up to
    /// `SHAPE_SPOT_CHECKS` evenly spread rows are inspected.
    fn validate_shape(&self, split: Split) -> NetResult<()> {
        if self.fixed_row_size() {
            return Ok(());
        }
        let n = self.len(split);
        if n == 0 {
            return Ok(());
        }
        let samples = SHAPE_SPOT_CHECKS.min(n);
        for s in 0..samples {
            let idx = if samples == 1 { 0 } else { s * (n - 1) / (samples - 1) };
            let f = self.features(split, idx).len();
            let e = self.expected(split, idx).len();
            if f != self.feature_len() || e != self.output_len() {
                return Err(NetError::BuildFailed(format!(
                    "row {} has {} features / {} outputs, dataset declares {} / {}",
                    idx,
                    f,
                    e,
                    self.feature_len(),
                    self.output_len()
                )));
            }
        }
        Ok(())
    }
}

/// Hooks fired by `Network::run`.
///
/// `on_run_start` fires once before the first epoch and `on_run_end` fires
/// exactly once whatever the outcome. Calling `run` on the same network from
/// inside a hook fails with `InvalidState`.
pub trait RunCallbacks {
    fn on_run_start(&mut self, _network: &Network, _mode: RunMode) {}

    /// Return `true` to stop before the next epoch.
    fn on_epoch_end(&mut self, _network: &Network, _metrics: &EpochMetrics) -> bool {
        false
    }

    fn on_run_end(&mut self, _network: &Network, _mode: RunMode, _outcome: &RunOutcome) {}
}

/// Callbacks that do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCallbacks;

impl RunCallbacks for NoCallbacks {}

/// Logs every epoch at `info` level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingCallbacks;

impl RunCallbacks for LoggingCallbacks {
    fn on_run_start(&mut self, _network: &Network, mode: RunMode) {
        log::info!("Run started: {:?}", mode);
    }

    fn on_epoch_end(&mut self, _network: &Network, m: &EpochMetrics) -> bool {
        let acc = m.accuracy.map(|a| format!(", acc={:.4}", a)).unwrap_or_default();
        let ppl = m.perplexity.map(|p| format!(", ppl={:.3}", p)).unwrap_or_default();
        log::info!(
            "Epoch {} ({:?}): loss={:.6}{}{}, lr={:.6}, {:.1}ms",
            m.epoch,
            m.mode,
            m.loss,
            acc,
            ppl,
            m.learning_rate,
            m.elapsed.as_secs_f64() * 1000.0
        );
        false
    }

    fn on_run_end(&mut self, _network: &Network, mode: RunMode, outcome: &RunOutcome) {
        log::info!("Run finished: {:?} -> {:?}", mode, outcome);
    }
}
