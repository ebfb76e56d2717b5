//! Shared run, shape and metric types

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What a call to `Network::run` does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Epochs over the train split with parameter updates.
    Train,
    /// One evaluation pass over the test split.
    Test,
    /// One evaluation pass over the train split, no updates.
    Validate,
}

impl RunMode {
    pub fn split(self) -> Split {
        match self {
            RunMode::Train | RunMode::Validate => Split::Train,
            RunMode::Test => Split::Test,
        }
    }

    pub fn updates_parameters(self) -> bool {
        matches!(self, RunMode::Train)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Split {
    Train,
    Test,
}

/// Input/output widths a network is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoShape {
    pub inputs: usize,
    pub outputs: usize,
}

impl IoShape {
    pub fn new(inputs: usize, outputs: usize) -> Self {
        Self { inputs, outputs }
    }
}

/// Mean squared error, mean absolute error and R² over every output element.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RegressionMetrics {
    pub mse: f64,
    pub mae: f64,
    pub r_squared: f64,
}

/// Confusion-matrix derived scores. Precision, recall and F1 are macro averages.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ClassificationMetrics {
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub mcc: f64,
}

/// Metrics reported to `RunCallbacks::on_epoch_end`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    /// Global epoch number (1-based, continues across resumed runs).
    pub epoch: usize,
    pub mode: RunMode,
    /// Mean loss per sample.
    pub loss: f64,
    pub samples: usize,
    /// Top-1 accuracy; next-token accuracy for language models.
    pub accuracy: Option<f64>,
    pub regression: Option<RegressionMetrics>,
    pub classification: Option<ClassificationMetrics>,
    /// `exp(mean token cross-entropy)` for language models.
    pub perplexity: Option<f64>,
    pub learning_rate: f32,
    /// Current dynamic loss scale when mixed precision is on.
    pub loss_scale: Option<f32>,
    /// Optimizer steps skipped because of gradient overflow.
    pub skipped_steps: usize,
    pub elapsed: Duration,
}

/// Why a run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Ran every requested epoch (or the single evaluation pass).
    Completed,
    /// `on_epoch_end` asked to stop.
    EarlyStopped,
    /// Accuracy reached the configured target.
    TargetReached,
    /// The wall-clock budget ran out.
    TimeLimit,
    /// The run aborted with an error; the error itself is returned by `run`.
    Failed { code: crate::api::error::ErrorCode, message: String },
}

/// Result of a successful `Network::run`.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub mode: RunMode,
    pub outcome: RunOutcome,
    pub history: Vec<EpochMetrics>,
}

impl RunSummary {
    pub fn last(&self) -> Option<&EpochMetrics> {
        self.history.last()
    }

    pub fn losses(&self) -> Vec<f64> {
        self.history.iter().map(|m| m.loss).collect()
    }
}
