//! In-memory dataset with fixed or variable rows.
//!
//! Owned `Vec` storage; `Send + Sync`, so one instance may back runs on
//! several networks at once.

use std::borrow::Cow;

use crate::api::error::{NetError, NetResult};
use crate::api::traits::Dataset;
use crate::api::types::Split;
use crate::core::data::spans::SequenceSpans;

#[derive(Debug, Clone, Default)]
struct SplitRows {
    features: Vec<Vec<f32>>,
    expected: Vec<Vec<f32>>,
    spans: Option<SequenceSpans>,
}

#[derive(Debug, Clone)]
pub struct InMemoryDataset {
    feature_len: usize,
    output_len: usize,
    fixed: bool,
    train: SplitRows,
    test: SplitRows,
}

impl InMemoryDataset {
    /// Empty dataset whose rows are checked to be exactly
    /// `feature_len` / `output_len` wide on insertion.
    pub fn new(feature_len: usize, output_len: usize) -> Self {
        Self { feature_len, output_len, fixed: true, train: SplitRows::default(), test: SplitRows::default() }
    }

    /// Dataset that accepts rows of any width; shape problems surface through
    /// the bounded `validate_shape` spot check.
    pub fn variable(feature_len: usize, output_len: usize) -> Self {
        Self { fixed: false, ..Self::new(feature_len, output_len) }
    }

    /// Builds a fixed-size dataset from train rows; the test split mirrors the train split.
    pub fn from_rows(features: Vec<Vec<f32>>, expected: Vec<Vec<f32>>) -> NetResult<Self> {
        let feature_len = features.first().map(|r| r.len()).unwrap_or(0);
        let output_len = expected.first().map(|r| r.len()).unwrap_or(0);
        let mut ds = Self::new(feature_len, output_len);
        for (f, e) in features.into_iter().zip(expected) {
            ds.push(Split::Train, f, e)?;
        }
        ds.test = ds.train.clone();
        Ok(ds)
    }

    fn split(&self, split: Split) -> &SplitRows {
        match split {
            Split::Train => &self.train,
            Split::Test => &self.test,
        }
    }

    fn split_mut(&mut self, split: Split) -> &mut SplitRows {
        match split {
            Split::Train => &mut self.train,
            Split::Test => &mut self.test,
        }
    }

    pub fn push(&mut self, split: Split, features: Vec<f32>, expected: Vec<f32>) -> NetResult<()> {
        if self.fixed && (features.len() != self.feature_len || expected.len() != self.output_len) {
            return Err(NetError::InvalidArgument(format!(
                "row has {} features / {} outputs, dataset expects {} / {}",
                features.len(),
                expected.len(),
                self.feature_len,
                self.output_len
            )));
        }
        let rows = self.split_mut(split);
        rows.features.push(features);
        rows.expected.push(expected);
        rows.spans = None;
        Ok(())
    }

    /// Marks where each training sequence starts. Invalid starts are rejected
    /// before any training happens.
    pub fn set_train_sequence_starts(&mut self, starts: &[usize]) -> NetResult<()> {
        self.set_sequence_starts(Split::Train, starts)
    }

    pub fn set_test_sequence_starts(&mut self, starts: &[usize]) -> NetResult<()> {
        self.set_sequence_starts(Split::Test, starts)
    }

    fn set_sequence_starts(&mut self, split: Split, starts: &[usize]) -> NetResult<()> {
        let total = self.len(split);
        let spans = SequenceSpans::from_starts(starts, total)?;
        self.split_mut(split).spans = Some(spans);
        Ok(())
    }

    pub fn set_sequence_spans(&mut self, split: Split, spans: Vec<(usize, usize)>) -> NetResult<()> {
        let total = self.len(split);
        let spans = SequenceSpans::from_spans(spans, total)?;
        self.split_mut(split).spans = Some(spans);
        Ok(())
    }
}

impl Dataset for InMemoryDataset {
    fn len(&self, split: Split) -> usize {
        self.split(split).features.len()
    }

    fn feature_len(&self) -> usize {
        self.feature_len
    }

    fn output_len(&self) -> usize {
        self.output_len
    }

    fn features(&self, split: Split, idx: usize) -> Cow<'_, [f32]> {
        Cow::Borrowed(&self.split(split).features[idx])
    }

    fn expected(&self, split: Split, idx: usize) -> Cow<'_, [f32]> {
        Cow::Borrowed(&self.split(split).expected[idx])
    }

    fn fixed_row_size(&self) -> bool {
        self.fixed
    }

    fn sequence_spans(&self, split: Split) -> Option<&SequenceSpans> {
        self.split(split).spans.as_ref()
    }
}
