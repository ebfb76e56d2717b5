//! Token-id dataset for language models: one token per row.

use std::borrow::Cow;

use crate::api::error::{NetError, NetResult};
use crate::api::traits::Dataset;
use crate::api::types::Split;
use crate::core::data::spans::SequenceSpans;

/// Token streams for the train and test splits. `Send + Sync`.
#[derive(Debug, Clone)]
pub struct TokenDataset {
    vocab_size: usize,
    train: Vec<u32>,
    test: Vec<u32>,
    train_spans: Option<SequenceSpans>,
    test_spans: Option<SequenceSpans>,
}

impl TokenDataset {
    pub fn new(vocab_size: usize, train: Vec<u32>, test: Vec<u32>) -> NetResult<Self> {
        if let Some(&bad) = train.iter().chain(test.iter()).find(|&&t| t as usize >= vocab_size) {
            return Err(NetError::InvalidArgument(format!("token {} outside vocabulary of {}", bad, vocab_size)));
        }
        Ok(Self { vocab_size, train, test, train_spans: None, test_spans: None })
    }

    /// Splits a stream into sequences (e.g. sentences) by start offset.
    pub fn with_train_sequence_starts(mut self, starts: &[usize]) -> NetResult<Self> {
        self.train_spans = Some(SequenceSpans::from_starts(starts, self.train.len())?);
        Ok(self)
    }

    pub fn with_test_sequence_starts(mut self, starts: &[usize]) -> NetResult<Self> {
        self.test_spans = Some(SequenceSpans::from_starts(starts, self.test.len())?);
        Ok(self)
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn tokens(&self, split: Split) -> &[u32] {
        match split {
            Split::Train => &self.train,
            Split::Test => &self.test,
        }
    }
}

impl Dataset for TokenDataset {
    fn len(&self, split: Split) -> usize {
        self.tokens(split).len()
    }

    fn feature_len(&self) -> usize {
        1
    }

    fn output_len(&self) -> usize {
        0
    }

    fn features(&self, split: Split, idx: usize) -> Cow<'_, [f32]> {
        Cow::Owned(vec![self.tokens(split)[idx] as f32])
    }

    fn expected(&self, _split: Split, _idx: usize) -> Cow<'_, [f32]> {
        Cow::Borrowed(&[])
    }

    fn fixed_row_size(&self) -> bool {
        true
    }

    fn sequence_spans(&self, split: Split) -> Option<&SequenceSpans> {
        match split {
            Split::Train => self.train_spans.as_ref(),
            Split::Test => self.test_spans.as_ref(),
        }
    }

    fn token(&self, split: Split, idx: usize) -> NetResult<u32> {
        Ok(self.tokens(split)[idx])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_vocab_rejected() {
        assert!(TokenDataset::new(4, vec![0, 1, 4], vec![]).is_err());
    }

    #[test]
    fn test_token_access() {
        let ds = TokenDataset::new(16, vec![3, 9, 1], vec![2]).unwrap();
        assert_eq!(ds.token(Split::Train, 1).unwrap(), 9);
        assert_eq!(ds.features(Split::Test, 0).as_ref(), &[2.0]);
    }
}
