//! Dataset backed by memory-mapped tensor files.
//!
//! The mappings are read-only and shared; `MmapDataset` is `Send + Sync` as
//! long as nobody rewrites the files while it is alive.

use std::borrow::Cow;
use std::path::Path;

use crate::api::error::{NetError, NetResult};
use crate::api::traits::Dataset;
use crate::api::types::Split;
use crate::core::data::spans::SequenceSpans;
use crate::core::data::tensor_file::TensorFile;

#[derive(Debug)]
struct MappedSplit {
    features: TensorFile,
    expected: TensorFile,
    spans: Option<SequenceSpans>,
}

impl MappedSplit {
    fn open(features: &Path, expected: &Path) -> NetResult<Self> {
        let features = TensorFile::open(features)?;
        let expected = TensorFile::open(expected)?;
        if features.rows() != expected.rows() {
            return Err(NetError::BuildFailed(format!(
                "feature file has {} rows, expected-output file has {}",
                features.rows(),
                expected.rows()
            )));
        }
        Ok(Self { features, expected, spans: None })
    }
}

#[derive(Debug)]
pub struct MmapDataset {
    train: MappedSplit,
    test: Option<MappedSplit>,
}

impl MmapDataset {
    /// Opens the train split from a feature file and an expected-output file.
    pub fn open<P: AsRef<Path>>(features: P, expected: P) -> NetResult<Self> {
        Ok(Self { train: MappedSplit::open(features.as_ref(), expected.as_ref())?, test: None })
    }

    /// Adds a test split with the same column counts as the train split.
    pub fn with_test<P: AsRef<Path>>(mut self, features: P, expected: P) -> NetResult<Self> {
        let test = MappedSplit::open(features.as_ref(), expected.as_ref())?;
        if test.features.cols() != self.train.features.cols() || test.expected.cols() != self.train.expected.cols() {
            return Err(NetError::BuildFailed("test split columns differ from train split".into()));
        }
        self.test = Some(test);
        Ok(self)
    }

    pub fn set_sequence_starts(&mut self, split: Split, starts: &[usize]) -> NetResult<()> {
        let total = self.len(split);
        let spans = SequenceSpans::from_starts(starts, total)?;
        match split {
            Split::Train => self.train.spans = Some(spans),
            Split::Test => match self.test.as_mut() {
                Some(t) => t.spans = Some(spans),
                None => return Err(NetError::InvalidState("no test split mapped".into())),
            },
        }
        Ok(())
    }

    fn split(&self, split: Split) -> Option<&MappedSplit> {
        match split {
            Split::Train => Some(&self.train),
            Split::Test => self.test.as_ref(),
        }
    }

    fn mapped(&self, split: Split) -> &MappedSplit {
        self.split(split).unwrap_or(&self.train)
    }
}

impl Dataset for MmapDataset {
    fn len(&self, split: Split) -> usize {
        self.split(split).map(|s| s.features.rows()).unwrap_or(0)
    }

    fn feature_len(&self) -> usize {
        self.train.features.cols()
    }

    fn output_len(&self) -> usize {
        self.train.expected.cols()
    }

    fn features(&self, split: Split, idx: usize) -> Cow<'_, [f32]> {
        self.mapped(split).features.row(idx)
    }

    fn expected(&self, split: Split, idx: usize) -> Cow<'_, [f32]> {
        self.mapped(split).expected.row(idx)
    }

    fn fixed_row_size(&self) -> bool {
        true
    }

    fn sequence_spans(&self, split: Split) -> Option<&SequenceSpans> {
        self.split(split).and_then(|s| s.spans.as_ref())
    }
}
