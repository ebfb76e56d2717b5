#![allow(dead_code)]

use rustml_net::*;

/// Assert that two f32 slices are element-wise close within a tolerance.
pub fn assert_f32_near(actual: &[f32], expected: &[f32], tolerance: f32, msg: &str) {
    assert_eq!(
        actual.len(),
        expected.len(),
        "{}: length mismatch (actual={}, expected={})",
        msg,
        actual.len(),
        expected.len()
    );
    for (i, (&a, &e)) in actual.iter().zip(expected.iter()).enumerate() {
        assert!(
            (a - e).abs() <= tolerance,
            "{}: element [{}] mismatch: actual={}, expected={}, diff={}, tolerance={}",
            msg,
            i,
            a,
            e,
            (a - e).abs(),
            tolerance
        );
    }
}

pub fn xor_rows() -> (Vec<Vec<f32>>, Vec<Vec<f32>>) {
    let features = vec![vec![0.0, 0.0], vec![0.0, 1.0], vec![1.0, 0.0], vec![1.0, 1.0]];
    let expected = vec![vec![0.0], vec![1.0], vec![1.0], vec![0.0]];
    (features, expected)
}

pub fn xor_dataset() -> InMemoryDataset {
    let (features, expected) = xor_rows();
    InMemoryDataset::from_rows(features, expected).unwrap()
}

pub fn xor_network(seed: u64) -> Network {
    let arch = ArchitectureConfig::Dff(DffConfig::new(vec![8]));
    let training = TrainingConfig::default()
        .with_learning_rate(0.1)
        .with_optimizer(OptimizerKind::Sgd { momentum: 0.9 })
        .with_epochs(10)
        .with_seed(seed);
    Network::new(arch, training).unwrap()
}

/// Rows of one sequence where each target is the previous input (0 at the start).
pub fn echo_sequences(sequences: usize, len: usize) -> InMemoryDataset {
    let mut ds = InMemoryDataset::new(1, 1);
    let mut starts = Vec::new();
    for s in 0..sequences {
        starts.push(s * len);
        let mut prev = 0.0f32;
        for t in 0..len {
            let x = (((s * 7 + t * 3) % 5) as f32 - 2.0) * 0.4;
            ds.push(Split::Train, vec![x], vec![prev]).unwrap();
            ds.push(Split::Test, vec![x], vec![prev]).unwrap();
            prev = x;
        }
    }
    ds.set_train_sequence_starts(&starts).unwrap();
    ds.set_test_sequence_starts(&starts).unwrap();
    ds
}

/// Cyclic token stream `0, 1, .., vocab-1, 0, 1, ..`.
pub fn cyclic_tokens(vocab: usize, len: usize) -> TokenDataset {
    let stream: Vec<u32> = (0..len).map(|i| (i % vocab) as u32).collect();
    TokenDataset::new(vocab, stream.clone(), stream).unwrap()
}

pub fn tiny_lm(vocab: usize) -> TransformerConfig {
    TransformerConfig { max_seq_len: 8, ffn_hidden: 32, ..TransformerConfig::token_lm(vocab, 16, 2, 1) }
}

/// Records every callback invocation.
#[derive(Debug, Default)]
pub struct Recorder {
    pub starts: usize,
    pub epochs: Vec<EpochMetrics>,
    pub ends: Vec<RunOutcome>,
    pub stop_after: Option<usize>,
}

impl RunCallbacks for Recorder {
    fn on_run_start(&mut self, _network: &Network, _mode: RunMode) {
        self.starts += 1;
    }

    fn on_epoch_end(&mut self, _network: &Network, metrics: &EpochMetrics) -> bool {
        self.epochs.push(metrics.clone());
        self.stop_after.is_some_and(|n| self.epochs.len() >= n)
    }

    fn on_run_end(&mut self, _network: &Network, _mode: RunMode, outcome: &RunOutcome) {
        self.ends.push(outcome.clone());
    }
}
