mod common;

use std::time::Duration;

use common::*;
use rustml_net::*;

#[test]
fn test_xor_reaches_full_accuracy() {
    let dataset = xor_dataset();
    let network = xor_network(42);
    let training = network
        .training_config()
        .unwrap()
        .with_termination(Termination { max_epochs: Some(4000), max_duration: None, target_accuracy: Some(1.0) });
    network.set_training_config(training).unwrap();

    let summary = network.run(&dataset, RunMode::Train, &mut NoCallbacks).unwrap();
    assert_eq!(summary.outcome, RunOutcome::TargetReached, "losses: {:?}", summary.losses().last());

    let eval = network.run(&dataset, RunMode::Test, &mut NoCallbacks).unwrap();
    let metrics = eval.last().unwrap();
    assert!(metrics.accuracy.unwrap() >= 0.95);
    assert_eq!(metrics.samples, 4);
    assert!(metrics.classification.is_some());

    let (features, expected) = xor_rows();
    for (x, y) in features.iter().zip(expected.iter()) {
        let out = network.predict(x).unwrap();
        assert_eq!(out[0] > 0.5, y[0] > 0.5, "xor({:?}) = {}", x, out[0]);
    }
}

#[test]
fn test_same_seed_same_history() {
    let dataset = xor_dataset();
    let a = xor_network(7).run(&dataset, RunMode::Train, &mut NoCallbacks).unwrap();
    let b = xor_network(7).run(&dataset, RunMode::Train, &mut NoCallbacks).unwrap();
    assert_eq!(a.losses(), b.losses());
    let c = xor_network(8).run(&dataset, RunMode::Train, &mut NoCallbacks).unwrap();
    assert_ne!(a.losses(), c.losses());
}

#[test]
fn test_epoch_counter_continues_across_runs() {
    let dataset = xor_dataset();
    let network = xor_network(1);
    let mut rec = Recorder::default();
    network.run(&dataset, RunMode::Train, &mut rec).unwrap();
    network.run(&dataset, RunMode::Train, &mut rec).unwrap();
    let epochs: Vec<usize> = rec.epochs.iter().map(|m| m.epoch).collect();
    assert_eq!(epochs, (1..=20).collect::<Vec<_>>());
    assert_eq!(network.epoch(), 20);
    assert_eq!((rec.starts, rec.ends.len()), (2, 2));
}

#[test]
fn test_callback_stop_and_time_limit() {
    let dataset = xor_dataset();
    let network = xor_network(3);
    let mut rec = Recorder { stop_after: Some(3), ..Default::default() };
    let summary = network.run(&dataset, RunMode::Train, &mut rec).unwrap();
    assert_eq!(summary.outcome, RunOutcome::EarlyStopped);
    assert_eq!(summary.history.len(), 3);

    let training = network.training_config().unwrap().with_termination(Termination {
        max_epochs: None,
        max_duration: Some(Duration::ZERO),
        target_accuracy: None,
    });
    network.set_training_config(training).unwrap();
    let summary = network.run(&dataset, RunMode::Train, &mut NoCallbacks).unwrap();
    assert_eq!(summary.outcome, RunOutcome::TimeLimit);
    assert!(summary.history.is_empty());
}

struct Reentrant<'a> {
    dataset: &'a InMemoryDataset,
    nested: Option<NetResult<RunSummary>>,
}

impl RunCallbacks for Reentrant<'_> {
    fn on_epoch_end(&mut self, network: &Network, _metrics: &EpochMetrics) -> bool {
        self.nested = Some(network.run(self.dataset, RunMode::Validate, &mut NoCallbacks));
        true
    }
}

#[test]
fn test_run_from_callback_is_rejected() {
    let dataset = xor_dataset();
    let network = xor_network(5);
    let mut cb = Reentrant { dataset: &dataset, nested: None };
    let summary = network.run(&dataset, RunMode::Train, &mut cb).unwrap();
    assert_eq!(summary.outcome, RunOutcome::EarlyStopped);
    let err = cb.nested.unwrap().unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidState);

    // the guard is released once the outer run returns
    assert!(network.run(&dataset, RunMode::Validate, &mut NoCallbacks).is_ok());
}

#[test]
fn test_empty_split_reports_failure_once() {
    let mut dataset = InMemoryDataset::new(2, 1);
    dataset.push(Split::Train, vec![0.0, 1.0], vec![1.0]).unwrap();
    let network = xor_network(1);
    let mut rec = Recorder::default();
    let err = network.run(&dataset, RunMode::Test, &mut rec).unwrap_err();
    assert_eq!(err.code(), ErrorCode::EmptyData);
    assert_eq!(rec.starts, 1);
    assert_eq!(rec.ends.len(), 1);
    assert!(matches!(&rec.ends[0], RunOutcome::Failed { code: ErrorCode::EmptyData, .. }));
}

#[test]
fn test_shape_mismatch_after_build() {
    let network = xor_network(1);
    network.run(&xor_dataset(), RunMode::Train, &mut NoCallbacks).unwrap();
    let wide = InMemoryDataset::from_rows(vec![vec![0.0, 1.0, 2.0]], vec![vec![1.0]]).unwrap();
    let err = network.run(&wide, RunMode::Train, &mut NoCallbacks).unwrap_err();
    assert_eq!(err.code(), ErrorCode::BuildFailed);

    let mut ragged = InMemoryDataset::variable(2, 1);
    ragged.push(Split::Train, vec![0.0, 1.0], vec![1.0]).unwrap();
    ragged.push(Split::Train, vec![0.0], vec![1.0]).unwrap();
    let err = xor_network(1).run(&ragged, RunMode::Train, &mut NoCallbacks).unwrap_err();
    assert_eq!(err.code(), ErrorCode::BuildFailed);
}

#[test]
fn test_non_finite_input_detected() {
    let dataset = InMemoryDataset::from_rows(vec![vec![0.0, f32::NAN]], vec![vec![1.0]]).unwrap();
    let err = xor_network(1).run(&dataset, RunMode::Train, &mut NoCallbacks).unwrap_err();
    assert!(matches!(err, NetError::NonFinite { index: 1, .. }), "{}", err);
    assert_eq!(err.code(), ErrorCode::InternalError);
}

#[test]
fn test_reset_tensors_rebuilds_identically() {
    let dataset = xor_dataset();
    let network = xor_network(11);
    let first = network.run(&dataset, RunMode::Train, &mut NoCallbacks).unwrap();
    network.reset_tensors().unwrap();
    assert_eq!(network.io_shape().unwrap(), None);
    assert_eq!(network.epoch(), 0);
    let second = network.run(&dataset, RunMode::Train, &mut NoCallbacks).unwrap();
    assert_eq!(first.losses(), second.losses());
}

#[test]
fn test_mixed_precision_reports_loss_scale() {
    let dataset = xor_dataset();
    let network = xor_network(2);
    let training = network
        .training_config()
        .unwrap()
        .with_epochs(200)
        .with_mixed_precision(MixedPrecisionConfig::enabled(PackedDType::BF16));
    network.set_training_config(training).unwrap();
    let summary = network.run(&dataset, RunMode::Train, &mut NoCallbacks).unwrap();
    let first = &summary.history[0];
    let last = summary.last().unwrap();
    assert!(first.loss_scale.is_some());
    assert!(last.loss < first.loss, "{} !< {}", last.loss, first.loss);
}

#[test]
fn test_adamw_with_schedule_and_clipping() {
    let dataset = xor_dataset();
    let arch = ArchitectureConfig::Dff(DffConfig::new(vec![8, 8]));
    let training = TrainingConfig::default()
        .with_learning_rate(0.02)
        .with_batch_size(4)
        .with_optimizer(OptimizerKind::adamw())
        .with_schedule(LrSchedule::Step { every: 50, gamma: 0.5 })
        .with_clip(GradClip { max_norm: Some(1.0), max_value: None })
        .with_epochs(150);
    let network = Network::new(arch, training).unwrap();
    let summary = network.run(&dataset, RunMode::Train, &mut NoCallbacks).unwrap();
    let lrs: Vec<f32> = summary.history.iter().map(|m| m.learning_rate).collect();
    assert!((lrs[0] - 0.02).abs() < 1e-7);
    assert!((lrs[50] - 0.01).abs() < 1e-7);
    assert!((lrs[149] - 0.005).abs() < 1e-7);
    assert!(summary.last().unwrap().loss < summary.history[0].loss);
}

#[test]
fn test_recurrent_cells_learn_echo() {
    let dataset = echo_sequences(6, 12);
    for cell in [CellKind::Rnn, CellKind::Gru, CellKind::Lstm] {
        let arch = ArchitectureConfig::Recurrent(RecurrentConfig::new(cell, vec![12]).with_tbptt_window(6));
        let training = TrainingConfig::default()
            .with_learning_rate(0.01)
            .with_optimizer(OptimizerKind::adamw())
            .with_epochs(60);
        let network = Network::new(arch, training).unwrap();
        let summary = network.run(&dataset, RunMode::Train, &mut NoCallbacks).unwrap();
        let first = summary.history[0].loss;
        let last = summary.last().unwrap().loss;
        assert!(last < first, "{:?}: {} -> {}", cell, first, last);
        assert_eq!(summary.last().unwrap().samples, 72);
        assert!(summary.last().unwrap().regression.is_some());
    }
}

#[test]
fn test_transformer_regression_windows() {
    let mut dataset = InMemoryDataset::new(3, 1);
    for i in 0..48 {
        let x: Vec<f32> = (0..3).map(|j| (((i * 5 + j * 3) % 7) as f32 - 3.0) * 0.2).collect();
        let y = vec![x.iter().sum::<f32>()];
        dataset.push(Split::Train, x, y).unwrap();
    }
    let cfg = TransformerConfig {
        d_model: 8,
        num_heads: 2,
        num_kv_heads: 1,
        num_layers: 1,
        ffn_hidden: 16,
        max_seq_len: 4,
        causal: false,
        ..Default::default()
    };
    let training = TrainingConfig::default()
        .with_learning_rate(0.01)
        .with_optimizer(OptimizerKind::adamw())
        .with_epochs(40);
    let network = Network::new(ArchitectureConfig::Transformer(cfg), training).unwrap();
    let summary = network.run(&dataset, RunMode::Train, &mut NoCallbacks).unwrap();
    assert!(summary.last().unwrap().loss < summary.history[0].loss);
    assert_eq!(summary.last().unwrap().samples, 48);
    assert_eq!(network.predict(&[0.1, 0.2, 0.3]).unwrap().len(), 1);
}

#[test]
fn test_mmap_dataset_matches_in_memory() {
    let dir = tempfile::tempdir().unwrap();
    let (features, expected) = xor_rows();
    let flat_x: Vec<f32> = features.concat();
    let flat_y: Vec<f32> = expected.concat();
    let fx = dir.path().join("x.bin");
    let fy = dir.path().join("y.bin");
    write_tensor_file(&fx, 4, 2, &flat_x).unwrap();
    write_tensor_file(&fy, 4, 1, &flat_y).unwrap();
    let mapped = MmapDataset::open(&fx, &fy).unwrap();

    let a = xor_network(9).run(&mapped, RunMode::Train, &mut NoCallbacks).unwrap();
    let b = xor_network(9).run(&xor_dataset(), RunMode::Train, &mut NoCallbacks).unwrap();
    assert_eq!(a.losses(), b.losses());

    let err = xor_network(9).run(&mapped, RunMode::Test, &mut NoCallbacks).unwrap_err();
    assert_eq!(err.code(), ErrorCode::EmptyData);
}
