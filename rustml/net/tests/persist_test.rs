mod common;

use std::fs;

use common::*;
use rustml_net::*;

fn trained_xor(epochs: usize) -> (Network, InMemoryDataset) {
    let dataset = xor_dataset();
    let network = xor_network(21);
    let mut training = network.training_config().unwrap().with_epochs(epochs);
    training.shuffle = false;
    network.set_training_config(training).unwrap();
    network.run(&dataset, RunMode::Train, &mut NoCallbacks).unwrap();
    (network, dataset)
}

fn predictions(network: &Network) -> Vec<f32> {
    xor_rows().0.iter().flat_map(|x| network.predict(x).unwrap()).collect()
}

#[test]
fn test_package_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let (network, dataset) = trained_xor(30);
    let manifest = network.save_package(dir.path()).unwrap();
    assert_eq!(manifest.format_version, PACKAGE_FORMAT_VERSION);
    assert_eq!(manifest.architecture_type, "dff");
    assert!(dir.path().join(GRAPH_FILE).is_file());

    let loaded = Network::load_package_for(dir.path(), &dataset).unwrap();
    assert_eq!(loaded.epoch(), 30);
    assert_eq!(predictions(&loaded), predictions(&network));
    assert_eq!(loaded.training_config().unwrap(), network.training_config().unwrap());
}

#[test]
fn test_package_falls_back_to_legacy_graph() {
    let dir = tempfile::tempdir().unwrap();
    let (network, _) = trained_xor(10);
    network.save_package(dir.path()).unwrap();
    fs::remove_file(dir.path().join(WEIGHTS_FILE)).unwrap();

    let loaded = Network::load_package(dir.path(), IoShape::new(2, 1)).unwrap();
    assert_f32_near(&predictions(&loaded), &predictions(&network), 1e-6, "legacy graph predictions");
    assert_eq!(loaded.epoch(), 10);

    let graph = network.legacy_graph().unwrap();
    assert_eq!(graph.layer_sizes, vec![2, 8, 1]);
    assert_eq!(graph.nodes.len(), 11);
    assert_eq!(graph.edges.len(), 2 * 8 + 8);
}

#[test]
fn test_package_shape_and_version_errors() {
    let dir = tempfile::tempdir().unwrap();
    let (network, _) = trained_xor(2);
    network.save_package(dir.path()).unwrap();
    let err = Network::load_package(dir.path(), IoShape::new(3, 1)).unwrap_err();
    assert_eq!(err.code(), ErrorCode::BuildFailed);

    // transformer packages carry no legacy graph, so v2 errors surface directly
    let lm_dir = tempfile::tempdir().unwrap();
    let lm = Network::new(ArchitectureConfig::Transformer(tiny_lm(8)), TrainingConfig::default()).unwrap();
    lm.build(IoShape::new(1, 0)).unwrap();
    lm.save_package(lm_dir.path()).unwrap();
    assert!(!lm_dir.path().join(GRAPH_FILE).exists());
    let manifest_path = lm_dir.path().join(MANIFEST_FILE);
    let mut manifest: serde_json::Value = serde_json::from_str(&fs::read_to_string(&manifest_path).unwrap()).unwrap();
    manifest["format_version"] = serde_json::json!(7);
    fs::write(&manifest_path, manifest.to_string()).unwrap();
    let err = Network::load_package(lm_dir.path(), IoShape::new(1, 0)).unwrap_err();
    assert!(matches!(err, NetError::VersionMismatch { found: 7, supported: 2 }), "{}", err);

    let missing = Network::load_package(lm_dir.path().join("nope"), IoShape::new(1, 0)).unwrap_err();
    assert!(matches!(missing, NetError::MissingFile(_)));
}

#[test]
fn test_unbuilt_network_cannot_be_saved() {
    let dir = tempfile::tempdir().unwrap();
    let err = xor_network(1).save_package(dir.path()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidState);
}

#[test]
fn test_checkpoint_resume_continues_training() {
    let dir = tempfile::tempdir().unwrap();
    let (network, dataset) = trained_xor(5);
    let manifest = network.save_checkpoint_with(dir.path(), CheckpointOptions { shard_cap: 256 }).unwrap();
    assert!(manifest.shards.len() > 1);
    assert_eq!(manifest.epoch, 5);
    assert_eq!(manifest.optimizer_step, 20);
    let records: usize = manifest.shards.iter().map(|s| s.tensors.len()).sum();
    assert_eq!(records, 4 * 3);

    let restored = Network::load_checkpoint(dir.path()).unwrap();
    assert_eq!(restored.epoch(), 5);
    assert_eq!(predictions(&restored), predictions(&network));

    let a = network.run(&dataset, RunMode::Train, &mut NoCallbacks).unwrap();
    let b = restored.run(&dataset, RunMode::Train, &mut NoCallbacks).unwrap();
    assert_eq!(a.losses(), b.losses());
    assert_eq!(b.history[0].epoch, 6);
}

#[test]
fn test_oversized_tensor_gets_own_shard() {
    let dir = tempfile::tempdir().unwrap();
    let (network, _) = trained_xor(1);
    let manifest = network.save_checkpoint_with(dir.path(), CheckpointOptions { shard_cap: 1 }).unwrap();
    assert_eq!(manifest.shards.len(), 12);
    assert!(manifest.shards.iter().all(|s| s.tensors.len() == 1));
    assert_eq!(manifest.shards[3].file, "shard-00003.bin");
}

#[test]
fn test_truncated_or_missing_shard_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (network, _) = trained_xor(2);
    let manifest = network.save_checkpoint(dir.path()).unwrap();
    assert_eq!(manifest.shards.len(), 1);

    let shard = dir.path().join(&manifest.shards[0].file);
    let bytes = fs::read(&shard).unwrap();
    fs::write(&shard, &bytes[..bytes.len() - 3]).unwrap();
    let err = Network::load_checkpoint(dir.path()).unwrap_err();
    assert!(err.to_string().contains("truncated"), "{}", err);

    fs::remove_file(&shard).unwrap();
    let err = Network::load_checkpoint(dir.path()).unwrap_err();
    assert!(matches!(err, NetError::MissingFile(_)));
}

#[test]
fn test_resume_into_existing_network() {
    let dir = tempfile::tempdir().unwrap();
    let (network, _) = trained_xor(4);
    network.save_checkpoint(dir.path()).unwrap();

    let fresh = xor_network(99);
    fresh.resume_from_checkpoint(dir.path()).unwrap();
    assert_eq!(fresh.epoch(), 4);
    assert_eq!(predictions(&fresh), predictions(&network));

    let other = Network::new(ArchitectureConfig::Dff(DffConfig::new(vec![3])), TrainingConfig::default()).unwrap();
    let err = other.resume_from_checkpoint(dir.path()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::BuildFailed);
}
