//! Sharded training checkpoints.
//!
//! A checkpoint directory holds `checkpoint.json` and numbered
//! `shard-NNNNN.bin` files. Each parameter contributes three records (value,
//! first moment, second moment) so a resumed run continues the optimizer
//! exactly where it stopped.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::api::config::{ArchitectureConfig, TrainingConfig};
use crate::api::error::{NetError, NetResult};
use crate::api::types::IoShape;
use crate::core::network::{Network, NetworkState};
use crate::core::persist::codec::{record_len, write_record, RecordReader};
use crate::core::persist::{assign_tensor, read_json, write_json, TensorPart};

pub const CHECKPOINT_FORMAT_VERSION: u32 = 1;
pub const CHECKPOINT_MANIFEST: &str = "checkpoint.json";
/// Default upper bound on the size of one shard file.
pub const DEFAULT_SHARD_CAP: u64 = 1 << 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointOptions {
    /// A shard is closed before it would exceed this many bytes. A single
    /// record larger than the cap gets a shard of its own.
    pub shard_cap: u64,
}

impl Default for CheckpointOptions {
    fn default() -> Self {
        Self { shard_cap: DEFAULT_SHARD_CAP }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardTensor {
    pub name: String,
    pub part: TensorPart,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardEntry {
    pub file: String,
    pub bytes: u64,
    pub tensors: Vec<ShardTensor>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub format_version: u32,
    pub epoch: usize,
    pub optimizer_step: u64,
    pub loss_scale: f32,
    pub loss_scale_good_steps: usize,
    pub io: IoShape,
    pub architecture: ArchitectureConfig,
    pub training: TrainingConfig,
    pub shards: Vec<ShardEntry>,
}

impl CheckpointManifest {
    pub fn read<P: AsRef<Path>>(dir: P) -> NetResult<Self> {
        read_json(&dir.as_ref().join(CHECKPOINT_MANIFEST))
    }

    pub fn total_bytes(&self) -> u64 {
        self.shards.iter().map(|s| s.bytes).sum()
    }
}

pub fn shard_file_name(index: usize) -> String {
    format!("shard-{:05}.bin", index)
}

impl Network {
    pub fn save_checkpoint<P: AsRef<Path>>(&self, dir: P) -> NetResult<CheckpointManifest> {
        self.save_checkpoint_with(dir, CheckpointOptions::default())
    }

    /// Writes every tensor with its optimizer moments, then the manifest.
    pub fn save_checkpoint_with<P: AsRef<Path>>(&self, dir: P, options: CheckpointOptions) -> NetResult<CheckpointManifest> {
        if options.shard_cap == 0 {
            return Err(NetError::InvalidArgument("shard cap must be positive".into()));
        }
        let dir = dir.as_ref();
        let state = self.read_state()?;
        let model = state
            .model
            .as_ref()
            .ok_or_else(|| NetError::InvalidState("network has not been built".into()))?;
        fs::create_dir_all(dir)?;

        let mut shards: Vec<ShardEntry> = Vec::new();
        let mut writer: Option<BufWriter<File>> = None;
        for (_, t) in model.store.iter() {
            for part in TensorPart::ALL {
                let data = match part {
                    TensorPart::Value => &t.value,
                    TensorPart::FirstMoment => &t.m,
                    TensorPart::SecondMoment => &t.v,
                };
                let record = part.record_name(&t.name);
                let len = record_len(&record, t.shape.len(), data.len());
                let open_new = match shards.last() {
                    None => true,
                    Some(s) => !s.tensors.is_empty() && s.bytes + len > options.shard_cap,
                };
                if open_new {
                    if let Some(mut w) = writer.take() {
                        w.flush()?;
                    }
                    let file = shard_file_name(shards.len());
                    writer = Some(BufWriter::new(File::create(dir.join(&file))?));
                    shards.push(ShardEntry { file, bytes: 0, tensors: Vec::new() });
                }
                let (Some(w), Some(shard)) = (writer.as_mut(), shards.last_mut()) else {
                    return Err(NetError::Internal("no open shard".into()));
                };
                shard.bytes += write_record(w, &record, &t.shape, data)?;
                shard.tensors.push(ShardTensor { name: t.name.clone(), part, count: data.len() });
            }
        }
        if let Some(mut w) = writer.take() {
            w.flush()?;
        }

        let manifest = CheckpointManifest {
            format_version: CHECKPOINT_FORMAT_VERSION,
            epoch: state.epoch,
            optimizer_step: state.optimizer.step_count(),
            loss_scale: state.scaler.scale(),
            loss_scale_good_steps: state.scaler.good_steps(),
            io: model.io,
            architecture: self.architecture().clone(),
            training: state.training.clone(),
            shards,
        };
        write_json(&dir.join(CHECKPOINT_MANIFEST), &manifest)?;
        log::info!(
            "Saved checkpoint at epoch {} to {} ({} shards, {} bytes)",
            manifest.epoch,
            dir.display(),
            manifest.shards.len(),
            manifest.total_bytes()
        );
        Ok(manifest)
    }

    /// Rebuilds a network from a checkpoint, ready to resume training.
    pub fn load_checkpoint<P: AsRef<Path>>(dir: P) -> NetResult<Network> {
        let dir = dir.as_ref();
        let manifest = CheckpointManifest::read(dir)?;
        let network = Network::new(manifest.architecture.clone(), manifest.training.clone())?;
        network.restore_checkpoint(dir, &manifest)?;
        Ok(network)
    }

    /// Loads a checkpoint of the same architecture into this network,
    /// replacing weights, optimizer state and the epoch counter. The
    /// checkpoint's training config is installed as well.
    pub fn resume_from_checkpoint<P: AsRef<Path>>(&self, dir: P) -> NetResult<()> {
        let dir = dir.as_ref();
        let manifest = CheckpointManifest::read(dir)?;
        if &manifest.architecture != self.architecture() {
            return Err(NetError::BuildFailed("checkpoint architecture differs from this network".into()));
        }
        self.restore_checkpoint(dir, &manifest)
    }

    fn restore_checkpoint(&self, dir: &Path, manifest: &CheckpointManifest) -> NetResult<()> {
        if manifest.format_version != CHECKPOINT_FORMAT_VERSION {
            return Err(NetError::VersionMismatch {
                found: manifest.format_version,
                supported: CHECKPOINT_FORMAT_VERSION,
            });
        }
        manifest.training.validate_against(self.architecture())?;
        let mut state = self.write_state()?;
        let mut fresh = NetworkState::new(manifest.training.clone());
        fresh.ensure_model(self.architecture(), manifest.io)?;
        read_shards(dir, manifest, &mut fresh)?;

        fresh.epoch = manifest.epoch;
        fresh.optimizer.set_step_count(manifest.optimizer_step);
        fresh.scaler.restore(manifest.loss_scale, manifest.loss_scale_good_steps);
        fresh.rng = StdRng::seed_from_u64(manifest.training.seed ^ manifest.epoch as u64);
        *state = fresh;
        drop(state);
        self.sync_epoch(manifest.epoch);
        log::info!("Restored checkpoint from {} at epoch {}", dir.display(), manifest.epoch);
        Ok(())
    }
}

fn read_shards(dir: &Path, manifest: &CheckpointManifest, state: &mut NetworkState) -> NetResult<()> {
    let model = state
        .model
        .as_mut()
        .ok_or_else(|| NetError::Internal("model missing after build".into()))?;
    let mut seen: HashSet<(String, TensorPart)> = HashSet::new();

    for shard in &manifest.shards {
        let path = dir.join(&shard.file);
        if !path.is_file() {
            return Err(NetError::MissingFile(path));
        }
        let bytes = fs::read(&path)?;
        if (bytes.len() as u64) < shard.bytes {
            return Err(NetError::BuildFailed(format!(
                "{} is truncated: {} of {} bytes",
                shard.file,
                bytes.len(),
                shard.bytes
            )));
        }
        let mut reader = RecordReader::new(&bytes, &shard.file);
        for entry in &shard.tensors {
            let record = reader.next_record()?.ok_or_else(|| {
                NetError::BuildFailed(format!("{} ends before tensor '{}'", shard.file, entry.name))
            })?;
            let expected_name = entry.part.record_name(&entry.name);
            if record.name != expected_name {
                return Err(NetError::BuildFailed(format!(
                    "{}: expected record '{}', found '{}'",
                    shard.file, expected_name, record.name
                )));
            }
            if record.data.len() != entry.count {
                return Err(NetError::TensorMismatch {
                    name: expected_name,
                    expected: entry.count,
                    found: record.data.len(),
                });
            }
            assign_tensor(&mut model.store, &entry.name, entry.part, &record.data)?;
            seen.insert((entry.name.clone(), entry.part));
        }
        if reader.position() != bytes.len() {
            return Err(NetError::BuildFailed(format!("{} has trailing bytes", shard.file)));
        }
    }

    for (_, t) in model.store.iter() {
        for part in TensorPart::ALL {
            if !seen.contains(&(t.name.clone(), part)) {
                return Err(NetError::BuildFailed(format!(
                    "checkpoint has no record '{}'",
                    part.record_name(&t.name)
                )));
            }
        }
    }
    model.store.refresh_shadows();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_names() {
        assert_eq!(shard_file_name(0), "shard-00000.bin");
        assert_eq!(shard_file_name(12), "shard-00012.bin");
    }
}
