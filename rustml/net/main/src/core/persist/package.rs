//! Model package (format v2): packed tensors plus JSON descriptions.
//!
//! ```text
//! <dir>/manifest.json      format version, architecture type, io shape, tensor table
//! <dir>/architecture.json  architecture + training config
//! <dir>/weights.bin        named f32 tensor records
//! <dir>/graph.json         legacy v1 view (DFF networks only)
//! ```

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::api::config::{ArchitectureConfig, TrainingConfig};
use crate::api::error::{NetError, NetResult};
use crate::api::traits::Dataset;
use crate::api::types::IoShape;
use crate::core::model::ModelKind;
use crate::core::network::Network;
use crate::core::persist::codec::{write_record, RecordReader};
use crate::core::persist::legacy::{load_legacy, LegacyGraph, GRAPH_FILE};
use crate::core::persist::{assign_tensor, read_json, write_json, TensorPart};

pub const PACKAGE_FORMAT_VERSION: u32 = 2;
pub const MANIFEST_FILE: &str = "manifest.json";
pub const ARCHITECTURE_FILE: &str = "architecture.json";
pub const WEIGHTS_FILE: &str = "weights.bin";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorEntry {
    pub name: String,
    pub shape: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageManifest {
    pub format_version: u32,
    pub architecture_type: String,
    pub io: IoShape,
    pub epoch: usize,
    pub tensor_files: Vec<String>,
    pub tensors: Vec<TensorEntry>,
}

impl PackageManifest {
    pub fn read<P: AsRef<Path>>(dir: P) -> NetResult<Self> {
        read_json(&dir.as_ref().join(MANIFEST_FILE))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchitectureFile {
    pub architecture: ArchitectureConfig,
    pub training: TrainingConfig,
}

impl Network {
    /// Writes a v2 package into `dir`; the manifest is written last.
    pub fn save_package<P: AsRef<Path>>(&self, dir: P) -> NetResult<PackageManifest> {
        let dir = dir.as_ref();
        let state = self.read_state()?;
        let model = state
            .model
            .as_ref()
            .ok_or_else(|| NetError::InvalidState("network has not been built".into()))?;
        fs::create_dir_all(dir)?;

        let mut w = BufWriter::new(File::create(dir.join(WEIGHTS_FILE))?);
        let mut tensors = Vec::with_capacity(model.store.len());
        for (_, t) in model.store.iter() {
            write_record(&mut w, &t.name, &t.shape, &t.value)?;
            tensors.push(TensorEntry { name: t.name.clone(), shape: t.shape.to_vec() });
        }
        w.flush()?;

        write_json(
            &dir.join(ARCHITECTURE_FILE),
            &ArchitectureFile { architecture: self.architecture().clone(), training: state.training.clone() },
        )?;
        if let ModelKind::Dff(dff) = &model.kind {
            let graph = LegacyGraph::from_dff(self.architecture(), &state.training, state.epoch, &model.store, dff);
            write_json(&dir.join(GRAPH_FILE), &graph)?;
        }

        let manifest = PackageManifest {
            format_version: PACKAGE_FORMAT_VERSION,
            architecture_type: self.architecture().kind_name().to_string(),
            io: model.io,
            epoch: state.epoch,
            tensor_files: vec![WEIGHTS_FILE.to_string()],
            tensors,
        };
        write_json(&dir.join(MANIFEST_FILE), &manifest)?;
        log::info!(
            "Saved {} package to {} ({} tensors, {} parameters)",
            manifest.architecture_type,
            dir.display(),
            manifest.tensors.len(),
            model.store.total_elements()
        );
        Ok(manifest)
    }

    /// Loads a package, rebuilding dimensions from `io` before reading bytes.
    ///
    /// The v2 layout is tried first. When it fails and a legacy `graph.json`
    /// is present the v1 loader runs, and only its error is reported.
    pub fn load_package<P: AsRef<Path>>(dir: P, io: IoShape) -> NetResult<Network> {
        let dir = dir.as_ref();
        match load_v2(dir, io) {
            Ok(network) => Ok(network),
            Err(err) => {
                if !dir.join(GRAPH_FILE).is_file() {
                    return Err(err);
                }
                log::warn!("Package v2 load from {} failed ({}), falling back to legacy graph", dir.display(), err);
                load_legacy(dir, io)
            }
        }
    }

    /// Like `load_package`, taking the shape from `dataset`.
    pub fn load_package_for<P: AsRef<Path>>(dir: P, dataset: &dyn Dataset) -> NetResult<Network> {
        Self::load_package(dir, IoShape::new(dataset.feature_len(), dataset.output_len()))
    }
}

fn load_v2(dir: &Path, io: IoShape) -> NetResult<Network> {
    let manifest = PackageManifest::read(dir)?;
    if manifest.format_version != PACKAGE_FORMAT_VERSION {
        return Err(NetError::VersionMismatch { found: manifest.format_version, supported: PACKAGE_FORMAT_VERSION });
    }
    let arch_file: ArchitectureFile = read_json(&dir.join(ARCHITECTURE_FILE))?;
    if arch_file.architecture.kind_name() != manifest.architecture_type {
        return Err(NetError::BuildFailed(format!(
            "manifest says '{}' but architecture.json describes '{}'",
            manifest.architecture_type,
            arch_file.architecture.kind_name()
        )));
    }
    if manifest.io != io {
        return Err(NetError::BuildFailed(format!(
            "package was saved for {} inputs / {} outputs, got {} / {}",
            manifest.io.inputs, manifest.io.outputs, io.inputs, io.outputs
        )));
    }

    let network = Network::new(arch_file.architecture, arch_file.training)?;
    {
        let mut state = network.write_state()?;
        state.ensure_model(network.architecture(), io)?;
        let model = state
            .model
            .as_mut()
            .ok_or_else(|| NetError::Internal("model missing after build".into()))?;
        let mut loaded = vec![false; model.store.len()];
        for file in &manifest.tensor_files {
            let path = dir.join(file);
            if !path.is_file() {
                return Err(NetError::MissingFile(path));
            }
            let bytes = fs::read(&path)?;
            let mut reader = RecordReader::new(&bytes, file);
            while let Some(rec) = reader.next_record()? {
                let id = assign_tensor(&mut model.store, &rec.name, TensorPart::Value, &rec.data)?;
                loaded[id.index()] = true;
            }
        }
        if let Some(missing) = loaded.iter().position(|&l| !l) {
            let name = model.store.iter().nth(missing).map(|(_, t)| t.name.clone()).unwrap_or_default();
            return Err(NetError::BuildFailed(format!("package has no data for tensor '{}'", name)));
        }
        model.store.refresh_shadows();
        state.epoch = manifest.epoch;
    }
    network.sync_epoch(manifest.epoch);
    log::debug!("Loaded v2 package from {}", dir.display());
    Ok(network)
}
