//! Legacy (v1) node/edge graph for DFF networks.
//!
//! The graph is never the training representation: it is derived from the
//! packed tensors when a package is saved and mapped back onto them on load.
//! Node ids are assigned layer by layer, so node `(layer, index)` has id
//! `offset[layer] + index` and the edge `(layer, i) -> (layer + 1, o)` carries
//! element `o * inputs + i` of transition `layer`'s weight matrix.

use std::path::Path;

use rustml_kernels::Activation;
use serde::{Deserialize, Serialize};

use crate::api::config::{ArchitectureConfig, TrainingConfig};
use crate::api::error::{NetError, NetResult};
use crate::api::types::IoShape;
use crate::core::model::dff::DffModel;
use crate::core::model::{Model, ModelKind};
use crate::core::network::Network;
use crate::core::params::ParamStore;
use crate::core::persist::read_json;

pub const LEGACY_FORMAT_VERSION: u32 = 1;
pub const GRAPH_FILE: &str = "graph.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyNode {
    pub id: usize,
    pub layer: usize,
    pub index: usize,
    pub bias: f32,
    /// `None` for input nodes.
    pub activation: Option<Activation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyEdge {
    pub from: usize,
    pub to: usize,
    pub weight: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyGraph {
    pub format_version: u32,
    pub architecture: ArchitectureConfig,
    pub training: TrainingConfig,
    pub epoch: usize,
    pub layer_sizes: Vec<usize>,
    pub nodes: Vec<LegacyNode>,
    pub edges: Vec<LegacyEdge>,
}

fn layer_sizes(dff: &DffModel) -> Vec<usize> {
    let layers = dff.layers();
    let mut sizes = Vec::with_capacity(layers.len() + 1);
    if let Some(first) = layers.first() {
        sizes.push(first.inputs);
    }
    sizes.extend(layers.iter().map(|l| l.outputs));
    sizes
}

fn offsets(sizes: &[usize]) -> Vec<usize> {
    let mut out = Vec::with_capacity(sizes.len() + 1);
    let mut acc = 0;
    out.push(0);
    for &s in sizes {
        acc += s;
        out.push(acc);
    }
    out
}

/// `(layer, index)` of a node id.
fn locate(offsets: &[usize], id: usize) -> Option<(usize, usize)> {
    let total = *offsets.last()?;
    if id >= total {
        return None;
    }
    let layer = offsets.partition_point(|&o| o <= id) - 1;
    Some((layer, id - offsets[layer]))
}

impl LegacyGraph {
    pub fn from_dff(
        architecture: &ArchitectureConfig,
        training: &TrainingConfig,
        epoch: usize,
        store: &ParamStore,
        dff: &DffModel,
    ) -> Self {
        let sizes = layer_sizes(dff);
        let offs = offsets(&sizes);
        let mut nodes = Vec::with_capacity(offs[sizes.len()]);
        for index in 0..sizes[0] {
            nodes.push(LegacyNode { id: index, layer: 0, index, bias: 0.0, activation: None });
        }
        let mut edges = Vec::new();
        for (t, layer) in dff.layers().iter().enumerate() {
            let bias = store.value(layer.bias);
            let w = store.value(layer.weight);
            for o in 0..layer.outputs {
                nodes.push(LegacyNode {
                    id: offs[t + 1] + o,
                    layer: t + 1,
                    index: o,
                    bias: bias[o],
                    activation: Some(layer.activation),
                });
                for i in 0..layer.inputs {
                    edges.push(LegacyEdge { from: offs[t] + i, to: offs[t + 1] + o, weight: w[o * layer.inputs + i] });
                }
            }
        }
        Self {
            format_version: LEGACY_FORMAT_VERSION,
            architecture: architecture.clone(),
            training: training.clone(),
            epoch,
            layer_sizes: sizes,
            nodes,
            edges,
        }
    }

    /// Writes every bias and weight of the graph into the packed tensors.
    pub fn apply(&self, store: &mut ParamStore, dff: &DffModel) -> NetResult<()> {
        let sizes = layer_sizes(dff);
        if sizes != self.layer_sizes {
            return Err(NetError::BuildFailed(format!(
                "graph layer sizes {:?} do not match network {:?}",
                self.layer_sizes, sizes
            )));
        }
        let offs = offsets(&sizes);
        let layers = dff.layers();
        if self.nodes.len() != offs[sizes.len()] {
            return Err(NetError::BuildFailed(format!(
                "graph has {} nodes, expected {}",
                self.nodes.len(),
                offs[sizes.len()]
            )));
        }

        for node in &self.nodes {
            if node.layer == 0 {
                continue;
            }
            let layer = layers
                .get(node.layer - 1)
                .filter(|l| node.index < l.outputs)
                .ok_or_else(|| NetError::BuildFailed(format!("node {} is outside the network", node.id)))?;
            store.value_mut(layer.bias)[node.index] = node.bias;
        }

        let expected: usize = layers.iter().map(|l| l.inputs * l.outputs).sum();
        if self.edges.len() != expected {
            return Err(NetError::BuildFailed(format!("graph has {} edges, expected {}", self.edges.len(), expected)));
        }
        let mut seen: Vec<Vec<bool>> = layers.iter().map(|l| vec![false; l.inputs * l.outputs]).collect();
        for edge in &self.edges {
            let bad = || NetError::BuildFailed(format!("edge {} -> {} does not join adjacent layers", edge.from, edge.to));
            let (from_layer, i) = locate(&offs, edge.from).ok_or_else(bad)?;
            let (to_layer, o) = locate(&offs, edge.to).ok_or_else(bad)?;
            if to_layer != from_layer + 1 {
                return Err(bad());
            }
            let layer = layers[from_layer];
            let k = o * layer.inputs + i;
            if std::mem::replace(&mut seen[from_layer][k], true) {
                return Err(NetError::BuildFailed(format!("duplicate edge {} -> {}", edge.from, edge.to)));
            }
            store.value_mut(layer.weight)[k] = edge.weight;
        }
        Ok(())
    }
}

impl Network {
    /// Derived node/edge view of a DFF network.
    pub fn legacy_graph(&self) -> NetResult<LegacyGraph> {
        let state = self.read_state()?;
        let model = state
            .model
            .as_ref()
            .ok_or_else(|| NetError::InvalidState("network has not been built".into()))?;
        match &model.kind {
            ModelKind::Dff(dff) => {
                Ok(LegacyGraph::from_dff(self.architecture(), &state.training, state.epoch, &model.store, dff))
            }
            _ => Err(NetError::InvalidArgument("the legacy graph only describes DFF networks".into())),
        }
    }
}

pub(crate) fn load_legacy(dir: &Path, io: IoShape) -> NetResult<Network> {
    let graph: LegacyGraph = read_json(&dir.join(GRAPH_FILE))?;
    if graph.format_version != LEGACY_FORMAT_VERSION {
        return Err(NetError::VersionMismatch { found: graph.format_version, supported: LEGACY_FORMAT_VERSION });
    }
    if graph.layer_sizes.first() != Some(&io.inputs) || graph.layer_sizes.last() != Some(&io.outputs) {
        return Err(NetError::BuildFailed(format!(
            "legacy graph layers {:?} do not fit {} inputs / {} outputs",
            graph.layer_sizes, io.inputs, io.outputs
        )));
    }
    let network = Network::new(graph.architecture.clone(), graph.training.clone())?;
    {
        let mut state = network.write_state()?;
        state.ensure_model(network.architecture(), io)?;
        let model = state
            .model
            .as_mut()
            .ok_or_else(|| NetError::Internal("model missing after build".into()))?;
        let Model { store, kind, .. } = model;
        match kind {
            ModelKind::Dff(dff) => graph.apply(store, dff)?,
            _ => return Err(NetError::BuildFailed("legacy graph packages hold DFF networks only".into())),
        }
        store.refresh_shadows();
        state.epoch = graph.epoch;
    }
    network.sync_epoch(graph.epoch);
    log::debug!("Loaded legacy v1 package from {}", dir.display());
    Ok(network)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locate_ids() {
        let offs = offsets(&[2, 3, 1]);
        assert_eq!(offs, vec![0, 2, 5, 6]);
        assert_eq!(locate(&offs, 0), Some((0, 0)));
        assert_eq!(locate(&offs, 2), Some((1, 0)));
        assert_eq!(locate(&offs, 5), Some((2, 0)));
        assert_eq!(locate(&offs, 6), None);
    }
}
