//! Dense feed-forward network, one row at a time.

use rand::rngs::StdRng;
use rustml_kernels::{gemv, gemv_transposed_acc, outer_acc, Activation};

use crate::api::config::DffConfig;
use crate::api::types::IoShape;
use crate::core::model::add_into;
use crate::core::params::{Gradients, Init, ParamId, ParamStore};

/// One fully connected transition `a_out = act(W a_in + b)`.
#[derive(Debug, Clone, Copy)]
pub struct DffLayer {
    pub weight: ParamId,
    pub bias: ParamId,
    pub inputs: usize,
    pub outputs: usize,
    pub activation: Activation,
}

#[derive(Debug, Clone)]
pub struct DffModel {
    layers: Vec<DffLayer>,
    // acts[0] is the input row; acts[l + 1] the output of layer l
    acts: Vec<Vec<f32>>,
    pre: Vec<Vec<f32>>,
    delta: Vec<Vec<f32>>,
}

impl DffModel {
    pub fn build(cfg: &DffConfig, io: IoShape, store: &mut ParamStore, rng: &mut StdRng) -> Self {
        let mut widths = vec![io.inputs];
        widths.extend_from_slice(&cfg.hidden_layers);
        widths.push(io.outputs);

        let transitions = widths.len() - 1;
        let layers: Vec<DffLayer> = (0..transitions)
            .map(|t| {
                let (inputs, outputs) = (widths[t], widths[t + 1]);
                let activation =
                    if t + 1 == transitions { cfg.output_activation } else { cfg.hidden_activation };
                DffLayer {
                    weight: store.add(format!("dff.{}.weight", t), &[outputs, inputs], Init::Xavier, true, rng),
                    bias: store.add(format!("dff.{}.bias", t), &[outputs], Init::Zeros, false, rng),
                    inputs,
                    outputs,
                    activation,
                }
            })
            .collect();

        Self {
            acts: widths.iter().map(|&w| vec![0.0; w]).collect(),
            pre: layers.iter().map(|l| vec![0.0; l.outputs]).collect(),
            delta: layers.iter().map(|l| vec![0.0; l.outputs]).collect(),
            layers,
        }
    }

    pub fn layers(&self) -> &[DffLayer] {
        &self.layers
    }

    /// Forward one row; results are read back with `output`.
    pub fn forward(&mut self, store: &ParamStore, x: &[f32]) {
        self.acts[0].copy_from_slice(x);
        for (l, layer) in self.layers.iter().enumerate() {
            let (inputs, rest) = self.acts.split_at_mut(l + 1);
            let z = &mut self.pre[l];
            gemv(store.weight(layer.weight), layer.outputs, layer.inputs, &inputs[l], Some(store.value(layer.bias)), z);
            layer.activation.forward(z, &mut rest[0]);
        }
    }

    /// `(pre-activation, activation)` of the output layer.
    pub fn output(&self) -> (&[f32], &[f32]) {
        let last = self.layers.len() - 1;
        (&self.pre[last], &self.acts[last + 1])
    }

    /// Activations of every layer after the last `forward` (input first).
    pub fn activations(&self) -> &[Vec<f32>] {
        &self.acts
    }

    /// Backward from `dz` of the output layer; accumulates into `grads`.
    pub fn backward(&mut self, store: &ParamStore, dz: &[f32], grads: &mut Gradients) {
        let last = self.layers.len() - 1;
        self.delta[last].copy_from_slice(dz);
        for l in (0..self.layers.len()).rev() {
            let layer = self.layers[l];
            outer_acc(grads.get_mut(layer.weight), layer.outputs, layer.inputs, &self.delta[l], &self.acts[l]);
            add_into(grads.get_mut(layer.bias), &self.delta[l]);
            if l == 0 {
                break;
            }
            let (lower, upper) = self.delta.split_at_mut(l);
            let prev = &mut lower[l - 1];
            prev.fill(0.0);
            gemv_transposed_acc(store.weight(layer.weight), layer.outputs, layer.inputs, &upper[0], prev);
            let below = self.layers[l - 1].activation;
            for i in 0..prev.len() {
                prev[i] *= below.derivative(self.pre[l - 1][i], self.acts[l][i]);
            }
        }
    }
}
