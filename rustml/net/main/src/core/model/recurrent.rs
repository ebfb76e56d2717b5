//! Stacked RNN / GRU / LSTM with a per-timestep output projection.
//!
//! Sequences are processed in windows. Hidden (and cell) state is carried from
//! one window into the next, but gradients stop at the window boundary
//! (truncated BPTT).

use rand::rngs::StdRng;
use rustml_kernels::{gemv, gemv_transposed_acc, matmul_rows, matmul_rows_transposed_acc, outer_acc, outer_acc_rows, sigmoid, Activation};

use crate::api::config::{CellKind, RecurrentConfig};
use crate::api::types::IoShape;
use crate::core::model::{add_into, add_rows, ensure_len};
use crate::core::params::{Gradients, Init, ParamId, ParamStore};

#[derive(Debug, Clone, Copy)]
pub struct RecurrentLayer {
    pub wx: ParamId,
    pub wh: ParamId,
    pub bias: ParamId,
    pub inputs: usize,
    pub hidden: usize,
}

#[derive(Debug, Clone, Default)]
struct LayerCache {
    /// `[T, G·H]` gate activations.
    gates: Vec<f32>,
    /// `[T + 1, H]`; row 0 is the state carried into the window.
    h: Vec<f32>,
    /// `[T + 1, H]` LSTM cell state.
    c: Vec<f32>,
    /// `[T, H]` GRU `Wh_n · h_prev`.
    ahn: Vec<f32>,
    /// `[T, H]` gradient arriving from the layer above or the output head.
    dh_in: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct RecurrentModel {
    cell: CellKind,
    layers: Vec<RecurrentLayer>,
    out_weight: ParamId,
    out_bias: ParamId,
    outputs: usize,
    output_activation: Activation,
    /// Carried state per layer.
    state_h: Vec<Vec<f32>>,
    state_c: Vec<Vec<f32>>,
    window: usize,
    input: Vec<f32>,
    caches: Vec<LayerCache>,
    z_out: Vec<f32>,
    a_out: Vec<f32>,
    ax: Vec<f32>,
    ah: Vec<f32>,
    dax: Vec<f32>,
    dah: Vec<f32>,
    dh: Vec<f32>,
    dh_next: Vec<f32>,
    dc_next: Vec<f32>,
}

impl RecurrentModel {
    pub fn build(cfg: &RecurrentConfig, io: IoShape, store: &mut ParamStore, rng: &mut StdRng) -> Self {
        let g = cfg.cell.gates();
        let mut layers = Vec::with_capacity(cfg.hidden_layers.len());
        let mut inputs = io.inputs;
        for (l, &hidden) in cfg.hidden_layers.iter().enumerate() {
            let wx = store.add(format!("rnn.{}.wx", l), &[g * hidden, inputs], Init::Xavier, true, rng);
            let wh = store.add(format!("rnn.{}.wh", l), &[g * hidden, hidden], Init::Xavier, true, rng);
            let bias = store.add(format!("rnn.{}.bias", l), &[g * hidden], Init::Zeros, false, rng);
            if cfg.cell == CellKind::Lstm {
                store.value_mut(bias)[hidden..2 * hidden].fill(1.0);
            }
            layers.push(RecurrentLayer { wx, wh, bias, inputs, hidden });
            inputs = hidden;
        }
        let top = inputs;
        let out_weight = store.add("rnn.out.weight", &[io.outputs, top], Init::Xavier, true, rng);
        let out_bias = store.add("rnn.out.bias", &[io.outputs], Init::Zeros, false, rng);
        let widest_gates = layers.iter().map(|l| g * l.hidden).max().unwrap_or(0);
        let widest = layers.iter().map(|l| l.hidden.max(l.inputs)).max().unwrap_or(0);

        Self {
            cell: cfg.cell,
            state_h: layers.iter().map(|l| vec![0.0; l.hidden]).collect(),
            state_c: layers.iter().map(|l| vec![0.0; l.hidden]).collect(),
            caches: vec![LayerCache::default(); layers.len()],
            layers,
            out_weight,
            out_bias,
            outputs: io.outputs,
            output_activation: cfg.output_activation,
            window: 0,
            input: Vec::new(),
            z_out: Vec::new(),
            a_out: Vec::new(),
            ax: vec![0.0; widest_gates],
            ah: vec![0.0; widest_gates],
            dax: vec![0.0; widest_gates],
            dah: vec![0.0; widest_gates],
            dh: vec![0.0; widest],
            dh_next: vec![0.0; widest],
            dc_next: vec![0.0; widest],
        }
    }

    pub fn layers(&self) -> &[RecurrentLayer] {
        &self.layers
    }

    /// Zeroes the carried state; called at the start of every sequence.
    pub fn reset_state(&mut self) {
        for s in self.state_h.iter_mut().chain(self.state_c.iter_mut()) {
            s.fill(0.0);
        }
    }

    /// Forward `steps` timesteps of `x: [steps, inputs]` starting from the
    /// carried state, which is then advanced to the window's last step.
    pub fn forward_window(&mut self, store: &ParamStore, x: &[f32], steps: usize) {
        let g = self.cell.gates();
        self.window = steps;
        ensure_len(&mut self.input, x.len());
        self.input[..x.len()].copy_from_slice(x);

        for l in 0..self.layers.len() {
            let layer = self.layers[l];
            let hsz = layer.hidden;
            let gh = g * hsz;
            let (below, rest) = self.caches.split_at_mut(l);
            let cache = &mut rest[0];
            ensure_len(&mut cache.gates, steps * gh);
            ensure_len(&mut cache.h, (steps + 1) * hsz);
            ensure_len(&mut cache.c, (steps + 1) * hsz);
            ensure_len(&mut cache.ahn, steps * hsz);
            ensure_len(&mut cache.dh_in, steps * hsz);
            cache.h[..hsz].copy_from_slice(&self.state_h[l]);
            cache.c[..hsz].copy_from_slice(&self.state_c[l]);

            for t in 0..steps {
                let x_t = match below.last() {
                    None => &self.input[t * layer.inputs..(t + 1) * layer.inputs],
                    Some(prev) => &prev.h[(t + 1) * layer.inputs..(t + 2) * layer.inputs],
                };
                let ax = &mut self.ax[..gh];
                let ah = &mut self.ah[..gh];
                gemv(store.weight(layer.wx), gh, layer.inputs, x_t, Some(store.value(layer.bias)), ax);
                gemv(store.weight(layer.wh), gh, hsz, &cache.h[t * hsz..(t + 1) * hsz], None, ah);

                let (h_prev, h_cur) = cache.h.split_at_mut((t + 1) * hsz);
                let (c_prev, c_cur) = cache.c.split_at_mut((t + 1) * hsz);
                cell_forward(
                    self.cell,
                    hsz,
                    ax,
                    ah,
                    &h_prev[t * hsz..],
                    &c_prev[t * hsz..],
                    &mut cache.gates[t * gh..(t + 1) * gh],
                    &mut h_cur[..hsz],
                    &mut c_cur[..hsz],
                    &mut cache.ahn[t * hsz..(t + 1) * hsz],
                );
            }
            self.state_h[l].copy_from_slice(&cache.h[steps * hsz..(steps + 1) * hsz]);
            self.state_c[l].copy_from_slice(&cache.c[steps * hsz..(steps + 1) * hsz]);
        }

        let top = self.top_hidden();
        let o = self.outputs;
        ensure_len(&mut self.z_out, steps * o);
        ensure_len(&mut self.a_out, steps * o);
        let last = &self.caches[self.layers.len() - 1];
        matmul_rows(
            store.weight(self.out_weight),
            o,
            top,
            &last.h[top..(steps + 1) * top],
            steps,
            Some(store.value(self.out_bias)),
            &mut self.z_out[..steps * o],
        );
        self.output_activation.forward(&self.z_out[..steps * o], &mut self.a_out[..steps * o]);
    }

    /// `(pre-activation, activation)` rows `[steps, outputs]` of the last window.
    pub fn output(&self) -> (&[f32], &[f32]) {
        let n = self.window * self.outputs;
        (&self.z_out[..n], &self.a_out[..n])
    }

    fn top_hidden(&self) -> usize {
        self.layers.last().map(|l| l.hidden).unwrap_or(0)
    }

    /// Backpropagation through the last window from `dz: [steps, outputs]`.
    pub fn backward_window(&mut self, store: &ParamStore, dz: &[f32], grads: &mut Gradients) {
        let steps = self.window;
        let g = self.cell.gates();
        let top = self.top_hidden();
        let o = self.outputs;
        let depth = self.layers.len();

        {
            let last = &mut self.caches[depth - 1];
            outer_acc_rows(grads.get_mut(self.out_weight), o, top, dz, &last.h[top..(steps + 1) * top], steps);
            add_rows(grads.get_mut(self.out_bias), dz, steps);
            last.dh_in[..steps * top].fill(0.0);
            matmul_rows_transposed_acc(store.weight(self.out_weight), o, top, dz, steps, &mut last.dh_in[..steps * top]);
        }

        for l in (0..depth).rev() {
            let layer = self.layers[l];
            let hsz = layer.hidden;
            let gh = g * hsz;
            let (below, rest) = self.caches.split_at_mut(l);
            let cache = &mut rest[0];
            let mut lower = below.last_mut();
            if let Some(prev) = lower.as_mut() {
                prev.dh_in[..steps * layer.inputs].fill(0.0);
            }
            let dh_next = &mut self.dh_next[..hsz];
            let dc_next = &mut self.dc_next[..hsz];
            dh_next.fill(0.0);
            dc_next.fill(0.0);

            for t in (0..steps).rev() {
                let dh = &mut self.dh[..hsz];
                for j in 0..hsz {
                    dh[j] = cache.dh_in[t * hsz + j] + dh_next[j];
                }
                let gates = &cache.gates[t * gh..(t + 1) * gh];
                let hp = &cache.h[t * hsz..(t + 1) * hsz];
                let dax = &mut self.dax[..gh];
                let dah = &mut self.dah[..gh];
                cell_backward(
                    self.cell,
                    hsz,
                    gates,
                    hp,
                    &cache.c[t * hsz..(t + 2) * hsz],
                    &cache.ahn[t * hsz..(t + 1) * hsz],
                    dh,
                    dc_next,
                    dax,
                    dah,
                );

                let x_t: &[f32] = match lower.as_deref() {
                    None => &self.input[t * layer.inputs..(t + 1) * layer.inputs],
                    Some(prev) => &prev.h[(t + 1) * layer.inputs..(t + 2) * layer.inputs],
                };
                outer_acc(grads.get_mut(layer.wx), gh, layer.inputs, dax, x_t);
                add_into(grads.get_mut(layer.bias), dax);
                outer_acc(grads.get_mut(layer.wh), gh, hsz, dah, hp);
                if let Some(prev) = lower.as_mut() {
                    let row = &mut prev.dh_in[t * layer.inputs..(t + 1) * layer.inputs];
                    gemv_transposed_acc(store.weight(layer.wx), gh, layer.inputs, dax, row);
                }

                // recurrent path; GRU adds the direct z·h_prev term
                for j in 0..hsz {
                    dh_next[j] = if self.cell == CellKind::Gru { dh[j] * gates[j] } else { 0.0 };
                }
                gemv_transposed_acc(store.weight(layer.wh), gh, hsz, dah, dh_next);
            }
        }
    }
}

/// One cell step from `ax = Wx x + b` and `ah = Wh h_prev`.
#[allow(clippy::too_many_arguments)]
fn cell_forward(
    cell: CellKind,
    hsz: usize,
    ax: &[f32],
    ah: &[f32],
    hp: &[f32],
    cp: &[f32],
    gates: &mut [f32],
    h: &mut [f32],
    c: &mut [f32],
    ahn: &mut [f32],
) {
    match cell {
        CellKind::Rnn => {
            for j in 0..hsz {
                let v = (ax[j] + ah[j]).tanh();
                gates[j] = v;
                h[j] = v;
            }
        }
        CellKind::Gru => {
            for j in 0..hsz {
                let z = sigmoid(ax[j] + ah[j]);
                let r = sigmoid(ax[hsz + j] + ah[hsz + j]);
                let n = (ax[2 * hsz + j] + r * ah[2 * hsz + j]).tanh();
                gates[j] = z;
                gates[hsz + j] = r;
                gates[2 * hsz + j] = n;
                ahn[j] = ah[2 * hsz + j];
                h[j] = (1.0 - z) * n + z * hp[j];
            }
        }
        CellKind::Lstm => {
            for j in 0..hsz {
                let i = sigmoid(ax[j] + ah[j]);
                let f = sigmoid(ax[hsz + j] + ah[hsz + j]);
                let gg = (ax[2 * hsz + j] + ah[2 * hsz + j]).tanh();
                let o = sigmoid(ax[3 * hsz + j] + ah[3 * hsz + j]);
                gates[j] = i;
                gates[hsz + j] = f;
                gates[2 * hsz + j] = gg;
                gates[3 * hsz + j] = o;
                c[j] = f * cp[j] + i * gg;
                h[j] = o * c[j].tanh();
            }
        }
    }
}

/// Gate-space gradients of one step. `c` holds `[c_prev, c_t]`; `dc_next`
/// carries the cell gradient backwards in time and is updated in place.
#[allow(clippy::too_many_arguments)]
fn cell_backward(
    cell: CellKind,
    hsz: usize,
    gates: &[f32],
    hp: &[f32],
    c: &[f32],
    ahn: &[f32],
    dh: &[f32],
    dc_next: &mut [f32],
    dax: &mut [f32],
    dah: &mut [f32],
) {
    match cell {
        CellKind::Rnn => {
            for j in 0..hsz {
                let da = dh[j] * (1.0 - gates[j] * gates[j]);
                dax[j] = da;
                dah[j] = da;
            }
        }
        CellKind::Gru => {
            for j in 0..hsz {
                let (z, r, n) = (gates[j], gates[hsz + j], gates[2 * hsz + j]);
                let dn = dh[j] * (1.0 - z);
                let dzg = dh[j] * (hp[j] - n);
                let dan = dn * (1.0 - n * n);
                let daz = dzg * z * (1.0 - z);
                let dar = dan * ahn[j] * r * (1.0 - r);
                dax[j] = daz;
                dax[hsz + j] = dar;
                dax[2 * hsz + j] = dan;
                dah[j] = daz;
                dah[hsz + j] = dar;
                dah[2 * hsz + j] = dan * r;
            }
        }
        CellKind::Lstm => {
            let (cp, ct) = c.split_at(hsz);
            for j in 0..hsz {
                let (i, f, gg, o) = (gates[j], gates[hsz + j], gates[2 * hsz + j], gates[3 * hsz + j]);
                let tc = ct[j].tanh();
                let d_o = dh[j] * tc;
                let dc = dc_next[j] + dh[j] * o * (1.0 - tc * tc);
                dax[j] = dc * gg * i * (1.0 - i);
                dax[hsz + j] = dc * cp[j] * f * (1.0 - f);
                dax[2 * hsz + j] = dc * i * (1.0 - gg * gg);
                dax[3 * hsz + j] = d_o * o * (1.0 - o);
                dc_next[j] = dc * f;
            }
            dah.copy_from_slice(dax);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn check_cell(cell: CellKind) {
        let mut rng = StdRng::seed_from_u64(21);
        let mut store = ParamStore::new();
        let cfg = RecurrentConfig::new(cell, vec![3, 2]);
        let mut model = RecurrentModel::build(&cfg, IoShape::new(2, 1), &mut store, &mut rng);
        let x = [0.5f32, -0.3, 0.1, 0.8, -0.6, 0.2, 0.3, 0.3];
        let steps = 4;

        let loss_of = |model: &mut RecurrentModel, store: &ParamStore| {
            model.reset_state();
            model.forward_window(store, &x, steps);
            model.output().1.iter().map(|v| 0.5 * v * v).sum::<f32>()
        };

        loss_of(&mut model, &store);
        let dz: Vec<f32> = model.output().1.to_vec();
        let mut grads = Gradients::for_store(&store);
        model.backward_window(&store, &dz, &mut grads);

        let eps = 1e-3f32;
        for name in ["rnn.0.wx", "rnn.0.wh", "rnn.1.wh", "rnn.0.bias"] {
            let id = store.find(name).unwrap();
            for i in (0..store.value(id).len()).step_by(3) {
                let orig = store.value(id)[i];
                store.value_mut(id)[i] = orig + eps;
                let lp = loss_of(&mut model, &store);
                store.value_mut(id)[i] = orig - eps;
                let lm = loss_of(&mut model, &store);
                store.value_mut(id)[i] = orig;
                let num = (lp - lm) / (2.0 * eps);
                let ana = grads.get(id)[i];
                assert!((ana - num).abs() < 2e-3, "{:?} {}[{}]: {} vs {}", cell, name, i, ana, num);
            }
        }
    }

    #[test]
    fn test_rnn_gradients() {
        check_cell(CellKind::Rnn);
    }

    #[test]
    fn test_gru_gradients() {
        check_cell(CellKind::Gru);
    }

    #[test]
    fn test_lstm_gradients() {
        check_cell(CellKind::Lstm);
    }

    #[test]
    fn test_state_carries_across_windows() {
        let mut rng = StdRng::seed_from_u64(4);
        let mut store = ParamStore::new();
        let cfg = RecurrentConfig::new(CellKind::Gru, vec![4]);
        let mut model = RecurrentModel::build(&cfg, IoShape::new(1, 1), &mut store, &mut rng);
        let x = [0.2f32, -0.4, 0.9, 0.1];

        model.reset_state();
        model.forward_window(&store, &x, 4);
        let whole = model.output().1[3];

        model.reset_state();
        model.forward_window(&store, &x[..2], 2);
        model.forward_window(&store, &x[2..], 2);
        let split = model.output().1[1];
        assert!((whole - split).abs() < 1e-6);
    }
}
