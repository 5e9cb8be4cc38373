// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::module::{Module, Parameter, ParameterHost};
use crate::{PureResult, Tensor, TensorError};
use rand::rngs::StdRng;
use std::cell::RefCell;

fn sigmoid(value: f32) -> f32 {
    1.0 / (1.0 + (-value).exp())
}

/// Single-layer LSTM over a (timesteps, features) sequence.
///
/// Every forward pass starts from a zero hidden/cell state: windows are
/// summarized independently, there is no streaming carryover. Forward passes
/// push a cache onto an internal stack so one layer instance can serve every
/// window of a batch; `backward` consumes caches in LIFO order and therefore
/// must mirror the forward order exactly (last forward first).
#[derive(Debug)]
pub struct Lstm {
    input_dim: usize,
    hidden_dim: usize,
    weight_ih: Parameter,
    weight_hh: Parameter,
    bias_ih: Parameter,
    bias_hh: Parameter,
    caches: RefCell<Vec<LstmCache>>,
}

#[derive(Debug, Clone)]
struct LstmCache {
    inputs: Vec<f32>,
    gates_i: Vec<f32>,
    gates_f: Vec<f32>,
    gates_g: Vec<f32>,
    gates_o: Vec<f32>,
    hidden_states: Vec<f32>,
    cell_states: Vec<f32>,
    timesteps: usize,
}

impl LstmCache {
    fn new(timesteps: usize, input_dim: usize, hidden_dim: usize) -> Self {
        Self {
            inputs: vec![0.0f32; timesteps * input_dim],
            gates_i: vec![0.0f32; timesteps * hidden_dim],
            gates_f: vec![0.0f32; timesteps * hidden_dim],
            gates_g: vec![0.0f32; timesteps * hidden_dim],
            gates_o: vec![0.0f32; timesteps * hidden_dim],
            hidden_states: vec![0.0f32; (timesteps + 1) * hidden_dim],
            cell_states: vec![0.0f32; (timesteps + 1) * hidden_dim],
            timesteps,
        }
    }
}

impl Lstm {
    /// Creates a new LSTM layer. Weights draw from uniform(-1/sqrt(H),
    /// 1/sqrt(H)), biases start at zero.
    pub fn new(
        name: impl Into<String>,
        input_dim: usize,
        hidden_dim: usize,
        rng: &mut StdRng,
    ) -> PureResult<Self> {
        if input_dim == 0 || hidden_dim == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: input_dim,
                cols: hidden_dim,
            });
        }
        let name = name.into();
        let bound = 1.0 / (hidden_dim as f32).sqrt();
        let weight_ih = Tensor::random_uniform(input_dim, 4 * hidden_dim, -bound, bound, rng)?;
        let weight_hh = Tensor::random_uniform(hidden_dim, 4 * hidden_dim, -bound, bound, rng)?;
        let bias_ih = Tensor::zeros(1, 4 * hidden_dim)?;
        let bias_hh = Tensor::zeros(1, 4 * hidden_dim)?;
        Ok(Self {
            input_dim,
            hidden_dim,
            weight_ih: Parameter::new(format!("{name}::weight_ih"), weight_ih),
            weight_hh: Parameter::new(format!("{name}::weight_hh"), weight_hh),
            bias_ih: Parameter::new(format!("{name}::bias_ih"), bias_ih),
            bias_hh: Parameter::new(format!("{name}::bias_hh"), bias_hh),
            caches: RefCell::new(Vec::new()),
        })
    }

    /// Returns the hidden width of the layer.
    pub fn hidden_dim(&self) -> usize {
        self.hidden_dim
    }

    /// Drops any caches left over from forward passes that were never
    /// propagated backwards (validation and artifact passes).
    pub fn clear_caches(&self) {
        self.caches.borrow_mut().clear();
    }

    fn guard_input(&self, input: &Tensor) -> PureResult<()> {
        let (rows, cols) = input.shape();
        if cols != self.input_dim {
            return Err(TensorError::ShapeMismatch {
                left: (rows, cols),
                right: (rows, self.input_dim),
            });
        }
        if rows == 0 {
            return Err(TensorError::EmptyInput("lstm_forward"));
        }
        Ok(())
    }
}

impl ParameterHost for Lstm {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&self.weight_ih)?;
        visitor(&self.weight_hh)?;
        visitor(&self.bias_ih)?;
        visitor(&self.bias_hh)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&mut self.weight_ih)?;
        visitor(&mut self.weight_hh)?;
        visitor(&mut self.bias_ih)?;
        visitor(&mut self.bias_hh)
    }
}

impl Module for Lstm {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        self.guard_input(input)?;
        let (timesteps, _) = input.shape();
        let hidden_dim = self.hidden_dim;
        let input_dim = self.input_dim;
        let mut output = vec![0.0f32; timesteps * hidden_dim];
        let mut hidden_prev = vec![0.0f32; hidden_dim];
        let mut cell_prev = vec![0.0f32; hidden_dim];
        let mut cache = LstmCache::new(timesteps, input_dim, hidden_dim);
        let weight_ih = self.weight_ih.value();
        let weight_hh = self.weight_hh.value();
        let bias_ih = self.bias_ih.value();
        let bias_hh = self.bias_hh.value();
        for t in 0..timesteps {
            let input_slice = &input.data()[t * input_dim..(t + 1) * input_dim];
            cache.inputs[t * input_dim..(t + 1) * input_dim].copy_from_slice(input_slice);
            let mut gates = vec![0.0f32; 4 * hidden_dim];
            for gate in 0..4 * hidden_dim {
                let mut value = bias_ih.data()[gate] + bias_hh.data()[gate];
                for idx in 0..input_dim {
                    value += input_slice[idx] * weight_ih.data()[idx * 4 * hidden_dim + gate];
                }
                for idx in 0..hidden_dim {
                    value += hidden_prev[idx] * weight_hh.data()[idx * 4 * hidden_dim + gate];
                }
                gates[gate] = value;
            }
            for unit in 0..hidden_dim {
                let gi = sigmoid(gates[unit]);
                let gf = sigmoid(gates[hidden_dim + unit]);
                let gg = gates[2 * hidden_dim + unit].tanh();
                let go = sigmoid(gates[3 * hidden_dim + unit]);
                let cell = gf * cell_prev[unit] + gi * gg;
                let hidden = go * cell.tanh();
                cache.gates_i[t * hidden_dim + unit] = gi;
                cache.gates_f[t * hidden_dim + unit] = gf;
                cache.gates_g[t * hidden_dim + unit] = gg;
                cache.gates_o[t * hidden_dim + unit] = go;
                cache.cell_states[(t + 1) * hidden_dim + unit] = cell;
                cache.hidden_states[(t + 1) * hidden_dim + unit] = hidden;
                cell_prev[unit] = cell;
                hidden_prev[unit] = hidden;
                output[t * hidden_dim + unit] = hidden;
            }
        }
        self.caches.borrow_mut().push(cache);
        Tensor::from_vec(timesteps, hidden_dim, output)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        self.guard_input(input)?;
        if grad_output.shape().0 != input.shape().0 || grad_output.shape().1 != self.hidden_dim {
            return Err(TensorError::ShapeMismatch {
                left: grad_output.shape(),
                right: (input.shape().0, self.hidden_dim),
            });
        }
        let cache = self
            .caches
            .borrow_mut()
            .pop()
            .ok_or(TensorError::InvalidValue {
                label: "lstm_cache_missing",
            })?;
        let timesteps = cache.timesteps;
        let input_dim = self.input_dim;
        let hidden_dim = self.hidden_dim;
        let weight_ih = self.weight_ih.value();
        let weight_hh = self.weight_hh.value();
        let mut grad_input = vec![0.0f32; timesteps * input_dim];
        let mut grad_w_ih = vec![0.0f32; input_dim * 4 * hidden_dim];
        let mut grad_w_hh = vec![0.0f32; hidden_dim * 4 * hidden_dim];
        let mut grad_b_ih = vec![0.0f32; 4 * hidden_dim];
        let mut grad_b_hh = vec![0.0f32; 4 * hidden_dim];
        let mut grad_h_next = vec![0.0f32; hidden_dim];
        let mut grad_c_next = vec![0.0f32; hidden_dim];
        for step in (0..timesteps).rev() {
            let grad_hidden_slice = &grad_output.data()[step * hidden_dim..(step + 1) * hidden_dim];
            let prev_hidden = &cache.hidden_states[step * hidden_dim..(step + 1) * hidden_dim];
            let prev_cell = &cache.cell_states[step * hidden_dim..(step + 1) * hidden_dim];
            let curr_cell = &cache.cell_states[(step + 1) * hidden_dim..(step + 2) * hidden_dim];
            let mut gate_grad = vec![0.0f32; 4 * hidden_dim];
            for unit in 0..hidden_dim {
                let dh = grad_hidden_slice[unit] + grad_h_next[unit];
                let o = cache.gates_o[step * hidden_dim + unit];
                let i = cache.gates_i[step * hidden_dim + unit];
                let f = cache.gates_f[step * hidden_dim + unit];
                let g = cache.gates_g[step * hidden_dim + unit];
                let tanh_c = curr_cell[unit].tanh();
                let do_gate = dh * tanh_c * o * (1.0 - o);
                let dc = dh * o * (1.0 - tanh_c * tanh_c) + grad_c_next[unit];
                let di = dc * g * i * (1.0 - i);
                let dg = dc * i * (1.0 - g * g);
                let df = dc * prev_cell[unit] * f * (1.0 - f);
                grad_c_next[unit] = dc * f;
                gate_grad[unit] = di;
                gate_grad[hidden_dim + unit] = df;
                gate_grad[2 * hidden_dim + unit] = dg;
                gate_grad[3 * hidden_dim + unit] = do_gate;
            }
            for gate in 0..4 * hidden_dim {
                grad_b_ih[gate] += gate_grad[gate];
                grad_b_hh[gate] += gate_grad[gate];
            }
            for input_idx in 0..input_dim {
                let mut acc = 0.0f32;
                for gate in 0..4 * hidden_dim {
                    acc += gate_grad[gate] * weight_ih.data()[input_idx * 4 * hidden_dim + gate];
                    grad_w_ih[input_idx * 4 * hidden_dim + gate] +=
                        cache.inputs[step * input_dim + input_idx] * gate_grad[gate];
                }
                grad_input[step * input_dim + input_idx] = acc;
            }
            let mut next_h = vec![0.0f32; hidden_dim];
            for hidden_idx in 0..hidden_dim {
                let mut acc = 0.0f32;
                for gate in 0..4 * hidden_dim {
                    acc += gate_grad[gate] * weight_hh.data()[hidden_idx * 4 * hidden_dim + gate];
                    grad_w_hh[hidden_idx * 4 * hidden_dim + gate] +=
                        prev_hidden[hidden_idx] * gate_grad[gate];
                }
                next_h[hidden_idx] = acc;
            }
            grad_h_next = next_h;
        }
        let grad_w_ih = Tensor::from_vec(input_dim, 4 * hidden_dim, grad_w_ih)?;
        let grad_w_hh = Tensor::from_vec(hidden_dim, 4 * hidden_dim, grad_w_hh)?;
        let grad_b_ih = Tensor::from_vec(1, 4 * hidden_dim, grad_b_ih)?;
        let grad_b_hh = Tensor::from_vec(1, 4 * hidden_dim, grad_b_hh)?;
        self.weight_ih.accumulate(&grad_w_ih)?;
        self.weight_hh.accumulate(&grad_w_hh)?;
        self.bias_ih.accumulate(&grad_b_ih)?;
        self.bias_hh.accumulate(&grad_b_hh)?;
        Tensor::from_vec(timesteps, input_dim, grad_input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn lstm_forward_produces_hidden_sequence() {
        let mut rng = StdRng::seed_from_u64(11);
        let lstm = Lstm::new("lstm", 2, 3, &mut rng).unwrap();
        let input = Tensor::from_vec(4, 2, vec![0.1, 0.2, -0.3, 0.4, 0.5, -0.6, 0.7, 0.8]).unwrap();
        let output = lstm.forward(&input).unwrap();
        assert_eq!(output.shape(), (4, 3));
        for value in output.data() {
            assert!(value.is_finite());
        }
    }

    #[test]
    fn lstm_backward_accumulates_gradients() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut lstm = Lstm::new("lstm", 3, 2, &mut rng).unwrap();
        let input =
            Tensor::from_vec(3, 3, vec![0.2, -0.1, 0.3, 0.4, -0.5, 0.6, -0.2, 0.1, 0.7]).unwrap();
        let grad_out = Tensor::from_vec(3, 2, vec![0.1, -0.2, 0.3, 0.2, -0.4, 0.5]).unwrap();
        let _ = lstm.forward(&input).unwrap();
        let grad_input = lstm.backward(&input, &grad_out).unwrap();
        assert_eq!(grad_input.shape(), (3, 3));
        assert!(lstm.weight_ih.gradient().is_some());
        assert!(lstm.bias_hh.gradient().is_some());
    }

    #[test]
    fn lstm_caches_pop_in_reverse_forward_order() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut lstm = Lstm::new("lstm", 2, 2, &mut rng).unwrap();
        let first = Tensor::from_vec(2, 2, vec![0.1, 0.2, 0.3, 0.4]).unwrap();
        let second = Tensor::from_vec(3, 2, vec![0.5, 0.6, 0.7, 0.8, 0.9, 1.0]).unwrap();
        let _ = lstm.forward(&first).unwrap();
        let _ = lstm.forward(&second).unwrap();
        // last forward (3 timesteps) must come back first
        let grad_second = Tensor::zeros(3, 2).unwrap();
        let grad = lstm.backward(&second, &grad_second).unwrap();
        assert_eq!(grad.shape(), (3, 2));
        let grad_first = Tensor::zeros(2, 2).unwrap();
        let grad = lstm.backward(&first, &grad_first).unwrap();
        assert_eq!(grad.shape(), (2, 2));
        assert!(matches!(
            lstm.backward(&first, &grad_first),
            Err(TensorError::InvalidValue {
                label: "lstm_cache_missing"
            })
        ));
    }

    #[test]
    fn lstm_rejects_wrong_feature_width() {
        let mut rng = StdRng::seed_from_u64(11);
        let lstm = Lstm::new("lstm", 3, 2, &mut rng).unwrap();
        let input = Tensor::zeros(4, 2).unwrap();
        assert!(matches!(
            lstm.forward(&input),
            Err(TensorError::ShapeMismatch { .. })
        ));
    }
}
