// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::layers::{LeakyRelu, Linear, Lstm};
use crate::module::{Module, Parameter, ParameterHost};
use crate::vae::VaeConfig;
use crate::SequenceBatch;
use crate::{PureResult, Tensor, TensorError};
use rand::rngs::StdRng;
use std::cell::RefCell;

struct DecoderCache {
    latent: Tensor,
    pre_activation: Tensor,
    /// Per window: the input sequence fed to each LSTM application, in
    /// application order (loop stages first, final output stage last).
    stage_inputs: Vec<Vec<Tensor>>,
}

/// Hallucinates a full sequence window from a single latent vector.
///
/// The latent is projected to the hidden width, passed through a leaky
/// rectifier, replicated across every timestep (the decoder has no access
/// to per-timestep information), refined by the shared hidden -> hidden
/// loop LSTM `n_layers - 1` times, and emitted through a final LSTM that
/// maps hidden units onto the original feature width.
pub struct SequenceDecoder {
    n_layers: usize,
    seq_len: usize,
    latent_dim: usize,
    linear: Linear,
    activation: LeakyRelu,
    lstm_loop: Lstm,
    lstm_out: Lstm,
    cache: RefCell<Option<DecoderCache>>,
}

impl SequenceDecoder {
    pub fn new(config: &VaeConfig, rng: &mut StdRng) -> PureResult<Self> {
        let linear = Linear::new(
            "decoder::latent_in",
            config.latent_dim,
            config.hidden_features,
            rng,
        )?;
        let activation = LeakyRelu::new(config.negative_slope)?;
        let lstm_loop = Lstm::new(
            "decoder::lstm_loop",
            config.hidden_features,
            config.hidden_features,
            rng,
        )?;
        let lstm_out = Lstm::new(
            "decoder::lstm_out",
            config.hidden_features,
            config.input_features,
            rng,
        )?;
        Ok(Self {
            n_layers: config.n_layers,
            seq_len: config.seq_len,
            latent_dim: config.latent_dim,
            linear,
            activation,
            lstm_loop,
            lstm_out,
            cache: RefCell::new(None),
        })
    }

    /// Decodes `(B, D)` latent samples into B windows of `(T, F)`.
    pub fn forward(&self, latent: &Tensor) -> PureResult<SequenceBatch> {
        if latent.shape().1 != self.latent_dim {
            return Err(TensorError::ShapeMismatch {
                left: latent.shape(),
                right: (latent.shape().0, self.latent_dim),
            });
        }
        let hidden_dim = self.lstm_loop.hidden_dim();
        let pre_activation = self.linear.forward(latent)?;
        let activated = self.activation.forward(&pre_activation)?;
        let batch_len = latent.shape().0;
        let mut stage_inputs = Vec::with_capacity(batch_len);
        let mut windows = Vec::with_capacity(batch_len);
        for window_idx in 0..batch_len {
            let seed_row = activated.row(window_idx)?.to_vec();
            let mut sequence =
                Tensor::from_fn(self.seq_len, hidden_dim, |_, col| seed_row[col])?;
            let mut stages = Vec::with_capacity(self.n_layers);
            for _ in 1..self.n_layers {
                stages.push(sequence.clone());
                sequence = self.lstm_loop.forward(&sequence)?;
            }
            stages.push(sequence.clone());
            windows.push(self.lstm_out.forward(&sequence)?);
            stage_inputs.push(stages);
        }
        *self.cache.borrow_mut() = Some(DecoderCache {
            latent: latent.clone(),
            pre_activation,
            stage_inputs,
        });
        SequenceBatch::new(windows)
    }

    /// Routes per-window reconstruction gradients back to `(B, D)` latent
    /// gradients. The replicated timesteps collapse by summation into the
    /// single hidden seed before the activation and projection run backwards.
    pub fn backward(&mut self, grad_windows: &[Tensor]) -> PureResult<Tensor> {
        let cache = self
            .cache
            .borrow_mut()
            .take()
            .ok_or(TensorError::InvalidValue {
                label: "decoder_cache_missing",
            })?;
        if grad_windows.len() != cache.stage_inputs.len() {
            return Err(TensorError::DataLength {
                expected: cache.stage_inputs.len(),
                got: grad_windows.len(),
            });
        }
        let hidden_dim = self.lstm_loop.hidden_dim();
        let batch_len = cache.stage_inputs.len();
        let mut grad_seed = vec![0.0f32; batch_len * hidden_dim];
        for (window_idx, stages) in cache.stage_inputs.iter().enumerate().rev() {
            let last_stage = stages.len() - 1;
            let mut grad_sequence = self
                .lstm_out
                .backward(&stages[last_stage], &grad_windows[window_idx])?;
            for stage in (0..self.n_layers - 1).rev() {
                grad_sequence = self.lstm_loop.backward(&stages[stage], &grad_sequence)?;
            }
            let summed = grad_sequence.sum_axis0();
            grad_seed[window_idx * hidden_dim..(window_idx + 1) * hidden_dim]
                .copy_from_slice(&summed);
        }
        let grad_activated = Tensor::from_vec(batch_len, hidden_dim, grad_seed)?;
        let grad_pre = self
            .activation
            .backward(&cache.pre_activation, &grad_activated)?;
        self.linear.backward(&cache.latent, &grad_pre)
    }

    /// Drops caches from forward passes that will never be propagated
    /// backwards (evaluation and artifact passes).
    pub fn clear_runtime_caches(&self) {
        self.lstm_loop.clear_caches();
        self.lstm_out.clear_caches();
        self.cache.borrow_mut().take();
    }
}

impl ParameterHost for SequenceDecoder {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.linear.visit_parameters(visitor)?;
        self.lstm_loop.visit_parameters(visitor)?;
        self.lstm_out.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.linear.visit_parameters_mut(visitor)?;
        self.lstm_loop.visit_parameters_mut(visitor)?;
        self.lstm_out.visit_parameters_mut(visitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn config(n_layers: usize) -> VaeConfig {
        VaeConfig {
            n_layers,
            input_features: 3,
            hidden_features: 4,
            latent_dim: 2,
            seq_len: 4,
            negative_slope: 0.2,
            seed: Some(23),
        }
    }

    #[test]
    fn decoder_reconstructs_window_shape() {
        let mut rng = StdRng::seed_from_u64(23);
        let decoder = SequenceDecoder::new(&config(2), &mut rng).unwrap();
        let latent = Tensor::from_vec(2, 2, vec![0.1, -0.4, 0.3, 0.9]).unwrap();
        let batch = decoder.forward(&latent).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.window_shape(), (4, 3));
        decoder.clear_runtime_caches();
    }

    #[test]
    fn single_layer_stack_skips_the_loop_lstm() {
        let mut rng = StdRng::seed_from_u64(23);
        let decoder = SequenceDecoder::new(&config(1), &mut rng).unwrap();
        let latent = Tensor::from_vec(1, 2, vec![0.5, -0.5]).unwrap();
        let batch = decoder.forward(&latent).unwrap();
        assert_eq!(batch.window_shape(), (4, 3));
        decoder.clear_runtime_caches();
    }

    #[test]
    fn decoder_rejects_wrong_latent_width() {
        let mut rng = StdRng::seed_from_u64(23);
        let decoder = SequenceDecoder::new(&config(2), &mut rng).unwrap();
        let latent = Tensor::zeros(2, 3).unwrap();
        assert!(matches!(
            decoder.forward(&latent),
            Err(TensorError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn decoder_backward_returns_latent_gradients() {
        let mut rng = StdRng::seed_from_u64(23);
        let mut decoder = SequenceDecoder::new(&config(2), &mut rng).unwrap();
        let latent = Tensor::from_vec(2, 2, vec![0.1, -0.4, 0.3, 0.9]).unwrap();
        let batch = decoder.forward(&latent).unwrap();
        let grads: Vec<Tensor> = batch
            .windows()
            .iter()
            .map(|window| window.scale(0.1).unwrap())
            .collect();
        let grad_latent = decoder.backward(&grads).unwrap();
        assert_eq!(grad_latent.shape(), (2, 2));
        assert!(decoder.linear.weight().gradient().is_some());
    }
}
