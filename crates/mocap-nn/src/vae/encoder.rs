// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::layers::{Linear, Lstm};
use crate::module::{Module, Parameter, ParameterHost};
use crate::vae::VaeConfig;
use crate::SequenceBatch;
use crate::{PureResult, Tensor, TensorError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use std::cell::RefCell;

/// Samples a latent vector with the reparameterization trick:
/// `sample = mean + noise * exp(0.5 * logvar)` with standard-normal noise.
/// Returns `(sample, noise, std)`; the noise is kept for the backward pass
/// and is never differentiated. A log-variance whose exponential overflows
/// surfaces as a numeric-divergence error instead of a silent infinity.
pub fn reparameterize(
    mean: &Tensor,
    logvar: &Tensor,
    rng: &mut StdRng,
) -> PureResult<(Tensor, Tensor, Tensor)> {
    if mean.shape() != logvar.shape() {
        return Err(TensorError::ShapeMismatch {
            left: mean.shape(),
            right: logvar.shape(),
        });
    }
    let (rows, cols) = mean.shape();
    let mut std_data = Vec::with_capacity(rows * cols);
    for &lv in logvar.data() {
        let std = (0.5 * lv).exp();
        if !std.is_finite() {
            return Err(TensorError::NonFiniteValue {
                label: "latent_std",
                value: lv,
            });
        }
        std_data.push(std);
    }
    let std = Tensor::from_vec(rows, cols, std_data)?;
    let noise = Tensor::from_fn(rows, cols, |_, _| rng.sample(StandardNormal))?;
    let sample = mean.add(&noise.hadamard(&std)?)?;
    Ok((sample, noise, std))
}

struct EncoderCache {
    /// Per window: the input sequence fed to each LSTM application, in
    /// application order (window first, then each loop stage input).
    stage_inputs: Vec<Vec<Tensor>>,
    summaries: Tensor,
    noise: Tensor,
    std: Tensor,
}

/// Summarizes a batch of sequence windows into latent distribution
/// parameters and a reparameterized sample.
///
/// The stack is an input LSTM (features -> hidden) followed by one shared
/// hidden -> hidden LSTM re-applied `n_layers - 1` times; only the final
/// timestep's hidden state of the last application survives as the window
/// summary. Two independent linear heads project the summary to the latent
/// mean and log-variance.
pub struct SequenceEncoder {
    n_layers: usize,
    seq_len: usize,
    input_features: usize,
    lstm_in: Lstm,
    lstm_loop: Lstm,
    mean_head: Linear,
    logvar_head: Linear,
    noise_rng: RefCell<StdRng>,
    cache: RefCell<Option<EncoderCache>>,
}

impl SequenceEncoder {
    pub fn new(config: &VaeConfig, rng: &mut StdRng) -> PureResult<Self> {
        let lstm_in = Lstm::new(
            "encoder::lstm_in",
            config.input_features,
            config.hidden_features,
            rng,
        )?;
        let lstm_loop = Lstm::new(
            "encoder::lstm_loop",
            config.hidden_features,
            config.hidden_features,
            rng,
        )?;
        let mean_head = Linear::new(
            "encoder::mean_head",
            config.hidden_features,
            config.latent_dim,
            rng,
        )?;
        let logvar_head = Linear::new(
            "encoder::logvar_head",
            config.hidden_features,
            config.latent_dim,
            rng,
        )?;
        let noise_rng = StdRng::seed_from_u64(rng.gen());
        Ok(Self {
            n_layers: config.n_layers,
            seq_len: config.seq_len,
            input_features: config.input_features,
            lstm_in,
            lstm_loop,
            mean_head,
            logvar_head,
            noise_rng: RefCell::new(noise_rng),
            cache: RefCell::new(None),
        })
    }

    fn guard_batch(&self, batch: &SequenceBatch) -> PureResult<()> {
        let shape = batch.window_shape();
        if shape != (self.seq_len, self.input_features) {
            return Err(TensorError::ShapeMismatch {
                left: shape,
                right: (self.seq_len, self.input_features),
            });
        }
        Ok(())
    }

    /// Encodes a batch into `(sample, mean, logvar)`, each `(B, D)`.
    /// In training mode the sample is stochastic; in evaluation mode the
    /// posterior mean stands in as a deterministic latent.
    pub fn forward(
        &self,
        batch: &SequenceBatch,
        training: bool,
    ) -> PureResult<(Tensor, Tensor, Tensor)> {
        self.guard_batch(batch)?;
        let hidden = self.lstm_loop.hidden_dim();
        let mut stage_inputs = Vec::with_capacity(batch.len());
        let mut summary_data = Vec::with_capacity(batch.len() * hidden);
        for window in batch.windows() {
            let mut stages = vec![window.clone()];
            let mut sequence = self.lstm_in.forward(window)?;
            for _ in 1..self.n_layers {
                stages.push(sequence.clone());
                sequence = self.lstm_loop.forward(&sequence)?;
            }
            summary_data.extend_from_slice(sequence.row(self.seq_len - 1)?);
            stage_inputs.push(stages);
        }
        let summaries = Tensor::from_vec(batch.len(), hidden, summary_data)?;
        let mean = self.mean_head.forward(&summaries)?;
        let logvar = self.logvar_head.forward(&summaries)?;
        let (sample, noise, std) = if training {
            reparameterize(&mean, &logvar, &mut self.noise_rng.borrow_mut())?
        } else {
            let (rows, cols) = mean.shape();
            (mean.clone(), Tensor::zeros(rows, cols)?, Tensor::zeros(rows, cols)?)
        };
        *self.cache.borrow_mut() = Some(EncoderCache {
            stage_inputs,
            summaries,
            noise,
            std,
        });
        Ok((sample, mean, logvar))
    }

    /// Propagates gradients with respect to the latent sample plus any
    /// direct mean/log-variance gradients (the KL term) back through the
    /// heads and the LSTM stack.
    pub fn backward(
        &mut self,
        grad_sample: &Tensor,
        grad_mean_extra: &Tensor,
        grad_logvar_extra: &Tensor,
    ) -> PureResult<()> {
        let cache = self
            .cache
            .borrow_mut()
            .take()
            .ok_or(TensorError::InvalidValue {
                label: "encoder_cache_missing",
            })?;
        let grad_mean = grad_sample.add(grad_mean_extra)?;
        let grad_logvar = grad_sample
            .hadamard(&cache.noise)?
            .hadamard(&cache.std)?
            .scale(0.5)?
            .add(grad_logvar_extra)?;
        let grad_from_mean = self.mean_head.backward(&cache.summaries, &grad_mean)?;
        let grad_from_logvar = self.logvar_head.backward(&cache.summaries, &grad_logvar)?;
        let grad_summary = grad_from_mean.add(&grad_from_logvar)?;
        let hidden = self.lstm_loop.hidden_dim();
        for (window_idx, stages) in cache.stage_inputs.iter().enumerate().rev() {
            let mut grad_sequence = Tensor::zeros(self.seq_len, hidden)?;
            let last = self.seq_len - 1;
            let summary_row = grad_summary.row(window_idx)?.to_vec();
            grad_sequence.data_mut()[last * hidden..(last + 1) * hidden]
                .copy_from_slice(&summary_row);
            for stage in (1..self.n_layers).rev() {
                grad_sequence = self.lstm_loop.backward(&stages[stage], &grad_sequence)?;
            }
            self.lstm_in.backward(&stages[0], &grad_sequence)?;
        }
        Ok(())
    }

    /// Drops caches from forward passes that will never be propagated
    /// backwards (evaluation and artifact passes).
    pub fn clear_runtime_caches(&self) {
        self.lstm_in.clear_caches();
        self.lstm_loop.clear_caches();
        self.cache.borrow_mut().take();
    }
}

impl ParameterHost for SequenceEncoder {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.lstm_in.visit_parameters(visitor)?;
        self.lstm_loop.visit_parameters(visitor)?;
        self.mean_head.visit_parameters(visitor)?;
        self.logvar_head.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.lstm_in.visit_parameters_mut(visitor)?;
        self.lstm_loop.visit_parameters_mut(visitor)?;
        self.mean_head.visit_parameters_mut(visitor)?;
        self.logvar_head.visit_parameters_mut(visitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> VaeConfig {
        VaeConfig {
            n_layers: 2,
            input_features: 3,
            hidden_features: 4,
            latent_dim: 2,
            seq_len: 4,
            negative_slope: 0.2,
            seed: Some(17),
        }
    }

    fn batch(b: usize) -> SequenceBatch {
        let windows = (0..b)
            .map(|i| Tensor::from_fn(4, 3, |t, f| (i + t + f) as f32 * 0.05).unwrap())
            .collect();
        SequenceBatch::new(windows).unwrap()
    }

    #[test]
    fn encoder_outputs_latent_shapes() {
        let mut rng = StdRng::seed_from_u64(17);
        let encoder = SequenceEncoder::new(&config(), &mut rng).unwrap();
        let (sample, mean, logvar) = encoder.forward(&batch(3), true).unwrap();
        assert_eq!(sample.shape(), (3, 2));
        assert_eq!(mean.shape(), (3, 2));
        assert_eq!(logvar.shape(), (3, 2));
    }

    #[test]
    fn encoder_rejects_mismatched_windows() {
        let mut rng = StdRng::seed_from_u64(17);
        let encoder = SequenceEncoder::new(&config(), &mut rng).unwrap();
        let wrong = SequenceBatch::new(vec![Tensor::zeros(4, 5).unwrap()]).unwrap();
        assert!(matches!(
            encoder.forward(&wrong, true),
            Err(TensorError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn reparameterize_collapses_to_mean_at_tiny_variance() {
        let mut rng = StdRng::seed_from_u64(3);
        let mean = Tensor::from_vec(2, 2, vec![0.5, -1.0, 2.0, 0.25]).unwrap();
        let logvar = Tensor::from_fn(2, 2, |_, _| -80.0).unwrap();
        let (sample, _, _) = reparameterize(&mean, &logvar, &mut rng).unwrap();
        for (got, want) in sample.data().iter().zip(mean.data().iter()) {
            assert!((got - want).abs() < 1e-6);
        }
    }

    #[test]
    fn reparameterize_flags_overflowing_logvar() {
        let mut rng = StdRng::seed_from_u64(3);
        let mean = Tensor::zeros(1, 2).unwrap();
        let logvar = Tensor::from_fn(1, 2, |_, _| 400.0).unwrap();
        assert!(matches!(
            reparameterize(&mean, &logvar, &mut rng),
            Err(TensorError::NonFiniteValue {
                label: "latent_std",
                ..
            })
        ));
    }

    #[test]
    fn eval_mode_returns_the_posterior_mean() {
        let mut rng = StdRng::seed_from_u64(17);
        let encoder = SequenceEncoder::new(&config(), &mut rng).unwrap();
        let (sample, mean, _) = encoder.forward(&batch(2), false).unwrap();
        assert_eq!(sample, mean);
        encoder.clear_runtime_caches();
    }
}
