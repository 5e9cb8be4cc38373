// SPDX-License-Identifier: AGPL-3.0-or-later

//! Sequence variational autoencoder over motion-capture windows.

pub mod decoder;
pub mod encoder;

pub use decoder::SequenceDecoder;
pub use encoder::{reparameterize, SequenceEncoder};

use crate::loss::ElboLoss;
use crate::module::{Parameter, ParameterHost};
use crate::SequenceBatch;
use crate::{PureResult, Tensor, TensorError};

/// Model hyperparameters. Defaults mirror the dancer-capture setup: 128-step
/// windows of 53 joints (159 flattened coordinates), 32 hidden units, and a
/// 32-dimensional latent.
#[derive(Debug, Clone)]
pub struct VaeConfig {
    /// Depth of the recurrent stacks (>= 1).
    pub n_layers: usize,
    /// Flattened feature width F = 3 * joint_count.
    pub input_features: usize,
    /// Hidden width H of every recurrent layer.
    pub hidden_features: usize,
    /// Latent dimension D.
    pub latent_dim: usize,
    /// Window length T in timesteps.
    pub seq_len: usize,
    /// Negative-side slope of the decoder's rectifier.
    pub negative_slope: f32,
    /// Explicit seed for weight initialisation and latent sampling.
    /// `None` defers to the workspace determinism policy.
    pub seed: Option<u64>,
}

impl Default for VaeConfig {
    fn default() -> Self {
        Self {
            n_layers: 2,
            input_features: 3 * 53,
            hidden_features: 32,
            latent_dim: 32,
            seq_len: 128,
            negative_slope: 0.2,
            seed: None,
        }
    }
}

impl VaeConfig {
    /// Validates the configuration before any allocation happens.
    pub fn validate(&self) -> PureResult<()> {
        if self.n_layers == 0 {
            return Err(TensorError::InvalidValue { label: "n_layers" });
        }
        if self.input_features == 0 || self.hidden_features == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: self.input_features,
                cols: self.hidden_features,
            });
        }
        if self.latent_dim == 0 || self.seq_len == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: self.seq_len,
                cols: self.latent_dim,
            });
        }
        if !self.negative_slope.is_finite() || self.negative_slope < 0.0 {
            return Err(TensorError::InvalidValue {
                label: "negative_slope",
            });
        }
        Ok(())
    }
}

/// Everything one forward pass produces. The KL divergence travels with the
/// rest of the outputs instead of living in a mutable model field.
#[derive(Debug, Clone)]
pub struct VaeOutput {
    /// Reconstructed windows, shaped exactly like the input batch.
    pub reconstruction: SequenceBatch,
    /// Latent samples, `(B, D)`.
    pub latent: Tensor,
    /// Posterior means, `(B, D)`.
    pub mean: Tensor,
    /// Posterior log-variances, `(B, D)`.
    pub logvar: Tensor,
    /// Per-example KL divergence against the standard-normal prior, `(B, 1)`.
    pub kl: Tensor,
}

/// Per-example KL divergence of a diagonal Gaussian posterior against the
/// standard-normal prior, summed over latent dimensions:
/// `KL_b = -0.5 * sum_d (1 + logvar - mean^2 - exp(logvar))`.
/// An overflowing exponential is reported as numeric divergence.
pub fn kl_divergence(mean: &Tensor, logvar: &Tensor) -> PureResult<Tensor> {
    if mean.shape() != logvar.shape() {
        return Err(TensorError::ShapeMismatch {
            left: mean.shape(),
            right: logvar.shape(),
        });
    }
    let (rows, cols) = mean.shape();
    let mut divergences = Vec::with_capacity(rows);
    for row in 0..rows {
        let mut acc = 0.0f32;
        for col in 0..cols {
            let mu = mean.data()[row * cols + col];
            let lv = logvar.data()[row * cols + col];
            let var = lv.exp();
            if !var.is_finite() {
                return Err(TensorError::NonFiniteValue {
                    label: "kl_divergence",
                    value: lv,
                });
            }
            acc += 1.0 + lv - mu * mu - var;
        }
        divergences.push(-0.5 * acc);
    }
    Tensor::from_vec(rows, 1, divergences)
}

/// Encoder/decoder pair with the full differentiable path between them.
pub struct MotionVae {
    config: VaeConfig,
    encoder: SequenceEncoder,
    decoder: SequenceDecoder,
    training: bool,
}

impl MotionVae {
    /// Builds the model, drawing every initial weight from the configured
    /// seed (or the workspace determinism policy when no seed is given).
    pub fn new(config: VaeConfig) -> PureResult<Self> {
        config.validate()?;
        let mut rng = mocap_config::rng_from_optional(config.seed, "motion-vae");
        let encoder = SequenceEncoder::new(&config, &mut rng)?;
        let decoder = SequenceDecoder::new(&config, &mut rng)?;
        Ok(Self {
            config,
            encoder,
            decoder,
            training: true,
        })
    }

    /// Returns the model configuration.
    pub fn config(&self) -> &VaeConfig {
        &self.config
    }

    /// Switches between stochastic training behaviour and deterministic
    /// evaluation behaviour.
    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    /// Returns `true` while the model is in training mode.
    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Runs the full pass: encode, diverge, decode.
    ///
    /// In training mode the layer caches stay armed for a matching
    /// [`MotionVae::backward`]; evaluation passes clean up after themselves.
    pub fn forward(&self, batch: &SequenceBatch) -> PureResult<VaeOutput> {
        let (latent, mean, logvar) = self.encoder.forward(batch, self.training)?;
        let kl = kl_divergence(&mean, &logvar)?;
        let reconstruction = self.decoder.forward(&latent)?;
        if !self.training {
            self.encoder.clear_runtime_caches();
            self.decoder.clear_runtime_caches();
        }
        Ok(VaeOutput {
            reconstruction,
            latent,
            mean,
            logvar,
            kl,
        })
    }

    /// Accumulates gradients of the ELBO loss into every parameter.
    ///
    /// Seeds the reconstruction gradient according to the loss reduction,
    /// routes it through the decoder, adds the KL gradients at the heads,
    /// and finishes through the encoder stack.
    pub fn backward(
        &mut self,
        batch: &SequenceBatch,
        output: &VaeOutput,
        loss: &ElboLoss,
    ) -> PureResult<()> {
        let recon_scale = loss.reconstruction_grad_scale(batch.len());
        let kl_scale = 1.0 / batch.len() as f32;
        let mut grad_windows = Vec::with_capacity(batch.len());
        for (input, recon) in batch
            .windows()
            .iter()
            .zip(output.reconstruction.windows().iter())
        {
            grad_windows.push(recon.sub(input)?.scale(2.0 * recon_scale)?);
        }
        let grad_latent = self.decoder.backward(&grad_windows)?;
        let grad_mean = output.mean.scale(kl_scale)?;
        let (rows, cols) = output.logvar.shape();
        let grad_logvar_data = output
            .logvar
            .data()
            .iter()
            .map(|&lv| 0.5 * (lv.exp() - 1.0) * kl_scale)
            .collect();
        let grad_logvar = Tensor::from_vec(rows, cols, grad_logvar_data)?;
        self.encoder.backward(&grad_latent, &grad_mean, &grad_logvar)
    }
}

impl ParameterHost for MotionVae {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.encoder.visit_parameters(visitor)?;
        self.decoder.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.encoder.visit_parameters_mut(visitor)?;
        self.decoder.visit_parameters_mut(visitor)
    }
}
