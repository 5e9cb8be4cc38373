// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::dataset::SequenceBatch;
use crate::vae::VaeOutput;
use crate::{PureResult, TensorError};

/// How the ELBO combines reconstruction error and KL divergence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LossReduction {
    /// Mean over examples of (squared reconstruction error + KL).
    #[default]
    PerExampleMean,
    /// Legacy parity: the reconstruction error is summed over the whole
    /// batch without dividing by the batch size, while KL stays
    /// per-example before the final mean.
    BatchSum,
}

/// Evidence-lower-bound objective over a batch and its model output.
#[derive(Debug, Clone, Copy, Default)]
pub struct ElboLoss {
    reduction: LossReduction,
}

impl ElboLoss {
    /// Creates a loss with the requested reduction.
    pub fn new(reduction: LossReduction) -> Self {
        Self { reduction }
    }

    /// Returns the configured reduction.
    pub fn reduction(&self) -> LossReduction {
        self.reduction
    }

    /// Computes the scalar loss. A non-finite result is reported as numeric
    /// divergence rather than handed to the optimizer.
    pub fn value(&self, batch: &SequenceBatch, output: &VaeOutput) -> PureResult<f32> {
        let batch_len = batch.len();
        if output.reconstruction.len() != batch_len {
            return Err(TensorError::DataLength {
                expected: batch_len,
                got: output.reconstruction.len(),
            });
        }
        if output.kl.shape() != (batch_len, 1) {
            return Err(TensorError::ShapeMismatch {
                left: output.kl.shape(),
                right: (batch_len, 1),
            });
        }
        let mut recon_total = 0.0f32;
        for (input, recon) in batch
            .windows()
            .iter()
            .zip(output.reconstruction.windows().iter())
        {
            recon_total += input.sub(recon)?.squared_l2_norm();
        }
        let kl_mean = output.kl.data().iter().sum::<f32>() / batch_len as f32;
        let value = match self.reduction {
            LossReduction::PerExampleMean => recon_total / batch_len as f32 + kl_mean,
            LossReduction::BatchSum => recon_total + kl_mean,
        };
        if !value.is_finite() {
            return Err(TensorError::NonFiniteValue {
                label: "elbo_loss",
                value,
            });
        }
        Ok(value)
    }

    /// Scale applied to the reconstruction gradient seed, matching the
    /// reduction used for the forward value.
    pub(crate) fn reconstruction_grad_scale(&self, batch_len: usize) -> f32 {
        match self.reduction {
            LossReduction::PerExampleMean => 1.0 / batch_len as f32,
            LossReduction::BatchSum => 1.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vae::{MotionVae, VaeConfig};
    use crate::Tensor;

    fn model_and_batch() -> (MotionVae, SequenceBatch) {
        let config = VaeConfig {
            n_layers: 1,
            input_features: 3,
            hidden_features: 4,
            latent_dim: 2,
            seq_len: 2,
            negative_slope: 0.2,
            seed: Some(5),
        };
        let mut model = MotionVae::new(config).unwrap();
        model.set_training(false);
        let windows = (0..2)
            .map(|i| Tensor::from_fn(2, 3, |t, f| (i * 2 + t + f) as f32 * 0.1).unwrap())
            .collect();
        (model, SequenceBatch::new(windows).unwrap())
    }

    #[test]
    fn loss_is_finite_and_positive_on_real_batches() {
        let (model, batch) = model_and_batch();
        let output = model.forward(&batch).unwrap();
        let value = ElboLoss::default().value(&batch, &output).unwrap();
        assert!(value.is_finite());
        assert!(value >= 0.0);
    }

    #[test]
    fn grad_scale_follows_reduction() {
        assert!(
            (ElboLoss::new(LossReduction::PerExampleMean).reconstruction_grad_scale(4) - 0.25)
                .abs()
                < 1e-7
        );
        assert!(
            (ElboLoss::new(LossReduction::BatchSum).reconstruction_grad_scale(4) - 1.0).abs()
                < 1e-7
        );
    }

    #[test]
    fn loss_rejects_mismatched_outputs() {
        let (model, batch) = model_and_batch();
        let output = model.forward(&batch).unwrap();
        let single = SequenceBatch::new(vec![batch.windows()[0].clone()]).unwrap();
        assert!(matches!(
            ElboLoss::default().value(&single, &output),
            Err(TensorError::DataLength { .. })
        ));
    }
}
