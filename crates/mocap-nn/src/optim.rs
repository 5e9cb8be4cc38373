// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::module::ParameterHost;
use crate::{PureResult, TensorError};

/// Plain stochastic gradient descent over accumulated parameter gradients.
#[derive(Debug, Clone, Copy)]
pub struct Sgd {
    learning_rate: f32,
}

impl Sgd {
    /// Creates a new optimizer, validating the learning rate.
    pub fn new(learning_rate: f32) -> PureResult<Self> {
        if learning_rate <= 0.0 || !learning_rate.is_finite() {
            return Err(TensorError::NonPositiveLearningRate {
                rate: learning_rate,
            });
        }
        Ok(Self { learning_rate })
    }

    /// Returns the configured learning rate.
    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    /// Overrides the learning rate.
    pub fn set_learning_rate(&mut self, learning_rate: f32) -> PureResult<()> {
        if learning_rate <= 0.0 || !learning_rate.is_finite() {
            return Err(TensorError::NonPositiveLearningRate {
                rate: learning_rate,
            });
        }
        self.learning_rate = learning_rate;
        Ok(())
    }

    /// Clears accumulated gradients across the host's parameters.
    pub fn zero_grad<H: ParameterHost>(&self, host: &mut H) -> PureResult<()> {
        host.zero_accumulators()
    }

    /// Applies one descent step and clears the consumed gradients.
    pub fn step<H: ParameterHost>(&mut self, host: &mut H) -> PureResult<()> {
        host.apply_step(self.learning_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::Linear;
    use crate::module::Module;
    use crate::Tensor;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn sgd_rejects_bad_learning_rates() {
        assert!(matches!(
            Sgd::new(0.0),
            Err(TensorError::NonPositiveLearningRate { .. })
        ));
        assert!(matches!(
            Sgd::new(f32::NAN),
            Err(TensorError::NonPositiveLearningRate { .. })
        ));
    }

    #[test]
    fn sgd_updates_parameters() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut layer = Linear::new("fc", 2, 1, &mut rng).unwrap();
        let mut optimizer = Sgd::new(0.1).unwrap();
        let input = Tensor::from_vec(1, 2, vec![1.0, -1.0]).unwrap();
        let grad = Tensor::from_vec(1, 1, vec![0.5]).unwrap();
        let _ = layer.backward(&input, &grad).unwrap();
        let before = layer.weight().value().clone();
        optimizer.step(&mut layer).unwrap();
        assert_ne!(before, *layer.weight().value());
        optimizer.zero_grad(&mut layer).unwrap();
        assert_eq!(layer.weight().gradient().unwrap().squared_l2_norm(), 0.0);
    }
}
