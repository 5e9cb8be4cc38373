// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::module::{Module, Parameter, ParameterHost};
use crate::{PureResult, Tensor, TensorError};

/// Leaky rectifier. Stateless, so it does not participate in parameter
/// visits.
#[derive(Debug, Clone, Copy)]
pub struct LeakyRelu {
    negative_slope: f32,
}

impl LeakyRelu {
    /// Creates a new leaky ReLU with the given negative-side slope.
    pub fn new(negative_slope: f32) -> PureResult<Self> {
        if !negative_slope.is_finite() || negative_slope < 0.0 {
            return Err(TensorError::InvalidValue {
                label: "negative_slope",
            });
        }
        Ok(Self { negative_slope })
    }

    /// Returns the configured negative-side slope.
    pub fn negative_slope(&self) -> f32 {
        self.negative_slope
    }
}

impl Default for LeakyRelu {
    fn default() -> Self {
        Self {
            negative_slope: 0.2,
        }
    }
}

impl ParameterHost for LeakyRelu {
    fn visit_parameters(
        &self,
        _visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        _visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        Ok(())
    }
}

impl Module for LeakyRelu {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let (rows, cols) = input.shape();
        let slope = self.negative_slope;
        let data = input
            .data()
            .iter()
            .map(|&value| if value > 0.0 { value } else { value * slope })
            .collect();
        Tensor::from_vec(rows, cols, data)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        if input.shape() != grad_output.shape() {
            return Err(TensorError::ShapeMismatch {
                left: input.shape(),
                right: grad_output.shape(),
            });
        }
        let (rows, cols) = input.shape();
        let slope = self.negative_slope;
        let data = input
            .data()
            .iter()
            .zip(grad_output.data().iter())
            .map(|(&value, &grad)| if value > 0.0 { grad } else { grad * slope })
            .collect();
        Tensor::from_vec(rows, cols, data)
    }
}
