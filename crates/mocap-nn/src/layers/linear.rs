// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::module::{Module, Parameter, ParameterHost};
use crate::{PureResult, Tensor, TensorError};
use rand::rngs::StdRng;

/// Fully-connected layer. Weights are Xavier-normal, biases start at zero.
#[derive(Debug)]
pub struct Linear {
    weight: Parameter,
    bias: Parameter,
}

impl Linear {
    /// Creates a new linear layer drawing its weights from `rng`.
    pub fn new(
        name: impl Into<String>,
        input_dim: usize,
        output_dim: usize,
        rng: &mut StdRng,
    ) -> PureResult<Self> {
        if input_dim == 0 || output_dim == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: input_dim,
                cols: output_dim,
            });
        }
        let name = name.into();
        let weight = Tensor::xavier_normal(input_dim, output_dim, rng)?;
        let bias = Tensor::zeros(1, output_dim)?;
        Ok(Self {
            weight: Parameter::new(format!("{name}::weight"), weight),
            bias: Parameter::new(format!("{name}::bias"), bias),
        })
    }

    /// Returns a reference to the weight parameter.
    pub fn weight(&self) -> &Parameter {
        &self.weight
    }

    /// Returns a reference to the bias parameter.
    pub fn bias(&self) -> &Parameter {
        &self.bias
    }
}

impl ParameterHost for Linear {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&self.weight)?;
        visitor(&self.bias)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&mut self.weight)?;
        visitor(&mut self.bias)
    }
}

impl Module for Linear {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        if input.shape().1 != self.weight.value().shape().0 {
            return Err(TensorError::ShapeMismatch {
                left: input.shape(),
                right: self.weight.value().shape(),
            });
        }
        let mut out = input.matmul(self.weight.value())?;
        out.add_row_inplace(self.bias.value().data())?;
        Ok(out)
    }

    // Accumulates the exact gradient; any batch reduction lives in the loss.
    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        if input.shape().0 != grad_output.shape().0 {
            return Err(TensorError::ShapeMismatch {
                left: input.shape(),
                right: grad_output.shape(),
            });
        }
        let grad_w = input.transpose().matmul(grad_output)?;
        self.weight.accumulate(&grad_w)?;

        let summed = grad_output.sum_axis0();
        let grad_b = Tensor::from_vec(1, summed.len(), summed)?;
        self.bias.accumulate(&grad_b)?;

        grad_output.matmul(&self.weight.value().transpose())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn linear_forward_matches_manual() {
        let mut rng = StdRng::seed_from_u64(5);
        let layer = Linear::new("fc", 3, 2, &mut rng).unwrap();
        let input = Tensor::from_vec(1, 3, vec![1.0, -2.0, 0.5]).unwrap();
        let output = layer.forward(&input).unwrap();
        let mut expected = input.matmul(layer.weight().value()).unwrap();
        expected
            .add_row_inplace(layer.bias().value().data())
            .unwrap();
        assert_eq!(output, expected);
    }

    #[test]
    fn linear_backward_accumulates_exact_gradients() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut layer = Linear::new("fc", 2, 2, &mut rng).unwrap();
        let input = Tensor::from_vec(2, 2, vec![1.0, 0.0, 0.0, 1.0]).unwrap();
        let grad_out = Tensor::from_vec(2, 2, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let grad_in = layer.backward(&input, &grad_out).unwrap();
        assert_eq!(grad_in.shape(), (2, 2));
        // identity input: grad_w equals grad_out, grad_b its column sums
        assert_eq!(layer.weight().gradient().unwrap().data(), grad_out.data());
        assert_eq!(layer.bias().gradient().unwrap().data(), &[4.0, 6.0]);
    }
}
