// SPDX-License-Identifier: AGPL-3.0-or-later

//! Dense row-major 2-D `f32` tensor used throughout the mocap-vae workspace.
//!
//! The surface is intentionally small: fallible constructors, the handful of
//! operators the neural layers need, and an error taxonomy that keeps shape
//! violations out of panic territory.

mod error;

pub use error::{PureResult, TensorError};

use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::StandardNormal;
use serde::Serialize;

/// Row-major matrix of `f32` values.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Tensor {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl Tensor {
    /// Creates a tensor filled with zeros.
    pub fn zeros(rows: usize, cols: usize) -> PureResult<Self> {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        Ok(Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        })
    }

    /// Creates a tensor from an owning vector laid out row-major.
    pub fn from_vec(rows: usize, cols: usize, data: Vec<f32>) -> PureResult<Self> {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        if data.len() != rows * cols {
            return Err(TensorError::DataLength {
                expected: rows * cols,
                got: data.len(),
            });
        }
        Ok(Self { rows, cols, data })
    }

    /// Creates a tensor by evaluating `f(row, col)` for every element.
    pub fn from_fn<F>(rows: usize, cols: usize, mut f: F) -> PureResult<Self>
    where
        F: FnMut(usize, usize) -> f32,
    {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        let mut data = Vec::with_capacity(rows * cols);
        for row in 0..rows {
            for col in 0..cols {
                data.push(f(row, col));
            }
        }
        Ok(Self { rows, cols, data })
    }

    /// Fills a tensor with samples drawn uniformly from `[low, high)`.
    pub fn random_uniform(
        rows: usize,
        cols: usize,
        low: f32,
        high: f32,
        rng: &mut StdRng,
    ) -> PureResult<Self> {
        if !(low.is_finite() && high.is_finite()) || low >= high {
            return Err(TensorError::InvalidValue {
                label: "uniform_bounds",
            });
        }
        Self::from_fn(rows, cols, |_, _| rng.gen_range(low..high))
    }

    /// Xavier/Glorot-normal initialisation: zero-mean Gaussian with
    /// `std = sqrt(2 / (fan_in + fan_out))` where `fan_in = rows` and
    /// `fan_out = cols`.
    pub fn xavier_normal(rows: usize, cols: usize, rng: &mut StdRng) -> PureResult<Self> {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        let std = (2.0 / (rows + cols) as f32).sqrt();
        Self::from_fn(rows, cols, |_, _| {
            let eps: f32 = rng.sample(StandardNormal);
            eps * std
        })
    }

    /// Returns the `(rows, cols)` shape.
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Returns the number of stored elements.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` when the tensor stores no elements.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Immutable view of the underlying row-major buffer.
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Mutable view of the underlying row-major buffer.
    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Borrows one row as a slice.
    pub fn row(&self, row: usize) -> PureResult<&[f32]> {
        if row >= self.rows {
            return Err(TensorError::IndexOutOfRange {
                index: row,
                len: self.rows,
            });
        }
        Ok(&self.data[row * self.cols..(row + 1) * self.cols])
    }

    /// Naive row-major matrix product.
    pub fn matmul(&self, other: &Tensor) -> PureResult<Tensor> {
        if self.cols != other.rows {
            return Err(TensorError::ShapeMismatch {
                left: self.shape(),
                right: other.shape(),
            });
        }
        let mut out = vec![0.0f32; self.rows * other.cols];
        for i in 0..self.rows {
            for k in 0..self.cols {
                let lhs = self.data[i * self.cols + k];
                if lhs == 0.0 {
                    continue;
                }
                let row = &other.data[k * other.cols..(k + 1) * other.cols];
                let dst = &mut out[i * other.cols..(i + 1) * other.cols];
                for (dst_value, rhs) in dst.iter_mut().zip(row.iter()) {
                    *dst_value += lhs * rhs;
                }
            }
        }
        Tensor::from_vec(self.rows, other.cols, out)
    }

    /// Elementwise sum.
    pub fn add(&self, other: &Tensor) -> PureResult<Tensor> {
        self.zip_with(other, |a, b| a + b)
    }

    /// Elementwise difference.
    pub fn sub(&self, other: &Tensor) -> PureResult<Tensor> {
        self.zip_with(other, |a, b| a - b)
    }

    /// Elementwise product.
    pub fn hadamard(&self, other: &Tensor) -> PureResult<Tensor> {
        self.zip_with(other, |a, b| a * b)
    }

    /// Multiplies every element by a scalar.
    pub fn scale(&self, value: f32) -> PureResult<Tensor> {
        Tensor::from_vec(
            self.rows,
            self.cols,
            self.data.iter().map(|entry| entry * value).collect(),
        )
    }

    /// Adds `scale * other` into `self` in place.
    pub fn add_scaled(&mut self, other: &Tensor, scale: f32) -> PureResult<()> {
        if self.shape() != other.shape() {
            return Err(TensorError::ShapeMismatch {
                left: self.shape(),
                right: other.shape(),
            });
        }
        for (dst, src) in self.data.iter_mut().zip(other.data.iter()) {
            *dst += scale * src;
        }
        Ok(())
    }

    /// Adds a bias row to every row of the tensor.
    pub fn add_row_inplace(&mut self, bias: &[f32]) -> PureResult<()> {
        if bias.len() != self.cols {
            return Err(TensorError::DataLength {
                expected: self.cols,
                got: bias.len(),
            });
        }
        for row in self.data.chunks_mut(self.cols) {
            for (dst, src) in row.iter_mut().zip(bias.iter()) {
                *dst += src;
            }
        }
        Ok(())
    }

    /// Returns the transposed tensor.
    pub fn transpose(&self) -> Tensor {
        let mut data = vec![0.0f32; self.data.len()];
        for row in 0..self.rows {
            for col in 0..self.cols {
                data[col * self.rows + row] = self.data[row * self.cols + col];
            }
        }
        Tensor {
            rows: self.cols,
            cols: self.rows,
            data,
        }
    }

    /// Reinterprets the buffer under a new shape with the same volume.
    pub fn reshape(&self, rows: usize, cols: usize) -> PureResult<Tensor> {
        if rows * cols != self.data.len() {
            return Err(TensorError::DataLength {
                expected: self.data.len(),
                got: rows * cols,
            });
        }
        Tensor::from_vec(rows, cols, self.data.clone())
    }

    /// Sums the tensor down to one value per column.
    pub fn sum_axis0(&self) -> Vec<f32> {
        let mut sums = vec![0.0f32; self.cols];
        for row in self.data.chunks(self.cols) {
            for (dst, src) in sums.iter_mut().zip(row.iter()) {
                *dst += src;
            }
        }
        sums
    }

    /// Stacks tensors with identical column counts along the row axis.
    pub fn cat_rows(tensors: &[Tensor]) -> PureResult<Tensor> {
        let first = tensors.first().ok_or(TensorError::EmptyInput("cat_rows"))?;
        let cols = first.cols;
        let mut rows = 0;
        let mut data = Vec::new();
        for tensor in tensors {
            if tensor.cols != cols {
                return Err(TensorError::ShapeMismatch {
                    left: first.shape(),
                    right: tensor.shape(),
                });
            }
            rows += tensor.rows;
            data.extend_from_slice(&tensor.data);
        }
        Tensor::from_vec(rows, cols, data)
    }

    /// Squared Euclidean norm of the whole buffer.
    pub fn squared_l2_norm(&self) -> f32 {
        self.data.iter().map(|value| value * value).sum()
    }

    fn zip_with<F>(&self, other: &Tensor, mut f: F) -> PureResult<Tensor>
    where
        F: FnMut(f32, f32) -> f32,
    {
        if self.shape() != other.shape() {
            return Err(TensorError::ShapeMismatch {
                left: self.shape(),
                right: other.shape(),
            });
        }
        let data = self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| f(*a, *b))
            .collect();
        Tensor::from_vec(self.rows, self.cols, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn constructors_reject_bad_shapes() {
        assert!(matches!(
            Tensor::zeros(0, 3),
            Err(TensorError::InvalidDimensions { .. })
        ));
        assert!(matches!(
            Tensor::from_vec(2, 2, vec![1.0; 3]),
            Err(TensorError::DataLength {
                expected: 4,
                got: 3
            })
        ));
    }

    #[test]
    fn matmul_matches_manual_product() {
        let lhs = Tensor::from_vec(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let rhs = Tensor::from_vec(3, 2, vec![7.0, 8.0, 9.0, 10.0, 11.0, 12.0]).unwrap();
        let out = lhs.matmul(&rhs).unwrap();
        assert_eq!(out.shape(), (2, 2));
        assert_eq!(out.data(), &[58.0, 64.0, 139.0, 154.0]);
    }

    #[test]
    fn matmul_rejects_mismatched_inner_dims() {
        let lhs = Tensor::zeros(2, 3).unwrap();
        let rhs = Tensor::zeros(2, 2).unwrap();
        assert!(matches!(
            lhs.matmul(&rhs),
            Err(TensorError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn transpose_round_trips() {
        let tensor = Tensor::from_vec(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let twice = tensor.transpose().transpose();
        assert_eq!(tensor, twice);
        assert_eq!(tensor.transpose().row(0).unwrap(), &[1.0, 4.0]);
    }

    #[test]
    fn add_row_inplace_broadcasts_bias() {
        let mut tensor = Tensor::zeros(2, 3).unwrap();
        tensor.add_row_inplace(&[1.0, 2.0, 3.0]).unwrap();
        assert_eq!(tensor.data(), &[1.0, 2.0, 3.0, 1.0, 2.0, 3.0]);
        assert!(matches!(
            tensor.add_row_inplace(&[1.0]),
            Err(TensorError::DataLength { .. })
        ));
    }

    #[test]
    fn cat_rows_stacks_windows() {
        let a = Tensor::from_vec(1, 2, vec![1.0, 2.0]).unwrap();
        let b = Tensor::from_vec(2, 2, vec![3.0, 4.0, 5.0, 6.0]).unwrap();
        let stacked = Tensor::cat_rows(&[a, b]).unwrap();
        assert_eq!(stacked.shape(), (3, 2));
        assert_eq!(stacked.sum_axis0(), vec![9.0, 12.0]);
    }

    #[test]
    fn reshape_preserves_volume() {
        let tensor = Tensor::from_vec(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let reshaped = tensor.reshape(3, 2).unwrap();
        assert_eq!(reshaped.shape(), (3, 2));
        assert_eq!(reshaped.data(), tensor.data());
        assert!(matches!(
            tensor.reshape(4, 2),
            Err(TensorError::DataLength { .. })
        ));
    }

    #[test]
    fn row_guards_bounds() {
        let tensor = Tensor::zeros(2, 2).unwrap();
        assert!(tensor.row(1).is_ok());
        assert!(matches!(
            tensor.row(2),
            Err(TensorError::IndexOutOfRange { index: 2, len: 2 })
        ));
    }

    #[test]
    fn xavier_normal_is_seed_reproducible() {
        let mut first = StdRng::seed_from_u64(9);
        let mut second = StdRng::seed_from_u64(9);
        let a = Tensor::xavier_normal(4, 5, &mut first).unwrap();
        let b = Tensor::xavier_normal(4, 5, &mut second).unwrap();
        assert_eq!(a, b);
        assert!(a.data().iter().all(|value| value.is_finite()));
    }

    #[test]
    fn random_uniform_respects_bounds() {
        let mut rng = StdRng::seed_from_u64(3);
        let tensor = Tensor::random_uniform(8, 8, -0.5, 0.5, &mut rng).unwrap();
        assert!(tensor.data().iter().all(|value| (-0.5..0.5).contains(value)));
        assert!(matches!(
            Tensor::random_uniform(2, 2, 1.0, 1.0, &mut rng),
            Err(TensorError::InvalidValue { .. })
        ));
    }
}
