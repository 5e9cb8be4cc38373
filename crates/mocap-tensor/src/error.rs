// SPDX-License-Identifier: AGPL-3.0-or-later

use thiserror::Error;

/// Errors surfaced by tensor constructors and operators.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TensorError {
    /// A tensor constructor received an invalid shape.
    #[error("invalid tensor dimensions ({rows} x {cols}); both axes must be non-zero")]
    InvalidDimensions { rows: usize, cols: usize },
    /// Data provided to a constructor or operator does not match the tensor shape.
    #[error("data length mismatch: expected {expected}, got {got}")]
    DataLength { expected: usize, got: usize },
    /// An operator was asked to combine tensors of incompatible shapes.
    #[error("shape mismatch: left={left:?}, right={right:?} cannot be combined")]
    ShapeMismatch {
        left: (usize, usize),
        right: (usize, usize),
    },
    /// Computation received an empty input which would otherwise trigger a panic.
    #[error("empty input passed to {0}")]
    EmptyInput(&'static str),
    /// Numeric guard detected a non-finite value that would otherwise propagate NaNs.
    #[error("non-finite value {value} encountered in {label}")]
    NonFiniteValue { label: &'static str, value: f32 },
    /// Learning rate must stay positive for gradient optimizers.
    #[error("learning rate must be positive and finite, got {rate}")]
    NonPositiveLearningRate { rate: f32 },
    /// Generic configuration violation.
    #[error("invalid value for {label}")]
    InvalidValue { label: &'static str },
    /// Attempted to load or update a parameter that was missing from the state dict.
    #[error("parameter {name} missing from state dict")]
    MissingParameter { name: String },
    /// An index addressed a row or sample outside the container bounds.
    #[error("index {index} out of range for length {len}")]
    IndexOutOfRange { index: usize, len: usize },
    /// Wrapper around I/O failures when emitting artifacts.
    #[error("io failure: {message}")]
    IoError { message: String },
    /// Wrapper around serde failures when serialising records.
    #[error("serialization failure: {message}")]
    SerializationError { message: String },
}

/// Convenient alias used across the workspace.
pub type PureResult<T> = Result<T, TensorError>;
