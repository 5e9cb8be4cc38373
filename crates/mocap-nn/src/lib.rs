//! Sequence-VAE stack for motion-capture windows.
//!
//! This crate keeps the whole pipeline in Rust: hand-derived recurrent
//! layers, the encoder/decoder pair with reparameterized sampling, the ELBO
//! objective, and the training loop that feeds metrics and rendering sinks.

pub mod dataset;
pub mod layers;
pub mod loss;
pub mod metrics;
pub mod module;
pub mod optim;
pub mod render;
pub mod trainer;
pub mod vae;

pub use dataset::{SequenceBatch, WindowBatches, WindowDataset, WindowLoader};
pub use layers::{LeakyRelu, Linear, Lstm};
pub use loss::{ElboLoss, LossReduction};
pub use metrics::{LossRecord, MemoryMetricsSink, MetricsSink, TracingMetricsSink};
pub use module::{Module, Parameter, ParameterHost};
pub use optim::Sgd;
pub use render::{JsonRenderSink, MemoryRenderSink, PoseFrames, RenderSink, RenderedArtifact};
pub use trainer::{EpochStats, FitReport, Trainer, TrainerConfig, TrainingState};
pub use vae::{
    kl_divergence, reparameterize, MotionVae, SequenceDecoder, SequenceEncoder, VaeConfig,
    VaeOutput,
};

pub use mocap_tensor::{PureResult, Tensor, TensorError};
