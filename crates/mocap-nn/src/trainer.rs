// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::dataset::{SequenceBatch, WindowDataset, WindowLoader};
use crate::loss::ElboLoss;
use crate::metrics::{LossRecord, MetricsSink};
use crate::optim::Sgd;
use crate::render::{PoseFrames, RenderSink};
use crate::vae::MotionVae;
use crate::{PureResult, TensorError};
use rand::rngs::StdRng;
use rand::Rng;

/// Knobs of one training run.
#[derive(Debug, Clone)]
pub struct TrainerConfig {
    /// Number of full passes over the training source.
    pub epochs: usize,
    /// Emit a loss record every this many batches (per channel).
    pub log_interval: usize,
    /// Joints per pose; the window feature width must equal 3x this.
    pub joint_count: usize,
    /// Seed for the per-epoch artifact index draw. `None` defers to the
    /// workspace determinism policy.
    pub seed: Option<u64>,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            epochs: 1,
            log_interval: 25,
            joint_count: 53,
            seed: None,
        }
    }
}

impl TrainerConfig {
    pub fn validate(&self) -> PureResult<()> {
        if self.log_interval == 0 {
            return Err(TensorError::InvalidValue {
                label: "log_interval",
            });
        }
        if self.joint_count == 0 {
            return Err(TensorError::InvalidValue {
                label: "joint_count",
            });
        }
        Ok(())
    }
}

/// Cumulative counters for a run. Training and validation count separately;
/// both reset only when a new run starts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrainingState {
    pub examples_seen: usize,
    pub batches_seen: usize,
    pub valid_examples_seen: usize,
    pub valid_batches_seen: usize,
}

/// Per-epoch summary.
#[derive(Debug, Clone)]
pub struct EpochStats {
    pub epoch: usize,
    pub train_batches: usize,
    pub train_loss: f32,
    pub valid_batches: usize,
    pub valid_loss: Option<f32>,
}

/// Outcome of a completed run.
#[derive(Debug, Clone)]
pub struct FitReport {
    pub epochs: Vec<EpochStats>,
    pub state: TrainingState,
}

/// Drives epochs of train/validation passes and the per-epoch qualitative
/// artifact. Every batch runs the zero -> backward -> step triple atomically;
/// any error aborts the run.
pub struct Trainer {
    config: TrainerConfig,
    rng: StdRng,
    state: TrainingState,
}

impl Trainer {
    pub fn new(config: TrainerConfig) -> PureResult<Self> {
        config.validate()?;
        let rng = mocap_config::rng_from_optional(config.seed, "trainer");
        Ok(Self {
            config,
            rng,
            state: TrainingState::default(),
        })
    }

    /// Returns the counters of the most recent (or in-flight) run.
    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    /// Runs the configured number of epochs.
    pub fn fit(
        &mut self,
        model: &mut MotionVae,
        loss: &ElboLoss,
        optimizer: &mut Sgd,
        train: &WindowLoader,
        valid: &WindowLoader,
        test: &WindowDataset,
        metrics: &mut dyn MetricsSink,
        render: &mut dyn RenderSink,
    ) -> PureResult<FitReport> {
        let features = model.config().input_features;
        if features != self.config.joint_count * 3 {
            return Err(TensorError::DataLength {
                expected: features,
                got: self.config.joint_count * 3,
            });
        }
        self.state = TrainingState::default();
        let mut epochs = Vec::with_capacity(self.config.epochs);
        for epoch in 0..self.config.epochs {
            let train_stats = self.train_epoch(model, loss, optimizer, train, metrics, epoch)?;
            let valid_stats = self.valid_epoch(model, loss, valid, metrics, epoch)?;
            self.emit_artifact(model, test, render, epoch)?;
            epochs.push(EpochStats {
                epoch,
                train_batches: train_stats.0,
                train_loss: train_stats.1,
                valid_batches: valid_stats.0,
                valid_loss: valid_stats.1,
            });
        }
        Ok(FitReport {
            epochs,
            state: self.state,
        })
    }

    fn train_epoch(
        &mut self,
        model: &mut MotionVae,
        loss: &ElboLoss,
        optimizer: &mut Sgd,
        train: &WindowLoader,
        metrics: &mut dyn MetricsSink,
        epoch: usize,
    ) -> PureResult<(usize, f32)> {
        model.set_training(true);
        let mut loss_total = 0.0f32;
        let mut batches = 0usize;
        for batch in train.iter() {
            let batch = batch?;
            let output = model.forward(&batch)?;
            let value = loss.value(&batch, &output)?;
            optimizer.zero_grad(model)?;
            model.backward(&batch, &output, loss)?;
            optimizer.step(model)?;
            self.state.examples_seen += batch.len();
            self.state.batches_seen += 1;
            loss_total += value;
            batches += 1;
            if self.state.batches_seen % self.config.log_interval == 0 {
                metrics.record_train(&LossRecord {
                    epoch,
                    loss: value,
                    examples_seen: self.state.examples_seen,
                })?;
            }
        }
        if batches == 0 {
            return Err(TensorError::EmptyInput("train_loader"));
        }
        Ok((batches, loss_total / batches as f32))
    }

    fn valid_epoch(
        &mut self,
        model: &mut MotionVae,
        loss: &ElboLoss,
        valid: &WindowLoader,
        metrics: &mut dyn MetricsSink,
        epoch: usize,
    ) -> PureResult<(usize, Option<f32>)> {
        model.set_training(false);
        let mut loss_total = 0.0f32;
        let mut batches = 0usize;
        for batch in valid.iter() {
            let batch = batch?;
            let output = model.forward(&batch)?;
            let value = loss.value(&batch, &output)?;
            self.state.valid_examples_seen += batch.len();
            self.state.valid_batches_seen += 1;
            loss_total += value;
            batches += 1;
            if self.state.valid_batches_seen % self.config.log_interval == 0 {
                metrics.record_validation(&LossRecord {
                    epoch,
                    loss: value,
                    examples_seen: self.state.valid_examples_seen,
                })?;
            }
        }
        let mean = (batches > 0).then(|| loss_total / batches as f32);
        Ok((batches, mean))
    }

    fn emit_artifact(
        &mut self,
        model: &MotionVae,
        test: &WindowDataset,
        render: &mut dyn RenderSink,
        epoch: usize,
    ) -> PureResult<()> {
        if test.is_empty() {
            return Ok(());
        }
        let index = self.rng.gen_range(0..test.len());
        let window = test.get(index).ok_or(TensorError::IndexOutOfRange {
            index,
            len: test.len(),
        })?;
        let batch = SequenceBatch::new(vec![window.clone()])?;
        let output = model.forward(&batch)?;
        let truth = PoseFrames::from_window(window, self.config.joint_count)?;
        let reconstruction =
            PoseFrames::from_window(output.reconstruction.window(0)?, self.config.joint_count)?;
        render.render(&truth, &reconstruction, epoch, index)
    }
}
