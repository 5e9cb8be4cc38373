// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::PureResult;
use serde::Serialize;

/// One loss observation, keyed by the cumulative example counter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LossRecord {
    pub epoch: usize,
    pub loss: f32,
    pub examples_seen: usize,
}

/// Destination for periodic loss records. Training and validation flow
/// through separate channels.
pub trait MetricsSink {
    fn record_train(&mut self, record: &LossRecord) -> PureResult<()>;
    fn record_validation(&mut self, record: &LossRecord) -> PureResult<()>;
}

/// Emits structured tracing events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetricsSink;

impl TracingMetricsSink {
    pub fn new() -> Self {
        Self
    }
}

impl MetricsSink for TracingMetricsSink {
    fn record_train(&mut self, record: &LossRecord) -> PureResult<()> {
        tracing::info!(
            target: "mocap::metrics",
            epoch = record.epoch,
            loss = record.loss,
            examples_seen = record.examples_seen,
            "train loss"
        );
        Ok(())
    }

    fn record_validation(&mut self, record: &LossRecord) -> PureResult<()> {
        tracing::info!(
            target: "mocap::metrics",
            epoch = record.epoch,
            loss = record.loss,
            examples_seen = record.examples_seen,
            "validation loss"
        );
        Ok(())
    }
}

/// Captures records in memory. Mostly useful in tests.
#[derive(Debug, Default, Clone)]
pub struct MemoryMetricsSink {
    train: Vec<LossRecord>,
    validation: Vec<LossRecord>,
}

impl MemoryMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn train_records(&self) -> &[LossRecord] {
        &self.train
    }

    pub fn validation_records(&self) -> &[LossRecord] {
        &self.validation
    }
}

impl MetricsSink for MemoryMetricsSink {
    fn record_train(&mut self, record: &LossRecord) -> PureResult<()> {
        self.train.push(record.clone());
        Ok(())
    }

    fn record_validation(&mut self, record: &LossRecord) -> PureResult<()> {
        self.validation.push(record.clone());
        Ok(())
    }
}
