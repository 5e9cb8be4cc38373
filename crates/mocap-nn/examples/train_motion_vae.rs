// SPDX-License-Identifier: AGPL-3.0-or-later

//! Trains the sequence VAE on synthetic dancer-like joint trajectories and
//! writes one reconstruction artifact per epoch to `reconstructions.jsonl`.

use mocap_nn::{
    ElboLoss, JsonRenderSink, MotionVae, Sgd, Tensor, TensorError, TracingMetricsSink, Trainer,
    TrainerConfig, VaeConfig, WindowDataset,
};
use std::fs::File;

const SEQ_LEN: usize = 16;
const JOINTS: usize = 3;

fn synthetic_window(phase: f32) -> mocap_nn::PureResult<Tensor> {
    Tensor::from_fn(SEQ_LEN, JOINTS * 3, |t, f| {
        let joint = (f / 3) as f32;
        let angle = 0.35 * t as f32 + phase + joint * 2.1;
        match f % 3 {
            0 => angle.cos() * 0.8,
            1 => angle.sin() * 0.8,
            _ => 0.05 * joint,
        }
    })
}

fn dataset(count: usize, phase_offset: f32) -> mocap_nn::PureResult<WindowDataset> {
    let mut dataset = WindowDataset::new();
    for i in 0..count {
        dataset.push(synthetic_window(phase_offset + i as f32 * 0.21)?)?;
    }
    Ok(dataset)
}

fn main() -> mocap_nn::PureResult<()> {
    let _ = mocap_config::init_tracing();

    let train = dataset(48, 0.0)?;
    let valid = dataset(12, 0.07)?;
    let test = dataset(6, 0.13)?;

    let mut model = MotionVae::new(VaeConfig {
        n_layers: 2,
        input_features: JOINTS * 3,
        hidden_features: 16,
        latent_dim: 4,
        seq_len: SEQ_LEN,
        negative_slope: 0.2,
        seed: Some(7),
    })?;
    let loss = ElboLoss::default();
    let mut optimizer = Sgd::new(1e-3)?;
    let mut trainer = Trainer::new(TrainerConfig {
        epochs: 3,
        log_interval: 5,
        joint_count: JOINTS,
        seed: Some(11),
    })?;

    let file = File::create("reconstructions.jsonl").map_err(|err| TensorError::IoError {
        message: err.to_string(),
    })?;
    let mut render = JsonRenderSink::new(file);
    let mut metrics = TracingMetricsSink::new();

    let report = trainer.fit(
        &mut model,
        &loss,
        &mut optimizer,
        &train.loader().shuffle(3).batched(8),
        &valid.loader().batched(4),
        &test,
        &mut metrics,
        &mut render,
    )?;

    for stats in &report.epochs {
        println!(
            "epoch={} train_loss={:.6} valid_loss={} batches={}",
            stats.epoch,
            stats.train_loss,
            stats
                .valid_loss
                .map(|v| format!("{v:.6}"))
                .unwrap_or_else(|| "-".to_string()),
            stats.train_batches,
        );
    }
    println!(
        "done: {} examples over {} batches",
        report.state.examples_seen, report.state.batches_seen
    );

    Ok(())
}
