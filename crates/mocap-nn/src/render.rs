// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::{PureResult, Tensor, TensorError};
use serde::Serialize;
use std::io::Write;

/// Canonical (frames, joints, 3) pose layout handed to rendering sinks.
/// Built from a flat (timesteps, 3 * joints) window; the feature width must
/// factor exactly.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoseFrames {
    frames: usize,
    joints: usize,
    data: Vec<f32>,
}

impl PoseFrames {
    /// Reshapes a window into per-joint coordinates.
    pub fn from_window(window: &Tensor, joints: usize) -> PureResult<Self> {
        if joints == 0 {
            return Err(TensorError::InvalidValue {
                label: "joint_count",
            });
        }
        let (frames, features) = window.shape();
        if features != joints * 3 {
            return Err(TensorError::DataLength {
                expected: joints * 3,
                got: features,
            });
        }
        Ok(Self {
            frames,
            joints,
            data: window.data().to_vec(),
        })
    }

    /// Number of animation frames.
    pub fn frames(&self) -> usize {
        self.frames
    }

    /// Number of joints per frame.
    pub fn joints(&self) -> usize {
        self.joints
    }

    /// The (x, y, z) position of one joint in one frame.
    pub fn position(&self, frame: usize, joint: usize) -> PureResult<[f32; 3]> {
        if frame >= self.frames {
            return Err(TensorError::IndexOutOfRange {
                index: frame,
                len: self.frames,
            });
        }
        if joint >= self.joints {
            return Err(TensorError::IndexOutOfRange {
                index: joint,
                len: self.joints,
            });
        }
        let base = frame * self.joints * 3 + joint * 3;
        Ok([self.data[base], self.data[base + 1], self.data[base + 2]])
    }
}

/// Consumes ground-truth/reconstruction pairs and produces a qualitative
/// artifact. The rendering itself is outside the core; the sink only ever
/// sees shaped data.
pub trait RenderSink {
    fn render(
        &mut self,
        truth: &PoseFrames,
        reconstruction: &PoseFrames,
        epoch: usize,
        index: usize,
    ) -> PureResult<()>;
}

#[derive(Serialize)]
struct ArtifactRecord<'a> {
    epoch: usize,
    index: usize,
    truth: &'a PoseFrames,
    reconstruction: &'a PoseFrames,
}

/// Writes one JSON artifact record per epoch to the wrapped writer.
pub struct JsonRenderSink<W: Write> {
    writer: W,
}

impl<W: Write> JsonRenderSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Returns the wrapped writer.
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> RenderSink for JsonRenderSink<W> {
    fn render(
        &mut self,
        truth: &PoseFrames,
        reconstruction: &PoseFrames,
        epoch: usize,
        index: usize,
    ) -> PureResult<()> {
        let record = ArtifactRecord {
            epoch,
            index,
            truth,
            reconstruction,
        };
        serde_json::to_writer(&mut self.writer, &record).map_err(|err| {
            TensorError::SerializationError {
                message: err.to_string(),
            }
        })?;
        self.writer
            .write_all(b"\n")
            .map_err(|err| TensorError::IoError {
                message: err.to_string(),
            })
    }
}

/// Captured artifact for assertions in tests.
#[derive(Debug, Clone)]
pub struct RenderedArtifact {
    pub epoch: usize,
    pub index: usize,
    pub truth: PoseFrames,
    pub reconstruction: PoseFrames,
}

/// Keeps every artifact in memory.
#[derive(Debug, Default)]
pub struct MemoryRenderSink {
    artifacts: Vec<RenderedArtifact>,
}

impl MemoryRenderSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn artifacts(&self) -> &[RenderedArtifact] {
        &self.artifacts
    }
}

impl RenderSink for MemoryRenderSink {
    fn render(
        &mut self,
        truth: &PoseFrames,
        reconstruction: &PoseFrames,
        epoch: usize,
        index: usize,
    ) -> PureResult<()> {
        self.artifacts.push(RenderedArtifact {
            epoch,
            index,
            truth: truth.clone(),
            reconstruction: reconstruction.clone(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pose_frames_require_exact_feature_factoring() {
        let window = Tensor::zeros(4, 6).unwrap();
        let frames = PoseFrames::from_window(&window, 2).unwrap();
        assert_eq!(frames.frames(), 4);
        assert_eq!(frames.joints(), 2);
        assert!(matches!(
            PoseFrames::from_window(&window, 4),
            Err(TensorError::DataLength {
                expected: 12,
                got: 6
            })
        ));
    }

    #[test]
    fn position_reads_interleaved_coordinates() {
        let window = Tensor::from_vec(
            2,
            6,
            vec![
                0.0, 1.0, 2.0, 3.0, 4.0, 5.0, //
                6.0, 7.0, 8.0, 9.0, 10.0, 11.0,
            ],
        )
        .unwrap();
        let frames = PoseFrames::from_window(&window, 2).unwrap();
        assert_eq!(frames.position(0, 1).unwrap(), [3.0, 4.0, 5.0]);
        assert_eq!(frames.position(1, 0).unwrap(), [6.0, 7.0, 8.0]);
        assert!(matches!(
            frames.position(2, 0),
            Err(TensorError::IndexOutOfRange { index: 2, len: 2 })
        ));
    }

    #[test]
    fn json_sink_writes_one_line_per_artifact() {
        let window = Tensor::zeros(2, 3).unwrap();
        let frames = PoseFrames::from_window(&window, 1).unwrap();
        let mut sink = JsonRenderSink::new(Vec::new());
        sink.render(&frames, &frames, 3, 7).unwrap();
        let buffer = sink.into_inner();
        let text = String::from_utf8(buffer).unwrap();
        assert_eq!(text.lines().count(), 1);
        assert!(text.contains("\"epoch\":3"));
        assert!(text.contains("\"index\":7"));
    }
}
