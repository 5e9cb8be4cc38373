// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::{PureResult, Tensor, TensorError};
use rand::rngs::StdRng;
use rand::{seq::SliceRandom, SeedableRng};
use std::sync::Arc;

/// Non-empty, shape-uniform batch of sequence windows. Every window is a
/// (timesteps, features) tensor and all windows share the same shape.
#[derive(Debug, Clone)]
pub struct SequenceBatch {
    windows: Vec<Tensor>,
}

impl SequenceBatch {
    /// Builds a batch, validating that every window shares one shape.
    pub fn new(windows: Vec<Tensor>) -> PureResult<Self> {
        let first = windows
            .first()
            .ok_or(TensorError::EmptyInput("sequence_batch"))?;
        let shape = first.shape();
        for window in &windows {
            if window.shape() != shape {
                return Err(TensorError::ShapeMismatch {
                    left: shape,
                    right: window.shape(),
                });
            }
        }
        Ok(Self { windows })
    }

    /// Number of windows in the batch.
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    /// Always `false`; construction rejects empty batches.
    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// The (timesteps, features) shape shared by every window.
    pub fn window_shape(&self) -> (usize, usize) {
        self.windows[0].shape()
    }

    /// Borrows all windows.
    pub fn windows(&self) -> &[Tensor] {
        &self.windows
    }

    /// Borrows one window by position.
    pub fn window(&self, index: usize) -> PureResult<&Tensor> {
        self.windows
            .get(index)
            .ok_or(TensorError::IndexOutOfRange {
                index,
                len: self.windows.len(),
            })
    }
}

/// In-memory dataset of motion-capture windows. Windows are validated to a
/// uniform shape on insertion and support direct random access, which the
/// training loop relies on when picking its qualitative test sample.
#[derive(Clone, Debug, Default)]
pub struct WindowDataset {
    windows: Vec<Tensor>,
}

impl WindowDataset {
    /// Creates an empty dataset.
    pub fn new() -> Self {
        Self {
            windows: Vec::new(),
        }
    }

    /// Builds a dataset from an owning vector.
    pub fn from_vec(windows: Vec<Tensor>) -> PureResult<Self> {
        let mut dataset = Self::new();
        for window in windows {
            dataset.push(window)?;
        }
        Ok(dataset)
    }

    /// Appends a window, validating it against the established shape.
    pub fn push(&mut self, window: Tensor) -> PureResult<()> {
        if let Some(first) = self.windows.first() {
            if first.shape() != window.shape() {
                return Err(TensorError::ShapeMismatch {
                    left: first.shape(),
                    right: window.shape(),
                });
            }
        }
        self.windows.push(window);
        Ok(())
    }

    /// Returns the number of windows stored in the dataset.
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    /// Returns `true` when no windows are registered.
    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// Direct indexed access.
    pub fn get(&self, index: usize) -> Option<&Tensor> {
        self.windows.get(index)
    }

    /// The shared (timesteps, features) shape, when any window is present.
    pub fn window_shape(&self) -> Option<(usize, usize)> {
        self.windows.first().map(Tensor::shape)
    }

    /// Creates a streaming [`WindowLoader`] over cloned windows.
    pub fn loader(&self) -> WindowLoader {
        WindowLoader::new(self.windows.clone().into())
    }
}

fn default_order(len: usize) -> Arc<Vec<usize>> {
    Arc::new((0..len).collect())
}

/// Builder-style loader supporting deterministic shuffling and fixed batch
/// sizes. Batches are produced eagerly on the calling thread; the training
/// run is strictly sequential.
#[derive(Clone)]
pub struct WindowLoader {
    windows: Arc<[Tensor]>,
    order: Arc<Vec<usize>>,
    batch_size: usize,
}

impl WindowLoader {
    fn new(windows: Arc<[Tensor]>) -> Self {
        let len = windows.len();
        Self {
            windows,
            order: default_order(len),
            batch_size: 1,
        }
    }

    /// Returns the number of individual windows referenced by the loader.
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    /// Returns `true` when the underlying dataset holds no windows.
    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// Returns the configured batch size.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Creates a new loader with the same dataset but a deterministically
    /// shuffled visitation order using the provided seed.
    pub fn shuffle(mut self, seed: u64) -> Self {
        let mut indices: Vec<usize> = (0..self.windows.len()).collect();
        let mut rng = StdRng::seed_from_u64(seed);
        indices.shuffle(&mut rng);
        self.order = Arc::new(indices);
        self
    }

    /// Updates the loader to emit batches of `batch_size` windows.
    pub fn batched(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Creates a new iterator over the configured batches.
    pub fn iter(&self) -> WindowBatches {
        WindowBatches {
            windows: Arc::clone(&self.windows),
            order: Arc::clone(&self.order),
            batch_size: self.batch_size,
            position: 0,
        }
    }
}

/// Iterator over mini-batches produced by a [`WindowLoader`].
pub struct WindowBatches {
    windows: Arc<[Tensor]>,
    order: Arc<Vec<usize>>,
    batch_size: usize,
    position: usize,
}

impl Iterator for WindowBatches {
    type Item = PureResult<SequenceBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.order.len() {
            return None;
        }
        let start = self.position;
        let end = (self.position + self.batch_size).min(self.order.len());
        self.position = end;
        let indices = &self.order[start..end];
        let mut batch = Vec::with_capacity(indices.len());
        for &idx in indices {
            batch.push(self.windows[idx].clone());
        }
        Some(SequenceBatch::new(batch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(fill: f32) -> Tensor {
        Tensor::from_fn(4, 3, |_, _| fill).unwrap()
    }

    #[test]
    fn dataset_rejects_mixed_shapes() {
        let mut dataset = WindowDataset::new();
        dataset.push(window(1.0)).unwrap();
        let tall = Tensor::zeros(5, 3).unwrap();
        assert!(matches!(
            dataset.push(tall),
            Err(TensorError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn loader_batches_windows() {
        let dataset =
            WindowDataset::from_vec((0..6).map(|i| window(i as f32)).collect()).unwrap();
        let mut batches = dataset.loader().batched(4).iter();
        let first = batches.next().unwrap().unwrap();
        assert_eq!(first.len(), 4);
        assert_eq!(first.window_shape(), (4, 3));
        let second = batches.next().unwrap().unwrap();
        assert_eq!(second.len(), 2);
        assert!(batches.next().is_none());
    }

    #[test]
    fn loader_shuffles_deterministically() {
        let dataset =
            WindowDataset::from_vec((0..8).map(|i| window(i as f32)).collect()).unwrap();
        let visit = |seed: u64| -> Vec<f32> {
            dataset
                .loader()
                .shuffle(seed)
                .batched(1)
                .iter()
                .map(|batch| batch.unwrap().windows()[0].data()[0])
                .collect()
        };
        assert_eq!(visit(42), visit(42));
        assert_ne!(visit(42), visit(43));
    }

    #[test]
    fn batch_guards_empty_and_indexing() {
        assert!(matches!(
            SequenceBatch::new(Vec::new()),
            Err(TensorError::EmptyInput("sequence_batch"))
        ));
        let batch = SequenceBatch::new(vec![window(0.5)]).unwrap();
        assert!(batch.window(0).is_ok());
        assert!(matches!(
            batch.window(1),
            Err(TensorError::IndexOutOfRange { index: 1, len: 1 })
        ));
    }

    #[test]
    fn dataset_direct_access() {
        let dataset =
            WindowDataset::from_vec((0..3).map(|i| window(i as f32)).collect()).unwrap();
        assert_eq!(dataset.get(2).unwrap().data()[0], 2.0);
        assert!(dataset.get(3).is_none());
    }
}
