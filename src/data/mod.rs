//! Training data: examples, minibatches and the batch streams the training
//! loop consumes once per epoch.

mod inference;
mod kitti;

use std::path::PathBuf;

use rand::SeedableRng;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use thiserror::Error;

use crate::ir::{Tensor, TensorError};

pub use inference::{InferenceTensors, OVERLAY_ALPHA, ROAD_THRESHOLD, save_inference_samples};
pub use kitti::{BACKGROUND_COLOR, KittiRoadDataset, ROAD_CLASS};

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot decode or encode image {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("unexpected dataset layout: {0}")]
    Layout(String),
    #[error("example {index} is out of range for a dataset of {len}")]
    OutOfRange { index: usize, len: usize },
    #[error("examples in one batch disagree: {0}")]
    Mismatch(String),
    #[error("batch_size must be at least 1")]
    ZeroBatchSize,
    #[error(transparent)]
    Tensor(#[from] TensorError),
    #[error("inference failed: {0}")]
    Inference(String),
}

/// One image and its one-hot label.
#[derive(Debug, Clone, PartialEq)]
pub struct Example {
    /// `[H, W, 3]` raw pixel values in `0..=255`.
    pub image: Tensor,
    /// `[H, W, num_classes]` one-hot.
    pub label: Tensor,
}

pub trait Dataset {
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn example(&self, index: usize) -> Result<Example, DatasetError>;
}

/// `images [B, H, W, 3]` and `labels [B, H, W, C]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Minibatch {
    pub images: Tensor,
    pub labels: Tensor,
}

impl Minibatch {
    /// Stacks examples along a new leading batch axis.
    pub fn stack(examples: &[Example]) -> Result<Self, DatasetError> {
        let Some(first) = examples.first() else {
            return Err(DatasetError::Mismatch(
                "a minibatch needs at least one example".to_string(),
            ));
        };
        let mut images = Vec::with_capacity(first.image.data.len() * examples.len());
        let mut labels = Vec::with_capacity(first.label.data.len() * examples.len());
        for (i, example) in examples.iter().enumerate() {
            if example.image.shape != first.image.shape
                || example.label.shape != first.label.shape
            {
                return Err(DatasetError::Mismatch(format!(
                    "example {i} has image {:?} / label {:?}, expected {:?} / {:?}",
                    example.image.shape, example.label.shape, first.image.shape, first.label.shape
                )));
            }
            images.extend_from_slice(&example.image.data);
            labels.extend_from_slice(&example.label.data);
        }
        let batched = |shape: &[usize]| {
            let mut out = Vec::with_capacity(shape.len() + 1);
            out.push(examples.len());
            out.extend_from_slice(shape);
            out
        };
        Ok(Self {
            images: Tensor::new(batched(&first.image.shape), images)?,
            labels: Tensor::new(batched(&first.label.shape), labels)?,
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.images.shape.first().copied().unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Index batches over `0..size`, optionally in a seeded shuffled order.
/// The last batch may be short.
#[derive(Debug, Clone)]
pub struct BatchIterator {
    indices: Vec<usize>,
    position: usize,
    batch_size: usize,
}

impl BatchIterator {
    #[must_use]
    pub fn new(size: usize, batch_size: usize, shuffle: bool, seed: u64) -> Self {
        let mut indices = (0..size).collect::<Vec<_>>();
        if shuffle {
            indices.shuffle(&mut ChaCha8Rng::seed_from_u64(seed));
        }
        Self {
            indices,
            position: 0,
            batch_size: batch_size.max(1),
        }
    }
}

impl Iterator for BatchIterator {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.indices.len() {
            return None;
        }
        let end = (self.position + self.batch_size).min(self.indices.len());
        let batch = self.indices[self.position..end].to_vec();
        self.position = end;
        Some(batch)
    }
}

pub type BatchStream<'a> = Box<dyn Iterator<Item = Result<Minibatch, DatasetError>> + 'a>;

/// Produces a fresh, finite stream of minibatches on every call.
pub trait BatchSource {
    fn batches(&mut self, batch_size: usize) -> Result<BatchStream<'_>, DatasetError>;
}

/// Serves a [`Dataset`] in a new shuffled order on every call, derived from
/// the seed and the number of previous calls.
#[derive(Debug)]
pub struct ShuffledBatches<D> {
    dataset: D,
    seed: u64,
    calls: u64,
}

impl<D: Dataset> ShuffledBatches<D> {
    pub fn new(dataset: D, seed: u64) -> Self {
        Self {
            dataset,
            seed,
            calls: 0,
        }
    }

    pub fn dataset(&self) -> &D {
        &self.dataset
    }

    /// Number of streams handed out so far.
    pub fn calls(&self) -> u64 {
        self.calls
    }
}

impl<D: Dataset> BatchSource for ShuffledBatches<D> {
    fn batches(&mut self, batch_size: usize) -> Result<BatchStream<'_>, DatasetError> {
        if batch_size == 0 {
            return Err(DatasetError::ZeroBatchSize);
        }
        let seed = self.seed.wrapping_add(self.calls);
        self.calls += 1;
        let dataset = &self.dataset;
        let order = BatchIterator::new(dataset.len(), batch_size, true, seed);
        Ok(Box::new(order.map(move |indices| {
            let examples = indices
                .into_iter()
                .map(|index| dataset.example(index))
                .collect::<Result<Vec<_>, _>>()?;
            Minibatch::stack(&examples)
        })))
    }
}

/// Examples held in memory; used for synthetic runs and tests.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDataset {
    examples: Vec<Example>,
}

impl InMemoryDataset {
    #[must_use]
    pub fn new(examples: Vec<Example>) -> Self {
        Self { examples }
    }

    pub fn push(&mut self, example: Example) {
        self.examples.push(example);
    }
}

impl Dataset for InMemoryDataset {
    fn len(&self) -> usize {
        self.examples.len()
    }

    fn example(&self, index: usize) -> Result<Example, DatasetError> {
        self.examples
            .get(index)
            .cloned()
            .ok_or(DatasetError::OutOfRange {
                index,
                len: self.examples.len(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn example(value: f32) -> Example {
        Example {
            image: Tensor::filled(vec![2, 2, 3], value).expect("image"),
            label: Tensor::filled(vec![2, 2, 2], 0.5).expect("label"),
        }
    }

    #[test]
    fn shuffled_order_is_stable_for_a_seed() {
        let first = BatchIterator::new(10, 3, true, 42).collect::<Vec<_>>();
        let second = BatchIterator::new(10, 3, true, 42).collect::<Vec<_>>();
        assert_eq!(first, second);
        assert_eq!(first.len(), 4);
        assert_eq!(first[3].len(), 1);

        let mut seen = first.concat();
        seen.sort_unstable();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn stack_adds_a_batch_axis() {
        let batch = Minibatch::stack(&[example(1.0), example(2.0)]).expect("stack");
        assert_eq!(batch.images.shape, vec![2, 2, 2, 3]);
        assert_eq!(batch.labels.shape, vec![2, 2, 2, 2]);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.images.data[12], 2.0);
    }

    #[test]
    fn each_call_reshuffles() {
        let dataset = InMemoryDataset::new((0..8).map(|i| example(i as f32)).collect());
        let mut source = ShuffledBatches::new(dataset, 5);
        let order = |source: &mut ShuffledBatches<InMemoryDataset>| -> Vec<f32> {
            source
                .batches(8)
                .expect("stream")
                .map(|batch| batch.expect("batch"))
                .flat_map(|batch| {
                    batch
                        .images
                        .data
                        .chunks(12)
                        .map(|chunk| chunk[0])
                        .collect::<Vec<_>>()
                })
                .collect()
        };
        let first = order(&mut source);
        let second = order(&mut source);
        assert_eq!(source.calls(), 2);
        assert_eq!(first.len(), 8);
        assert_ne!(first, second);
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let mut source = ShuffledBatches::new(InMemoryDataset::default(), 0);
        assert!(matches!(
            source.batches(0),
            Err(DatasetError::ZeroBatchSize)
        ));
    }
}
