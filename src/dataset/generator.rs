//! Batch generators over an in-memory image dataset
//!
//! A generator yields one epoch at a time. Training generators shuffle with a
//! seeded `ChaCha8Rng` and may augment; validation generators keep the dataset
//! order and never augment.

use burn::data::dataset::Dataset;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::config::ImageSize;
use crate::dataset::augmentation::Augmenter;
use crate::dataset::burn_dataset::{to_chw, ImageDataset, ImageItem};

#[derive(Debug, Clone)]
pub struct ImageGenerator {
    dataset: ImageDataset,
    class_names: Vec<String>,
    batch_size: usize,
    shuffle: bool,
    seed: u64,
    augmenter: Option<Augmenter>,
}

impl ImageGenerator {
    /// Sequential, non-augmenting generator. A zero batch size is treated as 1.
    pub fn new(dataset: ImageDataset, class_names: Vec<String>, batch_size: usize) -> Self {
        Self {
            dataset,
            class_names,
            batch_size: batch_size.max(1),
            shuffle: false,
            seed: 0,
            augmenter: None,
        }
    }

    /// Reshuffle every epoch, seeded with `seed + epoch`
    pub fn with_shuffle(mut self, seed: u64) -> Self {
        self.shuffle = true;
        self.seed = seed;
        self
    }

    pub fn with_augmentation(mut self, augmenter: Augmenter) -> Self {
        self.augmenter = Some(augmenter);
        self
    }

    pub fn len(&self) -> usize {
        self.dataset.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dataset.is_empty()
    }

    pub fn num_batches(&self) -> usize {
        self.len().div_ceil(self.batch_size)
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn image_size(&self) -> ImageSize {
        self.dataset.image_size()
    }

    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    pub fn num_classes(&self) -> usize {
        self.class_names.len()
    }

    /// Files of the subset that could not be decoded and are left out
    pub fn skipped(&self) -> usize {
        self.dataset.skipped()
    }

    pub fn is_augmenting(&self) -> bool {
        self.augmenter.is_some()
    }

    /// Iterate over the batches of one epoch
    pub fn epoch(&self, epoch: usize) -> EpochBatches<'_> {
        let mut order: Vec<usize> = (0..self.len()).collect();
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
        if self.shuffle {
            order.shuffle(&mut rng);
        }
        EpochBatches {
            generator: self,
            order,
            position: 0,
            rng,
        }
    }
}

pub struct EpochBatches<'a> {
    generator: &'a ImageGenerator,
    order: Vec<usize>,
    position: usize,
    rng: ChaCha8Rng,
}

impl Iterator for EpochBatches<'_> {
    type Item = Vec<ImageItem>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.order.len() {
            return None;
        }
        let end = (self.position + self.generator.batch_size).min(self.order.len());
        let indices = &self.order[self.position..end];
        self.position = end;

        let batch = indices
            .iter()
            .filter_map(|&i| self.generator.dataset.get(i))
            .map(|raw| match &self.generator.augmenter {
                Some(augmenter) => ImageItem {
                    image: to_chw(&augmenter.augment(&raw.image, &mut self.rng)),
                    label: raw.label,
                    path: raw.path,
                },
                None => ImageItem::from_raw(&raw),
            })
            .collect();
        Some(batch)
    }
}
