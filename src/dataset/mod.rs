//! Dataset acquisition and loading
//!
//! - [`ingestion`]: download and unpack the dataset archive
//! - [`loader`]: scan class folders and split them deterministically
//! - [`burn_dataset`]: decoded images, Burn `Dataset` and `Batcher` impls
//! - [`augmentation`]: random affine augmentation for training
//! - [`generator`]: epoch-wise batch iteration

pub mod augmentation;
pub mod burn_dataset;
pub mod generator;
pub mod ingestion;
pub mod loader;

pub use augmentation::{AugmentationConfig, Augmenter};
pub use burn_dataset::{ImageBatch, ImageBatcher, ImageDataset, ImageItem};
pub use generator::ImageGenerator;
pub use ingestion::{DataIngestion, FetchOutcome};
pub use loader::{ImageFolder, ImageSample, Subset};
