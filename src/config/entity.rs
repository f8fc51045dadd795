//! Typed, immutable configuration records handed to each pipeline component.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::dataset::augmentation::AugmentationConfig;
use crate::model::base_model::WeightsSource;
use crate::model::classifier::FreezePolicy;
use crate::model::vgg::BackboneKind;
use crate::tracking::RegistryMode;
use crate::training::objective::{LossKind, OptimizerKind};

/// Network input size, written as `[height, width, channels]` in params.yaml
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<usize>", into = "Vec<usize>")]
pub struct ImageSize {
    pub height: usize,
    pub width: usize,
    pub channels: usize,
}

impl ImageSize {
    pub fn new(height: usize, width: usize) -> Self {
        Self {
            height,
            width,
            channels: 3,
        }
    }

    pub fn pixels(&self) -> usize {
        self.height * self.width
    }
}

impl TryFrom<Vec<usize>> for ImageSize {
    type Error = String;

    fn try_from(dims: Vec<usize>) -> Result<Self, Self::Error> {
        match dims.as_slice() {
            [h, w] => Ok(Self::new(*h, *w)),
            [h, w, 3] => Ok(Self::new(*h, *w)),
            [_, _, c] => Err(format!("IMAGE_SIZE must have 3 channels (RGB), got {}", c)),
            _ => Err(format!("IMAGE_SIZE must be [height, width, channels], got {:?}", dims)),
        }
    }
}

impl From<ImageSize> for Vec<usize> {
    fn from(size: ImageSize) -> Self {
        vec![size.height, size.width, size.channels]
    }
}

impl fmt::Display for ImageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.height, self.width, self.channels)
    }
}

/// Inputs of the data ingestion stage
#[derive(Debug, Clone)]
pub struct DataIngestionConfig {
    pub root_dir: PathBuf,
    /// Remote (http/https, Google Drive share link) or local (`file://`, plain path) archive
    pub source_url: String,
    pub local_data_file: PathBuf,
    pub unzip_dir: PathBuf,
}

/// Inputs of the base model preparation stage
#[derive(Debug, Clone)]
pub struct PrepareBaseModelConfig {
    pub root_dir: PathBuf,
    pub base_model_path: PathBuf,
    pub updated_base_model_path: PathBuf,
    pub pretrained_weights_path: Option<PathBuf>,
    pub pretrained_weights_url: Option<String>,
    pub image_size: ImageSize,
    pub backbone: BackboneKind,
    pub backbone_blocks: Option<Vec<Vec<usize>>>,
    pub include_top: bool,
    pub weights: WeightsSource,
    pub classes: usize,
    pub learning_rate: f64,
    pub optimizer: OptimizerKind,
    pub loss: LossKind,
    pub freeze: FreezePolicy,
}

/// Inputs of the training stage
#[derive(Debug, Clone)]
pub struct TrainingConfig {
    pub root_dir: PathBuf,
    pub trained_model_path: PathBuf,
    pub updated_base_model_path: PathBuf,
    pub training_data: PathBuf,
    pub history_path: PathBuf,
    pub epochs: usize,
    pub batch_size: usize,
    pub augmentation: bool,
    pub augmentation_params: AugmentationConfig,
    pub image_size: ImageSize,
    pub validation_split: f64,
    pub seed: u64,
}

/// Inputs of the evaluation stage
#[derive(Debug, Clone)]
pub struct EvaluationConfig {
    pub path_of_model: PathBuf,
    pub training_data: PathBuf,
    pub scores_path: PathBuf,
    pub mlflow_uri: String,
    pub experiment_name: String,
    pub registered_model_name: String,
    pub model_registry: RegistryMode,
    /// Every params.yaml entry, stringified for tracker logging
    pub all_params: BTreeMap<String, String>,
    pub image_size: ImageSize,
    pub batch_size: usize,
    pub evaluation_split: f64,
}

/// Serving-side settings derived from the same configuration files
#[derive(Debug, Clone)]
pub struct PredictionConfig {
    pub model_path: PathBuf,
    pub threshold: f32,
}
