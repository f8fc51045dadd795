//! # Chest Cancer Classifier
//!
//! An end-to-end pipeline for binary chest CT scan classification
//! (adenocarcinoma vs. normal) using transfer learning on a VGG backbone,
//! built with the Burn framework.
//!
//! ## Modules
//!
//! - `config`: YAML configuration (`config/config.yaml`, `params.yaml`) into per-stage records
//! - `dataset`: archive ingestion, class-folder loading, augmentation and batching
//! - `model`: VGG backbone, transfer classifier head, persistence
//! - `training`: objectives, optimizers and the training loop
//! - `evaluation`: held-out scoring and `scores.json`
//! - `tracking`: MLflow REST and local `mlruns` experiment trackers
//! - `pipeline`: the four stages and their process entry points
//! - `inference`: single-image prediction for the CLI and web server
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use chest_cancer_classifier::config::ConfigurationManager;
//! use chest_cancer_classifier::pipeline::run_all;
//!
//! let config = ConfigurationManager::from_default_paths()?;
//! for outcome in run_all(&config)? {
//!     println!("{}", outcome);
//! }
//! ```

pub mod backend;
pub mod config;
pub mod dataset;
pub mod evaluation;
pub mod inference;
pub mod model;
pub mod pipeline;
pub mod tracking;
pub mod training;
pub mod utils;

pub use config::{ConfigurationManager, Params};
pub use dataset::{DataIngestion, ImageFolder, ImageGenerator};
pub use evaluation::{Evaluation, Scores};
pub use inference::{Prediction, Predictor};
pub use model::{PrepareBaseModel, TransferClassifier};
pub use pipeline::{run_all, run_stage, Stage, StageOutcome};
pub use training::Training;
pub use utils::error::{PipelineError, Result};

/// Version of the library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
