//! Model persistence
//!
//! A saved model is two files sharing a stem: `<stem>.mpk` holds the weights
//! (Burn `CompactRecorder`) and `<stem>.json` the description needed to rebuild
//! the module before the weights are loaded into it.

use std::fs;
use std::path::{Path, PathBuf};

use burn::module::Module;
use burn::record::CompactRecorder;
use burn::tensor::backend::Backend;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::classifier::{TransferClassifier, TransferClassifierConfig};
use super::vgg::{Vgg, VggConfig};
use crate::config::ImageSize;
use crate::training::objective::{LossKind, OptimizerKind};
use crate::utils::error::{PipelineError, Result};

/// Optimizer and loss a model was prepared with
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompileSpec {
    pub optimizer: OptimizerKind,
    pub learning_rate: f64,
    pub loss: LossKind,
}

/// Everything stored next to the classifier weights
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    pub architecture: TransferClassifierConfig,
    pub compile: CompileSpec,
    /// Label names in class-index order; empty until the model has seen data
    #[serde(default)]
    pub class_names: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl ModelSpec {
    pub fn new(architecture: TransferClassifierConfig, compile: CompileSpec) -> Self {
        Self {
            architecture,
            compile,
            class_names: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn image_size(&self) -> ImageSize {
        self.architecture.image_size
    }

    /// Label for a class index, falling back to `class_<i>`
    pub fn class_name(&self, index: usize) -> String {
        self.class_names
            .get(index)
            .cloned()
            .unwrap_or_else(|| format!("class_{}", index))
    }
}

/// Description stored next to a bare backbone
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackboneSpec {
    pub backbone: VggConfig,
    pub image_size: ImageSize,
    pub pretrained: bool,
}

pub fn weights_path(path: &Path) -> PathBuf {
    path.with_extension("mpk")
}

pub fn spec_path(path: &Path) -> PathBuf {
    path.with_extension("json")
}

/// Both the weights and the description are present
pub fn model_exists(path: &Path) -> bool {
    weights_path(path).is_file() && spec_path(path).is_file()
}

fn save_with_spec<B: Backend, M: Module<B>, S: Serialize>(
    module: M,
    spec: &S,
    path: &Path,
) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    module
        .save_file(weights_path(path), &CompactRecorder::new())
        .map_err(|e| PipelineError::Serialization(format!("saving {}: {}", path.display(), e)))?;
    fs::write(spec_path(path), serde_json::to_string_pretty(spec)?)?;
    info!("Saved model to {}", weights_path(path).display());
    Ok(())
}

fn read_spec<S: for<'de> Deserialize<'de>>(path: &Path) -> Result<S> {
    let spec_file = spec_path(path);
    let weights = weights_path(path);
    if !weights.is_file() || !spec_file.is_file() {
        return Err(PipelineError::ModelLoad(format!(
            "no saved model at {} (expected {} and {})",
            path.display(),
            weights.display(),
            spec_file.display()
        )));
    }
    let text = fs::read_to_string(&spec_file)?;
    serde_json::from_str(&text)
        .map_err(|e| PipelineError::ModelLoad(format!("{}: {}", spec_file.display(), e)))
}

pub fn save_model<B: Backend>(
    model: &TransferClassifier<B>,
    spec: &ModelSpec,
    path: &Path,
) -> Result<()> {
    save_with_spec(model.clone(), spec, path)
}

/// Rebuild a classifier from its description, load the weights, re-apply freezing
pub fn load_model<B: Backend>(
    path: &Path,
    device: &B::Device,
) -> Result<(TransferClassifier<B>, ModelSpec)> {
    let spec: ModelSpec = read_spec(path)?;
    let model = spec
        .architecture
        .init::<B>(device)
        .load_file(weights_path(path), &CompactRecorder::new(), device)
        .map_err(|e| PipelineError::ModelLoad(format!("{}: {}", path.display(), e)))?
        .freeze(spec.architecture.freeze);
    Ok((model, spec))
}

pub fn save_backbone<B: Backend>(backbone: &Vgg<B>, spec: &BackboneSpec, path: &Path) -> Result<()> {
    save_with_spec(backbone.clone(), spec, path)
}

/// Load backbone weights into a module built from `config`
pub fn load_backbone_weights<B: Backend>(
    config: &VggConfig,
    image_size: ImageSize,
    weights: &Path,
    device: &B::Device,
) -> Result<Vgg<B>> {
    if !weights.is_file() {
        return Err(PipelineError::ModelLoad(format!(
            "pretrained weights not found at {}",
            weights.display()
        )));
    }
    config
        .init::<B>(image_size, device)
        .load_file(weights.to_path_buf(), &CompactRecorder::new(), device)
        .map_err(|e| PipelineError::ModelLoad(format!("{}: {}", weights.display(), e)))
}
