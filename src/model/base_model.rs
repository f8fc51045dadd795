//! Base model preparation
//!
//! Builds the VGG backbone (pretrained or random), persists it, then freezes it,
//! attaches the classification head and persists the result together with the
//! optimizer/loss settings training will use.

use std::path::Path;

use burn::module::Module;
use burn::tensor::backend::Backend;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::classifier::{TransferClassifier, TransferClassifierConfig};
use super::store::{self, BackboneSpec, CompileSpec, ModelSpec};
use super::vgg::{Vgg, VggConfig};
use crate::config::{DataIngestionConfig, PrepareBaseModelConfig};
use crate::dataset::ingestion::DataIngestion;
use crate::utils::error::{PipelineError, Result};

/// Input size the ImageNet classifier top was trained for
pub const IMAGENET_INPUT_SIDE: usize = 224;

/// Initial backbone weights
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WeightsSource {
    #[serde(rename = "imagenet")]
    Imagenet,
    #[serde(rename = "none", alias = "random")]
    Random,
}

/// Summary of a prepared model
#[derive(Debug, Clone, Serialize)]
pub struct PreparedModel {
    pub total_params: usize,
    pub trainable_params: usize,
    pub head_params: usize,
}

/// Base model preparation component
pub struct PrepareBaseModel<B: Backend> {
    config: PrepareBaseModelConfig,
    device: B::Device,
}

impl<B: Backend> PrepareBaseModel<B> {
    pub fn new(config: PrepareBaseModelConfig, device: B::Device) -> Self {
        Self { config, device }
    }

    pub fn backbone_config(&self) -> VggConfig {
        let blocks = self
            .config
            .backbone_blocks
            .clone()
            .unwrap_or_else(|| self.config.backbone.blocks());
        VggConfig::new(blocks).with_include_top(self.config.include_top)
    }

    pub fn classifier_config(&self) -> TransferClassifierConfig {
        TransferClassifierConfig {
            backbone: self.backbone_config(),
            num_classes: self.config.classes,
            image_size: self.config.image_size,
            freeze: self.config.freeze,
        }
    }

    fn compile_spec(&self) -> CompileSpec {
        CompileSpec {
            optimizer: self.config.optimizer,
            learning_rate: self.config.learning_rate,
            loss: self.config.loss,
        }
    }

    /// Build the backbone and save it to `base_model_path`
    pub fn load_base(&self) -> Result<Vgg<B>> {
        let backbone_config = self.backbone_config();
        let size = self.config.image_size;

        let backbone = match self.config.weights {
            WeightsSource::Imagenet => {
                if self.config.include_top
                    && (size.height != IMAGENET_INPUT_SIDE || size.width != IMAGENET_INPUT_SIDE)
                {
                    return Err(PipelineError::Config(format!(
                        "INCLUDE_TOP with imagenet weights requires a {0}x{0} input, got {1}",
                        IMAGENET_INPUT_SIDE, size
                    )));
                }
                let weights = self.pretrained_weights()?;
                info!("Loading pretrained backbone from {}", weights.display());
                store::load_backbone_weights::<B>(&backbone_config, size, &weights, &self.device)?
            }
            WeightsSource::Random => {
                info!("Initializing {} backbone with random weights", self.config.backbone.name());
                backbone_config.init::<B>(size, &self.device)
            }
        };

        let spec = BackboneSpec {
            backbone: backbone_config,
            image_size: size,
            pretrained: self.config.weights == WeightsSource::Imagenet,
        };
        self.save_backbone(&backbone, &spec, &self.config.base_model_path)?;
        Ok(backbone)
    }

    /// Local pretrained weights, fetching them first when a URL is configured
    fn pretrained_weights(&self) -> Result<std::path::PathBuf> {
        let path = self.config.pretrained_weights_path.clone().ok_or_else(|| {
            PipelineError::ModelLoad(
                "WEIGHTS is 'imagenet' but no pretrained_weights_path is configured".to_string(),
            )
        })?;
        let weights = store::weights_path(&path);

        if !weights.is_file() {
            if let Some(url) = &self.config.pretrained_weights_url {
                let fetcher = DataIngestion::new(DataIngestionConfig {
                    root_dir: self.config.root_dir.clone(),
                    source_url: url.clone(),
                    local_data_file: weights.clone(),
                    unzip_dir: self.config.root_dir.clone(),
                });
                fetcher.fetch().map_err(|e| {
                    PipelineError::ModelLoad(format!("fetching pretrained weights: {}", e))
                })?;
            }
        }
        Ok(weights)
    }

    /// Freeze the backbone per policy and attach the dense head
    pub fn freeze_and_extend(&self, base: Vgg<B>) -> TransferClassifier<B> {
        let model = self.classifier_config().init_with_backbone(base, &self.device);
        info!(
            "Full model: {} parameters, {} trainable",
            model.num_params(),
            model.trainable_params()
        );
        model
    }

    pub fn save_backbone(&self, backbone: &Vgg<B>, spec: &BackboneSpec, path: &Path) -> Result<()> {
        store::save_backbone(backbone, spec, path)
    }

    pub fn save(&self, model: &TransferClassifier<B>, path: &Path) -> Result<()> {
        let spec = ModelSpec::new(self.classifier_config(), self.compile_spec());
        store::save_model(model, &spec, path)
    }

    /// Whole stage: load base, extend, save the updated model
    pub fn run(&self) -> Result<PreparedModel> {
        let base = self.load_base()?;
        let model = self.freeze_and_extend(base);
        self.save(&model, &self.config.updated_base_model_path)?;

        Ok(PreparedModel {
            total_params: model.num_params(),
            trainable_params: model.trainable_params(),
            head_params: self.classifier_config().head_params(),
        })
    }
}
