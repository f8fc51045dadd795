//! Configuration management
//!
//! Reads `config/config.yaml` (paths and tracking settings) and `params.yaml`
//! (hyperparameters) once and hands out one immutable record per stage.
//! Every getter creates the output directories its stage writes to.

pub mod entity;

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub use entity::{
    DataIngestionConfig, EvaluationConfig, ImageSize, PredictionConfig, PrepareBaseModelConfig,
    TrainingConfig,
};

use crate::dataset::augmentation::AugmentationConfig;
use crate::model::base_model::WeightsSource;
use crate::model::classifier::FreezePolicy;
use crate::model::vgg::BackboneKind;
use crate::tracking::RegistryMode;
use crate::training::objective::{LossKind, OptimizerKind};
use crate::utils::error::{PipelineError, Result};

pub const CONFIG_FILE_PATH: &str = "config/config.yaml";
pub const PARAMS_FILE_PATH: &str = "params.yaml";

/// Environment variables that override the default file locations
pub const CONFIG_PATH_ENV: &str = "CONFIG_FILE_PATH";
pub const PARAMS_PATH_ENV: &str = "PARAMS_FILE_PATH";
/// Overrides `evaluation.mlflow_uri`
pub const MLFLOW_URI_ENV: &str = "MLFLOW_TRACKING_URI";

/// Folder inside the extracted archive that holds one sub-directory per class
pub const DEFAULT_DATASET_FOLDER: &str = "Chest-CT-Scan-data";

// ============================================================================
// config.yaml
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
struct ProjectConfig {
    artifacts_root: PathBuf,
    data_ingestion: DataIngestionSection,
    prepare_base_model: PrepareBaseModelSection,
    training: TrainingSection,
    evaluation: EvaluationSection,
}

#[derive(Debug, Clone, Deserialize)]
struct DataIngestionSection {
    root_dir: PathBuf,
    #[serde(alias = "source_URL")]
    source_url: String,
    local_data_file: PathBuf,
    unzip_dir: PathBuf,
    #[serde(default)]
    dataset_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
struct PrepareBaseModelSection {
    root_dir: PathBuf,
    base_model_path: PathBuf,
    updated_base_model_path: PathBuf,
    #[serde(default)]
    pretrained_weights_path: Option<PathBuf>,
    #[serde(default)]
    pretrained_weights_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct TrainingSection {
    root_dir: PathBuf,
    trained_model_path: PathBuf,
    #[serde(default)]
    history_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
struct EvaluationSection {
    #[serde(default = "default_scores_path")]
    scores_path: PathBuf,
    #[serde(default = "default_mlflow_uri")]
    mlflow_uri: String,
    #[serde(default = "default_experiment_name")]
    experiment_name: String,
    #[serde(default = "default_registered_model_name")]
    registered_model_name: String,
    #[serde(default)]
    model_registry: RegistryMode,
}

fn default_scores_path() -> PathBuf {
    PathBuf::from("scores.json")
}

fn default_mlflow_uri() -> String {
    "mlruns".to_string()
}

fn default_experiment_name() -> String {
    "chest-cancer-classification".to_string()
}

fn default_registered_model_name() -> String {
    "VGG16Model".to_string()
}

// ============================================================================
// params.yaml
// ============================================================================

/// Hyperparameters from params.yaml
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct Params {
    pub augmentation: bool,
    pub image_size: ImageSize,
    pub batch_size: usize,
    pub include_top: bool,
    pub epochs: usize,
    pub classes: usize,
    pub weights: WeightsSource,
    pub learning_rate: f64,
    #[serde(default)]
    pub backbone: BackboneKind,
    /// Output channels of every conv layer, grouped per pooling block
    #[serde(default)]
    pub backbone_blocks: Option<Vec<Vec<usize>>>,
    #[serde(default = "default_true")]
    pub freeze_all: bool,
    #[serde(default)]
    pub freeze_till: Option<usize>,
    #[serde(default)]
    pub optimizer: OptimizerKind,
    #[serde(default)]
    pub loss: LossKind,
    #[serde(default = "default_validation_split")]
    pub validation_split: f64,
    #[serde(default = "default_evaluation_split")]
    pub evaluation_split: f64,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_threshold")]
    pub prediction_threshold: f32,
    #[serde(default)]
    pub augmentation_params: AugmentationConfig,
}

fn default_true() -> bool {
    true
}

fn default_validation_split() -> f64 {
    0.2
}

fn default_evaluation_split() -> f64 {
    0.3
}

fn default_seed() -> u64 {
    42
}

fn default_threshold() -> f32 {
    0.5
}

impl Params {
    /// Check value ranges that serde cannot express
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(PipelineError::Config(msg));

        if self.classes < 2 {
            return fail(format!("CLASSES must be at least 2, got {}", self.classes));
        }
        if self.batch_size == 0 {
            return fail("BATCH_SIZE must be at least 1".to_string());
        }
        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            return fail(format!("LEARNING_RATE must be positive, got {}", self.learning_rate));
        }
        for (name, value) in [
            ("VALIDATION_SPLIT", self.validation_split),
            ("EVALUATION_SPLIT", self.evaluation_split),
        ] {
            if !(value > 0.0 && value < 1.0) {
                return fail(format!("{} must be in (0, 1), got {}", name, value));
            }
        }
        if !(0.0..=1.0).contains(&self.prediction_threshold) {
            return fail(format!(
                "PREDICTION_THRESHOLD must be in [0, 1], got {}",
                self.prediction_threshold
            ));
        }
        if let Some(blocks) = &self.backbone_blocks {
            if blocks.is_empty() || blocks.iter().any(|b| b.is_empty() || b.contains(&0)) {
                return fail("BACKBONE_BLOCKS must be non-empty lists of channel counts".to_string());
            }
        }

        let num_blocks = self
            .backbone_blocks
            .as_ref()
            .map(|b| b.len())
            .unwrap_or_else(|| self.backbone.blocks().len());
        let min_side = 1usize << num_blocks;
        if self.image_size.height < min_side || self.image_size.width < min_side {
            return fail(format!(
                "IMAGE_SIZE {} is too small for {} pooling blocks (minimum side {})",
                self.image_size, num_blocks, min_side
            ));
        }

        Ok(())
    }

    /// Freezing policy derived from FREEZE_ALL / FREEZE_TILL
    pub fn freeze_policy(&self) -> FreezePolicy {
        match (self.freeze_all, self.freeze_till) {
            (true, _) => FreezePolicy::All,
            (false, Some(n)) => FreezePolicy::AllButLast(n),
            (false, None) => FreezePolicy::None,
        }
    }
}

// ============================================================================
// ConfigurationManager
// ============================================================================

/// Loads both YAML documents and builds per-stage configuration records
#[derive(Debug, Clone)]
pub struct ConfigurationManager {
    config: ProjectConfig,
    params: Params,
    raw_params: BTreeMap<String, String>,
}

impl ConfigurationManager {
    /// Read and validate both files, then create `artifacts_root`
    pub fn new(config_path: impl AsRef<Path>, params_path: impl AsRef<Path>) -> Result<Self> {
        let config_path = config_path.as_ref();
        let params_path = params_path.as_ref();

        let config_text = read_file(config_path)?;
        let params_text = read_file(params_path)?;

        let manager = Self::from_yaml(&config_text, &params_text).map_err(|e| match e {
            PipelineError::Config(msg) => PipelineError::Config(format!(
                "{} / {}: {}",
                config_path.display(),
                params_path.display(),
                msg
            )),
            other => other,
        })?;

        info!(
            "Loaded configuration from {} and {}",
            config_path.display(),
            params_path.display()
        );
        Ok(manager)
    }

    /// Default locations, overridable through the environment
    pub fn from_default_paths() -> Result<Self> {
        let config = env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| CONFIG_FILE_PATH.to_string());
        let params = env::var(PARAMS_PATH_ENV).unwrap_or_else(|_| PARAMS_FILE_PATH.to_string());
        Self::new(config, params)
    }

    /// Parse already-loaded YAML documents
    pub fn from_yaml(config_yaml: &str, params_yaml: &str) -> Result<Self> {
        let config: ProjectConfig = serde_yaml::from_str(config_yaml)
            .map_err(|e| PipelineError::Config(format!("config.yaml: {}", e)))?;
        let params: Params = serde_yaml::from_str(params_yaml)
            .map_err(|e| PipelineError::Config(format!("params.yaml: {}", e)))?;
        params.validate()?;

        let raw: BTreeMap<String, serde_yaml::Value> = serde_yaml::from_str(params_yaml)
            .map_err(|e| PipelineError::Config(format!("params.yaml: {}", e)))?;
        let raw_params = flatten_params(&raw);

        create_directories(&[&config.artifacts_root])?;

        Ok(Self {
            config,
            params,
            raw_params,
        })
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn artifacts_root(&self) -> &Path {
        &self.config.artifacts_root
    }

    fn dataset_dir(&self) -> PathBuf {
        let ingestion = &self.config.data_ingestion;
        ingestion
            .dataset_dir
            .clone()
            .unwrap_or_else(|| ingestion.unzip_dir.join(DEFAULT_DATASET_FOLDER))
    }

    pub fn get_data_ingestion_config(&self) -> Result<DataIngestionConfig> {
        let section = &self.config.data_ingestion;
        create_directories(&[&section.root_dir, &section.unzip_dir])?;

        Ok(DataIngestionConfig {
            root_dir: section.root_dir.clone(),
            source_url: section.source_url.clone(),
            local_data_file: section.local_data_file.clone(),
            unzip_dir: section.unzip_dir.clone(),
        })
    }

    pub fn get_prepare_base_model_config(&self) -> Result<PrepareBaseModelConfig> {
        let section = &self.config.prepare_base_model;
        if let Some(weights) = &section.pretrained_weights_path {
            // The stage's root_dir is wiped before every rerun
            if weights.starts_with(&section.root_dir) {
                return Err(PipelineError::Config(format!(
                    "pretrained_weights_path {} must live outside prepare_base_model.root_dir {}",
                    weights.display(),
                    section.root_dir.display()
                )));
            }
        }
        create_directories(&[&section.root_dir])?;

        let p = &self.params;
        Ok(PrepareBaseModelConfig {
            root_dir: section.root_dir.clone(),
            base_model_path: section.base_model_path.clone(),
            updated_base_model_path: section.updated_base_model_path.clone(),
            pretrained_weights_path: section.pretrained_weights_path.clone(),
            pretrained_weights_url: section.pretrained_weights_url.clone(),
            image_size: p.image_size,
            backbone: p.backbone,
            backbone_blocks: p.backbone_blocks.clone(),
            include_top: p.include_top,
            weights: p.weights,
            classes: p.classes,
            learning_rate: p.learning_rate,
            optimizer: p.optimizer,
            loss: p.loss,
            freeze: p.freeze_policy(),
        })
    }

    pub fn get_training_config(&self) -> Result<TrainingConfig> {
        let section = &self.config.training;
        create_directories(&[&section.root_dir])?;

        let p = &self.params;
        Ok(TrainingConfig {
            root_dir: section.root_dir.clone(),
            trained_model_path: section.trained_model_path.clone(),
            updated_base_model_path: self.config.prepare_base_model.updated_base_model_path.clone(),
            training_data: self.dataset_dir(),
            history_path: section
                .history_path
                .clone()
                .unwrap_or_else(|| section.root_dir.join("history.json")),
            epochs: p.epochs,
            batch_size: p.batch_size,
            augmentation: p.augmentation,
            augmentation_params: p.augmentation_params.clone(),
            image_size: p.image_size,
            validation_split: p.validation_split,
            seed: p.seed,
        })
    }

    pub fn get_evaluation_config(&self) -> Result<EvaluationConfig> {
        let section = &self.config.evaluation;
        if let Some(parent) = section.scores_path.parent() {
            create_directories(&[parent])?;
        }

        let mlflow_uri = env::var(MLFLOW_URI_ENV)
            .ok()
            .filter(|uri| !uri.trim().is_empty())
            .unwrap_or_else(|| section.mlflow_uri.clone());

        let p = &self.params;
        Ok(EvaluationConfig {
            path_of_model: self.config.training.trained_model_path.clone(),
            training_data: self.dataset_dir(),
            scores_path: section.scores_path.clone(),
            mlflow_uri,
            experiment_name: section.experiment_name.clone(),
            registered_model_name: section.registered_model_name.clone(),
            model_registry: section.model_registry,
            all_params: self.raw_params.clone(),
            image_size: p.image_size,
            batch_size: p.batch_size,
            evaluation_split: p.evaluation_split,
        })
    }

    pub fn get_prediction_config(&self) -> PredictionConfig {
        PredictionConfig {
            model_path: self.config.training.trained_model_path.clone(),
            threshold: self.params.prediction_threshold,
        }
    }
}

fn read_file(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .map_err(|e| PipelineError::Config(format!("cannot read {}: {}", path.display(), e)))
}

/// Create every directory (and its parents), mapping failures to configuration errors
pub fn create_directories(paths: &[&Path]) -> Result<()> {
    for path in paths {
        if path.as_os_str().is_empty() {
            continue;
        }
        fs::create_dir_all(path).map_err(|e| {
            PipelineError::Config(format!("cannot create directory {}: {}", path.display(), e))
        })?;
        debug!("Created directory at: {}", path.display());
    }
    Ok(())
}

/// Stringify top-level params for tracker logging; nested values become inline YAML/JSON
fn flatten_params(raw: &BTreeMap<String, serde_yaml::Value>) -> BTreeMap<String, String> {
    raw.iter()
        .map(|(key, value)| {
            let text = match value {
                serde_yaml::Value::Null => "null".to_string(),
                serde_yaml::Value::Bool(b) => b.to_string(),
                serde_yaml::Value::Number(n) => n.to_string(),
                serde_yaml::Value::String(s) => s.clone(),
                other => serde_json::to_string(other).unwrap_or_else(|_| format!("{:?}", other)),
            };
            (key.clone(), text)
        })
        .collect()
}
