//! Model training
//!
//! Loads the prepared base model, builds the training/validation generators
//! from the class-folder dataset and fits the model for the configured number
//! of epochs. Only parameters that still require gradients are updated.

use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use burn::data::dataloader::batcher::Batcher;
use burn::module::AutodiffModule;
use burn::optim::{AdamConfig, GradientsParams, Optimizer, SgdConfig};
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::ElementConversion;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::objective::{
    correct_predictions, evaluate_generator, LossKind, MetricAccumulator, Metrics, OptimizerKind,
};
use crate::config::TrainingConfig;
use crate::dataset::augmentation::Augmenter;
use crate::dataset::burn_dataset::{ImageBatch, ImageBatcher, ImageDataset};
use crate::dataset::generator::ImageGenerator;
use crate::dataset::loader::{ImageFolder, Subset};
use crate::model::store::{self, ModelSpec};
use crate::model::{ImageClassifier, TransferClassifier};
use crate::utils::error::{PipelineError, Result};
use crate::utils::format_duration;

/// Metrics of one epoch
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch: usize,
    pub loss: f64,
    pub accuracy: f64,
    pub val_loss: f64,
    pub val_accuracy: f64,
    pub duration_secs: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub epochs: Vec<EpochRecord>,
}

impl TrainingHistory {
    pub fn last(&self) -> Option<&EpochRecord> {
        self.epochs.last()
    }
}

/// Outcome of the training stage
#[derive(Debug, Clone, Serialize)]
pub struct TrainingSummary {
    pub history: TrainingHistory,
    pub train_samples: usize,
    pub val_samples: usize,
    /// Undecodable files left out of either subset
    pub skipped_images: usize,
    pub model_path: PathBuf,
}

/// Training component
pub struct Training<B: AutodiffBackend> {
    config: TrainingConfig,
    device: B::Device,
}

impl<B: AutodiffBackend> Training<B> {
    pub fn new(config: TrainingConfig, device: B::Device) -> Self {
        Self { config, device }
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Load the prepared (frozen + extended) model
    pub fn get_base_model(&self) -> Result<(TransferClassifier<B>, ModelSpec)> {
        store::load_model::<B>(&self.config.updated_base_model_path, &self.device)
    }

    /// Training and validation generators over the configured dataset
    pub fn build_generators(&self) -> Result<(ImageGenerator, ImageGenerator)> {
        let c = &self.config;
        let folder = ImageFolder::scan(&c.training_data)
            .map_err(|e| PipelineError::Training(e.to_string()))?;

        let train_samples = folder.split(c.validation_split, Subset::Training);
        let val_samples = folder.split(c.validation_split, Subset::Validation);
        info!(
            "Split {} images: {} training / {} validation",
            folder.len(),
            train_samples.len(),
            val_samples.len()
        );

        let train_set = ImageDataset::load(&train_samples, c.image_size);
        let val_set = ImageDataset::load(&val_samples, c.image_size);

        let mut train = ImageGenerator::new(train_set, folder.class_names.clone(), c.batch_size)
            .with_shuffle(c.seed);
        if c.augmentation {
            train = train.with_augmentation(Augmenter::new(c.augmentation_params.clone()));
        }
        let valid = ImageGenerator::new(val_set, folder.class_names, c.batch_size);

        Ok((train, valid))
    }

    /// Fit with the optimizer and loss the model was prepared with
    pub fn train(
        &self,
        model: TransferClassifier<B>,
        spec: &ModelSpec,
        train: &ImageGenerator,
        valid: &ImageGenerator,
    ) -> Result<(TransferClassifier<B>, TrainingHistory)> {
        if train.is_empty() {
            return Err(PipelineError::Training(
                "training generator yields no images".to_string(),
            ));
        }
        if valid.is_empty() {
            return Err(PipelineError::Training(
                "validation generator yields no images".to_string(),
            ));
        }
        if train.num_classes() != model.num_classes() {
            return Err(PipelineError::Training(format!(
                "dataset has {} classes but the model expects {}",
                train.num_classes(),
                model.num_classes()
            )));
        }

        let options = FitOptions {
            epochs: self.config.epochs,
            learning_rate: spec.compile.learning_rate,
            loss: spec.compile.loss,
        };
        match spec.compile.optimizer {
            OptimizerKind::Sgd => {
                let mut optimizer = SgdConfig::new().init::<B, TransferClassifier<B>>();
                fit(model, &mut optimizer, &options, train, valid, &self.device)
            }
            OptimizerKind::Adam => {
                let mut optimizer = AdamConfig::new().init::<B, TransferClassifier<B>>();
                fit(model, &mut optimizer, &options, train, valid, &self.device)
            }
        }
    }

    /// Whole stage: load, fit, save the model and its history
    pub fn run(&self) -> Result<TrainingSummary> {
        if self.config.epochs == 0 {
            return Err(PipelineError::Training("EPOCHS must be at least 1".to_string()));
        }

        let (model, mut spec) = self.get_base_model()?;
        let (train, valid) = self.build_generators()?;
        let skipped_images = train.skipped() + valid.skipped();
        if skipped_images > 0 {
            warn!("{} undecodable images left out of training", skipped_images);
        }
        info!(
            "Training for {} epochs, {} steps per epoch, {} validation steps",
            self.config.epochs,
            train.num_batches(),
            valid.num_batches()
        );

        let (model, history) = self.train(model, &spec, &train, &valid)?;

        spec.class_names = train.class_names().to_vec();
        store::save_model(&model, &spec, &self.config.trained_model_path)?;
        fs::write(
            &self.config.history_path,
            serde_json::to_string_pretty(&history)?,
        )?;

        Ok(TrainingSummary {
            history,
            train_samples: train.len(),
            val_samples: valid.len(),
            skipped_images,
            model_path: self.config.trained_model_path.clone(),
        })
    }
}

/// Hyperparameters of a [`fit`] call
#[derive(Debug, Clone, Copy)]
pub struct FitOptions {
    pub epochs: usize,
    pub learning_rate: f64,
    pub loss: LossKind,
}

/// Generic training loop over any classifier and optimizer
pub fn fit<B, M, O>(
    mut model: M,
    optimizer: &mut O,
    options: &FitOptions,
    train: &ImageGenerator,
    valid: &ImageGenerator,
    device: &B::Device,
) -> Result<(M, TrainingHistory)>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + ImageClassifier<B>,
    M::InnerModule: ImageClassifier<B::InnerBackend>,
    O: Optimizer<M, B>,
{
    if options.epochs == 0 {
        return Err(PipelineError::Training("EPOCHS must be at least 1".to_string()));
    }
    if train.num_batches() == 0 {
        return Err(PipelineError::Training("no training batches".to_string()));
    }

    let batcher = ImageBatcher::new(train.image_size(), model.num_classes());
    let mut history = TrainingHistory::default();

    for epoch in 1..=options.epochs {
        let started = Instant::now();
        let mut metrics = MetricAccumulator::default();

        for items in train.epoch(epoch) {
            if items.is_empty() {
                continue;
            }
            let batch_size = items.len();
            let batch: ImageBatch<B> = batcher.batch(items, device);

            let logits = model.forward(batch.images.clone());
            let loss = options.loss.compute(logits.clone(), &batch);

            let batch_loss: f64 = loss.clone().into_scalar().elem();
            if !batch_loss.is_finite() {
                return Err(PipelineError::Training(format!(
                    "loss diverged to {} in epoch {}",
                    batch_loss, epoch
                )));
            }
            let correct = correct_predictions(logits, batch.targets);
            metrics.update(batch_loss, correct, batch_size);

            let grads = GradientsParams::from_grads(loss.backward(), &model);
            model = optimizer.step(options.learning_rate, model, grads);
        }

        let train_metrics: Metrics = metrics.finish();
        let val_metrics = evaluate_generator::<B::InnerBackend, _>(
            &model.valid(),
            valid,
            options.loss,
            device,
        );
        let duration = started.elapsed().as_secs_f64();

        info!(
            "Epoch {}/{} - {} - loss: {:.4} - accuracy: {:.4} - val_loss: {:.4} - val_accuracy: {:.4}",
            epoch,
            options.epochs,
            format_duration(duration),
            train_metrics.loss,
            train_metrics.accuracy,
            val_metrics.loss,
            val_metrics.accuracy
        );

        history.epochs.push(EpochRecord {
            epoch,
            loss: train_metrics.loss,
            accuracy: train_metrics.accuracy,
            val_loss: val_metrics.loss,
            val_accuracy: val_metrics.accuracy,
            duration_secs: duration,
        });
    }

    Ok((model, history))
}
