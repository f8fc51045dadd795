//! Model evaluation and experiment logging

use std::collections::BTreeMap;
use std::fs;

use burn::tensor::backend::Backend;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::EvaluationConfig;
use crate::dataset::burn_dataset::ImageDataset;
use crate::dataset::generator::ImageGenerator;
use crate::dataset::loader::{ImageFolder, Subset};
use crate::model::store::{self, ModelSpec};
use crate::model::TransferClassifier;
use crate::tracking::{tracker_for_uri, ExperimentTracker, RunStatus};
use crate::training::objective::evaluate_generator;
use crate::utils::error::{PipelineError, Result};

/// Artifact directory of the model inside a tracked run
pub const MODEL_ARTIFACT_PATH: &str = "model";

/// Contents of `scores.json`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Scores {
    pub loss: f64,
    pub accuracy: f64,
}

impl Scores {
    pub fn is_valid(&self) -> bool {
        self.loss.is_finite() && self.loss >= 0.0 && self.accuracy.is_finite() && (0.0..=1.0).contains(&self.accuracy)
    }
}

/// What was recorded in the experiment tracker
#[derive(Debug, Clone, Serialize)]
pub struct TrackingReport {
    pub backend: String,
    pub run_id: String,
    pub registered_version: Option<String>,
}

/// Outcome of the evaluation stage
#[derive(Debug, Clone, Serialize)]
pub struct EvaluationReport {
    pub scores: Scores,
    pub samples: usize,
    /// Undecodable files left out of the evaluation subset
    pub skipped_images: usize,
    /// `None` when tracking failed; the failure is logged
    pub tracking: Option<TrackingReport>,
}

/// Images scored, and images dropped because they failed to decode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubsetCounts {
    pub samples: usize,
    pub skipped: usize,
}

/// Evaluation component
pub struct Evaluation<B: Backend> {
    config: EvaluationConfig,
    device: B::Device,
}

impl<B: Backend> Evaluation<B> {
    pub fn new(config: EvaluationConfig, device: B::Device) -> Self {
        Self { config, device }
    }

    pub fn config(&self) -> &EvaluationConfig {
        &self.config
    }

    /// Load the trained model; a missing model is an evaluation failure
    pub fn load_model(&self) -> Result<(TransferClassifier<B>, ModelSpec)> {
        let path = &self.config.path_of_model;
        if !store::model_exists(path) {
            return Err(PipelineError::Evaluation(format!(
                "trained model not found at {}",
                store::weights_path(path).display()
            )));
        }
        store::load_model::<B>(path, &self.device)
            .map_err(|e| PipelineError::Evaluation(e.to_string()))
    }

    /// Held-out generator: no shuffle, no augmentation
    pub fn valid_generator(&self) -> Result<ImageGenerator> {
        let c = &self.config;
        let folder = ImageFolder::scan(&c.training_data)
            .map_err(|e| PipelineError::Evaluation(e.to_string()))?;
        let samples = folder.split(c.evaluation_split, Subset::Validation);
        let dataset = ImageDataset::load(&samples, c.image_size);
        Ok(ImageGenerator::new(dataset, folder.class_names, c.batch_size))
    }

    /// Loss and accuracy of the trained model over the evaluation subset
    pub fn evaluate(&self) -> Result<(Scores, SubsetCounts)> {
        let (model, spec) = self.load_model()?;
        let generator = self.valid_generator()?;

        if generator.is_empty() {
            return Err(PipelineError::Evaluation(format!(
                "no evaluation images under {}",
                self.config.training_data.display()
            )));
        }
        if generator.skipped() > 0 {
            warn!(
                "{} undecodable images left out of the evaluation subset",
                generator.skipped()
            );
        }
        if generator.num_classes() != model.num_classes() {
            return Err(PipelineError::Evaluation(format!(
                "dataset has {} classes but the model predicts {}",
                generator.num_classes(),
                model.num_classes()
            )));
        }

        info!(
            "Evaluating on {} images in {} batches",
            generator.len(),
            generator.num_batches()
        );
        let metrics = evaluate_generator(&model, &generator, spec.compile.loss, &self.device);
        let scores = Scores {
            loss: metrics.loss,
            accuracy: metrics.accuracy,
        };
        if !scores.is_valid() {
            return Err(PipelineError::Evaluation(format!(
                "invalid scores: loss={} accuracy={}",
                scores.loss, scores.accuracy
            )));
        }
        Ok((
            scores,
            SubsetCounts {
                samples: metrics.samples,
                skipped: generator.skipped(),
            },
        ))
    }

    /// Overwrite the scores file
    pub fn save_scores(&self, scores: &Scores) -> Result<()> {
        let path = &self.config.scores_path;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(scores)?)?;
        info!("Scores saved to {}", path.display());
        Ok(())
    }

    /// Params, metrics and model artifacts into one run; registry per configuration
    pub fn log_into_tracker(
        &self,
        tracker: &dyn ExperimentTracker,
        scores: &Scores,
    ) -> Result<TrackingReport> {
        let c = &self.config;
        let run_name = format!("evaluation-{}", chrono::Utc::now().format("%Y%m%d-%H%M%S"));
        let run = tracker.start_run(&c.experiment_name, &run_name)?;
        info!(
            "Logging to {} tracker, run {}",
            tracker.backend_name(),
            run.run_id
        );

        let logged = (|| -> Result<Option<String>> {
            tracker.log_params(&run, &c.all_params)?;
            let metrics = BTreeMap::from([
                ("loss".to_string(), scores.loss),
                ("accuracy".to_string(), scores.accuracy),
            ]);
            tracker.log_metrics(&run, &metrics)?;

            let model = &c.path_of_model;
            tracker.log_artifact(&run, &store::weights_path(model), MODEL_ARTIFACT_PATH)?;
            tracker.log_artifact(&run, &store::spec_path(model), MODEL_ARTIFACT_PATH)?;
            if c.scores_path.is_file() {
                tracker.log_artifact(&run, &c.scores_path, "")?;
            }

            if c.model_registry.should_register(tracker) {
                let version =
                    tracker.register_model(&run, &c.registered_model_name, MODEL_ARTIFACT_PATH)?;
                info!("Registered '{}' version {}", c.registered_model_name, version);
                Ok(Some(version))
            } else {
                Ok(None)
            }
        })();

        let status = if logged.is_ok() {
            RunStatus::Finished
        } else {
            RunStatus::Failed
        };
        if let Err(e) = tracker.end_run(&run, status) {
            warn!("Could not close run {}: {}", run.run_id, e);
        }

        Ok(TrackingReport {
            backend: tracker.backend_name().to_string(),
            run_id: run.run_id,
            registered_version: logged?,
        })
    }

    /// Whole stage: evaluate, write scores, log to the tracker
    pub fn run(&self) -> Result<EvaluationReport> {
        let (scores, counts) = self.evaluate()?;
        info!("loss: {:.4}, accuracy: {:.4}", scores.loss, scores.accuracy);
        self.save_scores(&scores)?;

        let tracking = match tracker_for_uri(&self.config.mlflow_uri)
            .and_then(|tracker| self.log_into_tracker(tracker.as_ref(), &scores))
        {
            Ok(report) => Some(report),
            Err(e) if !e.is_fatal() => {
                warn!("Experiment tracking failed, scores kept locally: {}", e);
                None
            }
            Err(e) => return Err(e),
        };

        Ok(EvaluationReport {
            scores,
            samples: counts.samples,
            skipped_images: counts.skipped,
            tracking,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DefaultBackend;
    use crate::config::entity::ImageSize;
    use crate::model::classifier::{FreezePolicy, TransferClassifierConfig};
    use crate::model::store::CompileSpec;
    use crate::model::vgg::VggConfig;
    use crate::tracking::RegistryMode;
    use crate::training::objective::{LossKind, OptimizerKind};
    use image::{Rgb, RgbImage};
    use std::path::Path;
    use tempfile::tempdir;

    type TestBackend = DefaultBackend;

    fn write_dataset(root: &Path, per_class: usize) {
        for (class, shade) in [("adenocarcinoma", 40u8), ("normal", 200u8)] {
            let dir = root.join(class);
            fs::create_dir_all(&dir).unwrap();
            for i in 0..per_class {
                RgbImage::from_pixel(16, 16, Rgb([shade, shade, i as u8]))
                    .save(dir.join(format!("{}.png", i)))
                    .unwrap();
            }
        }
    }

    fn write_model(path: &Path) {
        let size = ImageSize::new(16, 16);
        let architecture = TransferClassifierConfig::new(
            VggConfig::new(vec![vec![4], vec![4]]),
            2,
            size,
            FreezePolicy::All,
        );
        let device = Default::default();
        let model = architecture.init::<TestBackend>(&device);
        let mut spec = ModelSpec::new(
            architecture,
            CompileSpec {
                optimizer: OptimizerKind::Sgd,
                learning_rate: 0.01,
                loss: LossKind::CategoricalCrossentropy,
            },
        );
        spec.class_names = vec!["adenocarcinoma".into(), "normal".into()];
        store::save_model(&model, &spec, path).unwrap();
    }

    fn config(root: &Path) -> EvaluationConfig {
        EvaluationConfig {
            path_of_model: root.join("training/model"),
            training_data: root.join("data"),
            scores_path: root.join("scores.json"),
            mlflow_uri: root.join("mlruns").display().to_string(),
            experiment_name: "test".into(),
            registered_model_name: "VGG16Model".into(),
            model_registry: RegistryMode::Auto,
            all_params: BTreeMap::from([("EPOCHS".to_string(), "1".to_string())]),
            image_size: ImageSize::new(16, 16),
            batch_size: 2,
            evaluation_split: 0.5,
        }
    }

    #[test]
    fn test_missing_model_is_evaluation_error() {
        let dir = tempdir().unwrap();
        write_dataset(&dir.path().join("data"), 2);
        let eval = Evaluation::<TestBackend>::new(config(dir.path()), Default::default());
        assert!(matches!(eval.evaluate(), Err(PipelineError::Evaluation(_))));
    }

    #[test]
    fn test_scores_file_has_loss_and_accuracy() {
        let dir = tempdir().unwrap();
        write_dataset(&dir.path().join("data"), 4);
        write_model(&dir.path().join("training/model"));

        let eval = Evaluation::<TestBackend>::new(config(dir.path()), Default::default());
        let report = eval.run().unwrap();
        assert_eq!(report.samples, 4);
        assert_eq!(report.skipped_images, 0);

        let raw = fs::read_to_string(dir.path().join("scores.json")).unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        let obj = json.as_object().unwrap();
        assert_eq!(obj.len(), 2);
        let loss = obj["loss"].as_f64().unwrap();
        let accuracy = obj["accuracy"].as_f64().unwrap();
        assert!(loss.is_finite() && loss >= 0.0);
        assert!((0.0..=1.0).contains(&accuracy));

        let tracking = report.tracking.unwrap();
        assert_eq!(tracking.backend, "file");
        assert!(tracking.registered_version.is_none());
    }

    #[test]
    fn test_undecodable_images_are_reported() {
        let dir = tempdir().unwrap();
        write_dataset(&dir.path().join("data"), 4);
        // Sorts first, so it lands in the evaluation subset
        fs::write(dir.path().join("data/normal/0a.png"), b"not a png").unwrap();
        write_model(&dir.path().join("training/model"));

        let eval = Evaluation::<TestBackend>::new(config(dir.path()), Default::default());
        let (_, counts) = eval.evaluate().unwrap();
        assert_eq!(counts.skipped, 1);

        let report = eval.run().unwrap();
        assert_eq!(report.skipped_images, 1);
        // floor(0.5 * 5) = 2 normal files selected, one of them unreadable
        assert_eq!(report.samples, 3);
    }

    #[test]
    fn test_tracking_failure_is_not_fatal() {
        let dir = tempdir().unwrap();
        write_dataset(&dir.path().join("data"), 4);
        write_model(&dir.path().join("training/model"));

        let mut cfg = config(dir.path());
        cfg.mlflow_uri = "http://127.0.0.1:9".into();
        let eval = Evaluation::<TestBackend>::new(cfg, Default::default());

        let report = eval.run().unwrap();
        assert!(report.tracking.is_none());
        assert!(dir.path().join("scores.json").is_file());
    }

    #[test]
    fn test_forced_registry_on_file_store_fails_softly() {
        let dir = tempdir().unwrap();
        write_dataset(&dir.path().join("data"), 4);
        write_model(&dir.path().join("training/model"));

        let mut cfg = config(dir.path());
        cfg.model_registry = RegistryMode::Always;
        let eval = Evaluation::<TestBackend>::new(cfg, Default::default());

        let report = eval.run().unwrap();
        assert!(report.tracking.is_none());
    }

    #[test]
    fn test_scores_validity() {
        assert!(Scores { loss: 0.3, accuracy: 0.9 }.is_valid());
        assert!(!Scores { loss: f64::NAN, accuracy: 0.9 }.is_valid());
        assert!(!Scores { loss: -1.0, accuracy: 0.5 }.is_valid());
    }
}
