//! Single-image prediction with a trained classifier

use std::path::Path;

use burn::tensor::backend::Backend;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{ImageSize, PredictionConfig};
use crate::dataset::burn_dataset::{decode_image_bytes, images_to_tensor, load_image, to_chw};
use crate::model::store::{self, ModelSpec};
use crate::model::TransferClassifier;
use crate::utils::error::{PipelineError, Result};

/// Result of classifying one image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    /// Predicted label
    pub class: String,
    pub class_index: usize,
    /// Probability of the predicted class
    pub confidence: f32,
    /// Softmax output in class-index order
    pub probabilities: Vec<f32>,
}

/// Map class probabilities to a class index.
///
/// Two-class models compare the positive-class (index 1) probability with
/// `threshold`; larger models take the argmax.
pub fn decide(probabilities: &[f32], threshold: f32) -> usize {
    if probabilities.len() == 2 {
        return if probabilities[1] >= threshold { 1 } else { 0 };
    }
    probabilities
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.total_cmp(b))
        .map(|(i, _)| i)
        .unwrap_or(0)
}

/// A loaded model ready to classify uploads
pub struct Predictor<B: Backend> {
    model: TransferClassifier<B>,
    spec: ModelSpec,
    threshold: f32,
    device: B::Device,
}

impl<B: Backend> Predictor<B> {
    pub fn new(model: TransferClassifier<B>, spec: ModelSpec, threshold: f32, device: B::Device) -> Self {
        Self {
            model,
            spec,
            threshold,
            device,
        }
    }

    /// Load the trained model from disk
    pub fn load(model_path: &Path, threshold: f32, device: B::Device) -> Result<Self> {
        let (model, spec) = store::load_model::<B>(model_path, &device)?;
        info!(
            "Loaded model {} ({} classes, input {})",
            model_path.display(),
            model.num_classes(),
            spec.image_size()
        );
        Ok(Self::new(model, spec, threshold, device))
    }

    pub fn from_config(config: &PredictionConfig, device: B::Device) -> Result<Self> {
        Self::load(&config.model_path, config.threshold, device)
    }

    pub fn image_size(&self) -> ImageSize {
        self.spec.image_size()
    }

    pub fn class_names(&self) -> Vec<String> {
        (0..self.model.num_classes())
            .map(|i| self.spec.class_name(i))
            .collect()
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Classify an image already resized to [`Predictor::image_size`]
    pub fn predict_image(&self, image: &RgbImage) -> Result<Prediction> {
        let size = self.image_size();
        if image.width() as usize != size.width || image.height() as usize != size.height {
            return Err(PipelineError::InvalidInput(format!(
                "expected a {}x{} image, got {}x{}",
                size.width,
                size.height,
                image.width(),
                image.height()
            )));
        }

        let input = images_to_tensor::<B>(to_chw(image), 1, size, &self.device);
        let probabilities: Vec<f32> = self
            .model
            .forward_softmax(input)
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| PipelineError::Serialization(format!("reading model output: {:?}", e)))?;

        let class_index = decide(&probabilities, self.threshold);
        Ok(Prediction {
            class: self.spec.class_name(class_index),
            class_index,
            confidence: probabilities.get(class_index).copied().unwrap_or(0.0),
            probabilities,
        })
    }

    /// Classify raw upload bytes; undecodable input is [`PipelineError::InvalidInput`]
    pub fn predict_bytes(&self, bytes: &[u8]) -> Result<Prediction> {
        let image = decode_image_bytes(bytes, self.image_size())?;
        self.predict_image(&image)
    }

    pub fn predict_path(&self, path: &Path) -> Result<Prediction> {
        let image = load_image(path, self.image_size())?;
        self.predict_image(&image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DefaultBackend;
    use crate::model::classifier::{FreezePolicy, TransferClassifierConfig};
    use crate::model::store::CompileSpec;
    use crate::model::vgg::VggConfig;
    use crate::training::objective::{LossKind, OptimizerKind};
    use image::{ImageFormat, Rgb};
    use std::io::Cursor;
    use tempfile::tempdir;

    type TestBackend = DefaultBackend;

    fn predictor() -> Predictor<TestBackend> {
        let architecture = TransferClassifierConfig::new(
            VggConfig::new(vec![vec![4]]),
            2,
            ImageSize::new(8, 8),
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
        Predictor::new(model, spec, 0.5, device)
    }

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb([120, 80, 200]));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn test_binary_threshold() {
        assert_eq!(decide(&[0.6, 0.4], 0.5), 0);
        assert_eq!(decide(&[0.4, 0.6], 0.5), 1);
        assert_eq!(decide(&[0.5, 0.5], 0.5), 1);
        assert_eq!(decide(&[0.3, 0.7], 0.8), 0);
    }

    #[test]
    fn test_multiclass_argmax() {
        assert_eq!(decide(&[0.2, 0.5, 0.3], 0.9), 1);
        assert_eq!(decide(&[], 0.5), 0);
    }

    #[test]
    fn test_predict_returns_known_label() {
        let predictor = predictor();
        let prediction = predictor.predict_bytes(&png_bytes(32, 20)).unwrap();

        assert!(predictor.class_names().contains(&prediction.class));
        assert_eq!(prediction.probabilities.len(), 2);
        let total: f32 = prediction.probabilities.iter().sum();
        assert!((total - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_non_image_is_invalid_input() {
        let predictor = predictor();
        assert!(matches!(
            predictor.predict_bytes(b"definitely not a png"),
            Err(PipelineError::InvalidInput(_))
        ));
        assert!(matches!(
            predictor.predict_bytes(&[]),
            Err(PipelineError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_missing_model_fails_to_load() {
        let dir = tempdir().unwrap();
        let result = Predictor::<TestBackend>::load(&dir.path().join("model"), 0.5, Default::default());
        assert!(matches!(result, Err(PipelineError::ModelLoad(_))));
    }
}
