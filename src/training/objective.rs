//! Losses, optimizer selection and batch metrics shared by training and evaluation

use burn::nn::loss::CrossEntropyLossConfig;
use burn::prelude::*;
use burn::tensor::ElementConversion;
use burn::tensor::activation::softmax;
use burn::data::dataloader::batcher::Batcher;
use serde::{Deserialize, Serialize};

use crate::dataset::burn_dataset::{ImageBatch, ImageBatcher};
use crate::dataset::generator::ImageGenerator;
use crate::model::ImageClassifier;

/// Probabilities are clamped away from 0 and 1 before taking logarithms
const PROB_EPSILON: f32 = 1e-7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    #[default]
    Sgd,
    Adam,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossKind {
    #[default]
    CategoricalCrossentropy,
    BinaryCrossentropy,
}

impl LossKind {
    /// Mean loss of a batch given the model's logits
    pub fn compute<B: Backend>(&self, logits: Tensor<B, 2>, batch: &ImageBatch<B>) -> Tensor<B, 1> {
        match self {
            LossKind::CategoricalCrossentropy => CrossEntropyLossConfig::new()
                .init(&logits.device())
                .forward(logits, batch.targets.clone()),
            LossKind::BinaryCrossentropy => {
                let probs = softmax(logits, 1).clamp(PROB_EPSILON, 1.0 - PROB_EPSILON);
                let targets = batch.one_hot.clone();
                let positive = targets.clone() * probs.clone().log();
                let negative = targets.neg().add_scalar(1.0) * probs.neg().add_scalar(1.0).log();
                (positive + negative).mean().neg()
            }
        }
    }
}

/// Number of rows whose argmax matches the target
pub fn correct_predictions<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> usize {
    let [batch_size, _] = logits.dims();
    let predictions = logits.argmax(1).reshape([batch_size]);
    let correct: i64 = predictions
        .equal(targets)
        .int()
        .sum()
        .into_scalar()
        .elem();
    correct as usize
}

/// Loss and accuracy over a set of samples
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Metrics {
    pub loss: f64,
    pub accuracy: f64,
    pub samples: usize,
}

/// Sample-weighted running mean of batch losses plus correct counts
#[derive(Debug, Clone, Default)]
pub struct MetricAccumulator {
    loss_sum: f64,
    correct: usize,
    samples: usize,
}

impl MetricAccumulator {
    pub fn update(&mut self, batch_loss: f64, correct: usize, batch_size: usize) {
        self.loss_sum += batch_loss * batch_size as f64;
        self.correct += correct;
        self.samples += batch_size;
    }

    pub fn finish(&self) -> Metrics {
        if self.samples == 0 {
            return Metrics::default();
        }
        Metrics {
            loss: self.loss_sum / self.samples as f64,
            accuracy: self.correct as f64 / self.samples as f64,
            samples: self.samples,
        }
    }
}

/// Forward every batch of one pass over `generator` and aggregate loss/accuracy
pub fn evaluate_generator<B: Backend, M: ImageClassifier<B>>(
    model: &M,
    generator: &ImageGenerator,
    loss: LossKind,
    device: &B::Device,
) -> Metrics {
    let batcher = ImageBatcher::new(generator.image_size(), model.num_classes());
    let mut metrics = MetricAccumulator::default();

    for items in generator.epoch(0) {
        if items.is_empty() {
            continue;
        }
        let batch_size = items.len();
        let batch: ImageBatch<B> = batcher.batch(items, device);
        let logits = model.forward(batch.images.clone());

        let batch_loss: f64 = loss.compute(logits.clone(), &batch).into_scalar().elem();
        let correct = correct_predictions(logits, batch.targets);
        metrics.update(batch_loss, correct, batch_size);
    }

    metrics.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DefaultBackend;

    type TestBackend = DefaultBackend;

    fn batch(labels: &[usize]) -> ImageBatch<TestBackend> {
        let device = Default::default();
        let n = labels.len();
        let targets: Vec<i64> = labels.iter().map(|&l| l as i64).collect();
        let mut one_hot = vec![0.0f32; n * 2];
        for (i, &l) in labels.iter().enumerate() {
            one_hot[i * 2 + l] = 1.0;
        }
        ImageBatch {
            images: Tensor::zeros([n, 3, 1, 1], &device),
            targets: Tensor::from_data(TensorData::new(targets, [n]), &device),
            one_hot: Tensor::from_floats(TensorData::new(one_hot, [n, 2]), &device),
        }
    }

    fn logits(values: Vec<f32>) -> Tensor<TestBackend, 2> {
        let n = values.len() / 2;
        Tensor::from_floats(TensorData::new(values, [n, 2]), &Default::default())
    }

    #[test]
    fn test_uniform_logits_give_ln2() {
        let b = batch(&[0, 1]);
        for kind in [LossKind::CategoricalCrossentropy, LossKind::BinaryCrossentropy] {
            let loss: f64 = kind.compute(logits(vec![0.0; 4]), &b).into_scalar().elem();
            assert!((loss - std::f64::consts::LN_2).abs() < 1e-4, "{:?}: {}", kind, loss);
        }
    }

    #[test]
    fn test_confident_correct_logits_give_small_loss() {
        let b = batch(&[0, 1]);
        let loss: f64 = LossKind::BinaryCrossentropy
            .compute(logits(vec![10.0, -10.0, -10.0, 10.0]), &b)
            .into_scalar()
            .elem();
        assert!(loss >= 0.0 && loss < 1e-3);
    }

    #[test]
    fn test_correct_predictions() {
        let b = batch(&[0, 1, 1]);
        let l = logits(vec![2.0, 1.0, 0.0, 3.0, 5.0, 4.0]);
        assert_eq!(correct_predictions(l, b.targets), 2);
    }

    #[test]
    fn test_accumulator_weights_by_batch_size() {
        let mut acc = MetricAccumulator::default();
        acc.update(1.0, 2, 2);
        acc.update(4.0, 0, 1);
        let m = acc.finish();
        assert!((m.loss - 2.0).abs() < 1e-12);
        assert!((m.accuracy - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(m.samples, 3);
        assert_eq!(MetricAccumulator::default().finish(), Metrics::default());
    }

    #[test]
    fn test_loss_names() {
        let k: LossKind = serde_yaml::from_str("binary_crossentropy").unwrap();
        assert_eq!(k, LossKind::BinaryCrossentropy);
        let o: OptimizerKind = serde_yaml::from_str("adam").unwrap();
        assert_eq!(o, OptimizerKind::Adam);
    }
}
