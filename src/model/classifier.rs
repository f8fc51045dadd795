//! Transfer-learning classifier: VGG backbone, flatten, dense head
//!
//! The backbone is (partially) frozen so that training only updates the
//! remaining layers and the head. Freezing is part of the model description
//! and is re-applied whenever a model is rebuilt from disk.

use burn::{
    config::Config,
    module::Module,
    nn::{Linear, LinearConfig},
    tensor::{activation::softmax, backend::Backend, Tensor},
};
use serde::{Deserialize, Serialize};

use super::vgg::{Vgg, VggConfig};
use super::ImageClassifier;
use crate::config::ImageSize;

/// Which backbone layers stop receiving gradient updates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "trainable_layers", rename_all = "snake_case")]
pub enum FreezePolicy {
    /// Freeze the whole backbone
    All,
    /// Keep the last `n` weighted backbone layers trainable
    AllButLast(usize),
    /// Train everything
    None,
}

impl FreezePolicy {
    /// Index of the first trainable backbone layer
    pub fn first_trainable(&self, num_layers: usize) -> usize {
        match self {
            FreezePolicy::All => num_layers,
            FreezePolicy::AllButLast(n) => num_layers.saturating_sub(*n),
            FreezePolicy::None => 0,
        }
    }
}

/// Architecture of a [`TransferClassifier`]; persisted next to its weights
#[derive(Config, Debug)]
pub struct TransferClassifierConfig {
    pub backbone: VggConfig,
    pub num_classes: usize,
    pub image_size: ImageSize,
    pub freeze: FreezePolicy,
}

impl TransferClassifierConfig {
    /// Random backbone and head, with freezing applied
    pub fn init<B: Backend>(&self, device: &B::Device) -> TransferClassifier<B> {
        let backbone = self.backbone.init(self.image_size, device);
        self.init_with_backbone(backbone, device)
    }

    /// Attach a fresh head to an existing backbone, then freeze
    pub fn init_with_backbone<B: Backend>(
        &self,
        backbone: Vgg<B>,
        device: &B::Device,
    ) -> TransferClassifier<B> {
        let features = self.backbone.output_features(self.image_size);
        let head = LinearConfig::new(features, self.num_classes).init(device);

        TransferClassifier {
            backbone,
            head,
            num_classes: self.num_classes,
            first_trainable: 0,
        }
        .freeze(self.freeze)
    }

    /// Parameters of the dense head alone
    pub fn head_params(&self) -> usize {
        let features = self.backbone.output_features(self.image_size);
        features * self.num_classes + self.num_classes
    }
}

/// VGG backbone + flatten + dense(num_classes)
///
/// `forward` returns logits; [`TransferClassifier::forward_softmax`] gives the
/// class probabilities the head is trained to produce.
#[derive(Module, Debug)]
pub struct TransferClassifier<B: Backend> {
    backbone: Vgg<B>,
    head: Linear<B>,
    num_classes: usize,
    first_trainable: usize,
}

impl<B: Backend> TransferClassifier<B> {
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let features = self.backbone.forward(images);
        self.head.forward(features)
    }

    pub fn forward_softmax(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.forward(images), 1)
    }

    pub fn freeze(self, policy: FreezePolicy) -> Self {
        let first_trainable = policy.first_trainable(self.backbone.num_layers());
        Self {
            backbone: self.backbone.freeze_before(first_trainable),
            head: self.head,
            num_classes: self.num_classes,
            first_trainable,
        }
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn backbone(&self) -> &Vgg<B> {
        &self.backbone
    }

    /// Parameters that receive gradient updates: unfrozen backbone layers plus the head
    pub fn trainable_params(&self) -> usize {
        let backbone: usize = self
            .backbone
            .layer_param_counts()
            .into_iter()
            .skip(self.first_trainable)
            .sum();
        backbone + self.head.num_params()
    }
}

impl<B: Backend> ImageClassifier<B> for TransferClassifier<B> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        TransferClassifier::forward(self, images)
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DefaultBackend, TrainingBackend};
    use burn::tensor::ElementConversion;

    fn config(freeze: FreezePolicy) -> TransferClassifierConfig {
        TransferClassifierConfig {
            backbone: VggConfig::new(vec![vec![4], vec![6]]),
            num_classes: 2,
            image_size: ImageSize::new(8, 8),
            freeze,
        }
    }

    #[test]
    fn test_output_shape() {
        let device = Default::default();
        let model = config(FreezePolicy::All).init::<DefaultBackend>(&device);
        let out = model.forward(Tensor::zeros([3, 3, 8, 8], &device));
        assert_eq!(out.dims(), [3, 2]);

        let probs = model.forward_softmax(Tensor::ones([1, 3, 8, 8], &device));
        let sum: f32 = probs.sum().into_scalar().elem();
        assert!((sum - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_frozen_trainable_params_equal_head() {
        let device = Default::default();
        let cfg = config(FreezePolicy::All);
        let model = cfg.init::<DefaultBackend>(&device);

        // 6 channels * 2 * 2 spatial -> 24 features, dense(2)
        assert_eq!(cfg.head_params(), 24 * 2 + 2);
        assert_eq!(model.trainable_params(), cfg.head_params());
        assert!(model.num_params() > model.trainable_params());
    }

    #[test]
    fn test_partial_and_no_freeze() {
        let device = Default::default();
        let partial = config(FreezePolicy::AllButLast(1)).init::<DefaultBackend>(&device);
        let last_conv = 4 * 6 * 9 + 6;
        assert_eq!(partial.trainable_params(), last_conv + 24 * 2 + 2);

        let open = config(FreezePolicy::None).init::<DefaultBackend>(&device);
        assert_eq!(open.trainable_params(), open.num_params());
    }

    #[test]
    fn test_frozen_layers_get_no_gradients() {
        let device = Default::default();
        let model = config(FreezePolicy::All).init::<TrainingBackend>(&device);

        let loss = model.forward(Tensor::ones([2, 3, 8, 8], &device)).sum();
        let grads = loss.backward();

        let conv = &model.backbone.blocks[0].convs[0];
        assert!(conv.weight.grad(&grads).is_none());
        assert!(model.head.weight.grad(&grads).is_some());
    }

    #[test]
    fn test_freeze_policy_indices() {
        assert_eq!(FreezePolicy::All.first_trainable(13), 13);
        assert_eq!(FreezePolicy::AllButLast(3).first_trainable(13), 10);
        assert_eq!(FreezePolicy::AllButLast(30).first_trainable(13), 0);
        assert_eq!(FreezePolicy::None.first_trainable(13), 0);
    }
}
