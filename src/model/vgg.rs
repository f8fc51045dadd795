//! VGG convolutional backbone
//!
//! Stacks of 3x3 same-padded convolutions with ReLU, each stack closed by a
//! 2x2 max-pool. The optional top adds two ReLU dense layers and a softmax
//! prediction layer, matching the ImageNet classifier layout.

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        Linear, LinearConfig, PaddingConfig2d, Relu,
    },
    tensor::{activation::softmax, backend::Backend, Tensor},
};
use serde::{Deserialize, Serialize};

use crate::config::ImageSize;

/// Standard VGG depths
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackboneKind {
    Vgg11,
    Vgg13,
    #[default]
    Vgg16,
    Vgg19,
}

impl BackboneKind {
    /// Output channels of every conv layer, grouped by pooling block
    pub fn blocks(&self) -> Vec<Vec<usize>> {
        let repeat = |n: usize, c: usize| vec![c; n];
        let depths: [usize; 5] = match self {
            BackboneKind::Vgg11 => [1, 1, 2, 2, 2],
            BackboneKind::Vgg13 => [2, 2, 2, 2, 2],
            BackboneKind::Vgg16 => [2, 2, 3, 3, 3],
            BackboneKind::Vgg19 => [2, 2, 4, 4, 4],
        };
        depths
            .iter()
            .zip([64, 128, 256, 512, 512])
            .map(|(&n, c)| repeat(n, c))
            .collect()
    }

    pub fn name(&self) -> &'static str {
        match self {
            BackboneKind::Vgg11 => "vgg11",
            BackboneKind::Vgg13 => "vgg13",
            BackboneKind::Vgg16 => "vgg16",
            BackboneKind::Vgg19 => "vgg19",
        }
    }
}

/// Configuration for the VGG backbone
#[derive(Config, Debug)]
pub struct VggConfig {
    /// Output channels per conv layer, one inner list per pooling block
    pub blocks: Vec<Vec<usize>>,

    /// Number of input channels (3 for RGB)
    #[config(default = "3")]
    pub in_channels: usize,

    /// Keep the fully connected classifier on top of the conv stack
    #[config(default = "false")]
    pub include_top: bool,

    /// Width of the two hidden dense layers of the top
    #[config(default = "4096")]
    pub top_units: usize,

    /// Outputs of the top prediction layer
    #[config(default = "1000")]
    pub top_classes: usize,
}

impl VggConfig {
    pub fn from_kind(kind: BackboneKind) -> Self {
        Self::new(kind.blocks())
    }

    pub fn num_conv_layers(&self) -> usize {
        self.blocks.iter().map(Vec::len).sum()
    }

    /// Weighted layers in forward order (convs, then top dense layers)
    pub fn num_layers(&self) -> usize {
        self.num_conv_layers() + if self.include_top { 3 } else { 0 }
    }

    /// `[channels, height, width]` of the last pooling block
    pub fn feature_shape(&self, size: ImageSize) -> [usize; 3] {
        let reduction = 1usize << self.blocks.len();
        let channels = self
            .blocks
            .last()
            .and_then(|b| b.last())
            .copied()
            .unwrap_or(self.in_channels);
        [channels, size.height / reduction, size.width / reduction]
    }

    /// Width of the flattened backbone output
    pub fn output_features(&self, size: ImageSize) -> usize {
        if self.include_top {
            self.top_classes
        } else {
            self.feature_shape(size).iter().product()
        }
    }

    /// Initialize a backbone with random weights
    pub fn init<B: Backend>(&self, size: ImageSize, device: &B::Device) -> Vgg<B> {
        let mut in_channels = self.in_channels;
        let blocks = self
            .blocks
            .iter()
            .map(|channels| {
                let convs = channels
                    .iter()
                    .map(|&out| {
                        let conv = Conv2dConfig::new([in_channels, out], [3, 3])
                            .with_padding(PaddingConfig2d::Same)
                            .init(device);
                        in_channels = out;
                        conv
                    })
                    .collect();
                VggBlock {
                    convs,
                    pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
                    activation: Relu::new(),
                }
            })
            .collect();

        let top = if self.include_top {
            let flat: usize = self.feature_shape(size).iter().product();
            vec![
                LinearConfig::new(flat, self.top_units).init(device),
                LinearConfig::new(self.top_units, self.top_units).init(device),
                LinearConfig::new(self.top_units, self.top_classes).init(device),
            ]
        } else {
            Vec::new()
        };

        Vgg {
            blocks,
            top,
            activation: Relu::new(),
        }
    }
}

/// Convolutions sharing one pooling step
#[derive(Module, Debug)]
pub struct VggBlock<B: Backend> {
    pub convs: Vec<Conv2d<B>>,
    pub pool: MaxPool2d,
    pub activation: Relu,
}

impl<B: Backend> VggBlock<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self
            .convs
            .iter()
            .fold(x, |x, conv| self.activation.forward(conv.forward(x)));
        self.pool.forward(x)
    }
}

#[derive(Module, Debug)]
pub struct Vgg<B: Backend> {
    pub blocks: Vec<VggBlock<B>>,
    pub top: Vec<Linear<B>>,
    pub activation: Relu,
}

impl<B: Backend> Vgg<B> {
    /// Output of the last pooling block, `[batch, channels, h, w]`
    pub fn forward_features(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.blocks.iter().fold(x, |x, block| block.forward(x))
    }

    /// Flattened features, or class probabilities when the top is present
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = self.forward_features(x).flatten::<2>(1, 3);
        if let Some((last, hidden)) = self.top.split_last() {
            for layer in hidden {
                x = self.activation.forward(layer.forward(x));
            }
            x = softmax(last.forward(x), 1);
        }
        x
    }

    pub fn num_layers(&self) -> usize {
        self.blocks.iter().map(|b| b.convs.len()).sum::<usize>() + self.top.len()
    }

    /// Parameter count of every weighted layer in forward order
    pub fn layer_param_counts(&self) -> Vec<usize> {
        self.blocks
            .iter()
            .flat_map(|b| b.convs.iter().map(|c| c.num_params()))
            .chain(self.top.iter().map(|l| l.num_params()))
            .collect()
    }

    /// Stop gradients for every weighted layer before index `first_trainable`
    pub fn freeze_before(self, first_trainable: usize) -> Self {
        let mut index = 0;
        let mut next_frozen = || {
            let frozen = index < first_trainable;
            index += 1;
            frozen
        };

        let blocks = self
            .blocks
            .into_iter()
            .map(|block| VggBlock {
                convs: block
                    .convs
                    .into_iter()
                    .map(|conv| if next_frozen() { conv.no_grad() } else { conv })
                    .collect(),
                pool: block.pool,
                activation: block.activation,
            })
            .collect();
        let top = self
            .top
            .into_iter()
            .map(|layer| if next_frozen() { layer.no_grad() } else { layer })
            .collect();

        Self {
            blocks,
            top,
            activation: self.activation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DefaultBackend;
    use burn::tensor::ElementConversion;

    type TestBackend = DefaultBackend;

    fn tiny() -> VggConfig {
        VggConfig::new(vec![vec![4], vec![8, 8]])
    }

    #[test]
    fn test_vgg16_layout() {
        let config = VggConfig::from_kind(BackboneKind::Vgg16);
        assert_eq!(config.num_conv_layers(), 13);
        assert_eq!(config.feature_shape(ImageSize::new(224, 224)), [512, 7, 7]);
        assert_eq!(config.output_features(ImageSize::new(224, 224)), 25088);

        let with_top = config.with_include_top(true);
        assert_eq!(with_top.num_layers(), 16);
        assert_eq!(with_top.output_features(ImageSize::new(224, 224)), 1000);
    }

    #[test]
    fn test_depth_presets() {
        assert_eq!(VggConfig::from_kind(BackboneKind::Vgg11).num_conv_layers(), 8);
        assert_eq!(VggConfig::from_kind(BackboneKind::Vgg19).num_conv_layers(), 16);
    }

    #[test]
    fn test_forward_shape() {
        let device = Default::default();
        let size = ImageSize::new(16, 8);
        let model = tiny().init::<TestBackend>(size, &device);

        let input = Tensor::<TestBackend, 4>::zeros([2, 3, 16, 8], &device);
        assert_eq!(model.forward_features(input.clone()).dims(), [2, 8, 4, 2]);
        assert_eq!(model.forward(input).dims(), [2, tiny().output_features(size)]);
    }

    #[test]
    fn test_top_outputs_probabilities() {
        let device = Default::default();
        let size = ImageSize::new(8, 8);
        let config = tiny()
            .with_include_top(true)
            .with_top_units(6)
            .with_top_classes(5);
        let model = config.init::<TestBackend>(size, &device);

        let probs = model.forward(Tensor::<TestBackend, 4>::ones([1, 3, 8, 8], &device));
        assert_eq!(probs.dims(), [1, 5]);
        let sum: f32 = probs.sum().into_scalar().elem();
        assert!((sum - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_layer_param_counts() {
        let device = Default::default();
        let model = tiny().init::<TestBackend>(ImageSize::new(8, 8), &device);
        // 3x3 kernels with bias
        assert_eq!(
            model.layer_param_counts(),
            vec![3 * 4 * 9 + 4, 4 * 8 * 9 + 8, 8 * 8 * 9 + 8]
        );
        assert_eq!(model.layer_param_counts().iter().sum::<usize>(), model.num_params());
    }
}
