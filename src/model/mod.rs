//! Model definitions and persistence
//!
//! Training, evaluation and serving only talk to models through
//! [`ImageClassifier`] (forward + class count) and the functions in [`store`]
//! (save/load), so the concrete architecture stays swappable.

pub mod base_model;
pub mod classifier;
pub mod store;
pub mod vgg;

use burn::module::Module;
use burn::tensor::{backend::Backend, Tensor};

pub use base_model::{PrepareBaseModel, PreparedModel, WeightsSource};
pub use classifier::{FreezePolicy, TransferClassifier, TransferClassifierConfig};
pub use store::{load_model, model_exists, save_model, CompileSpec, ModelSpec};
pub use vgg::{BackboneKind, Vgg, VggConfig};

/// Image classifier: NCHW images in, one logit per class out
pub trait ImageClassifier<B: Backend>: Module<B> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2>;

    fn num_classes(&self) -> usize;
}
