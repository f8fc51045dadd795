//! Training: objectives, metrics and the training stage component

pub mod objective;
pub mod trainer;

pub use objective::{evaluate_generator, LossKind, Metrics, OptimizerKind};
pub use trainer::{fit, FitOptions, Training, TrainingHistory, TrainingSummary};
