//! Inference on uploaded or on-disk images
//!
//! Used by the `predict` CLI command and the web server.

pub mod predictor;

pub use predictor::{decide, Prediction, Predictor};
