//! Evaluation stage: held-out scoring, `scores.json`, experiment tracking

pub mod evaluator;

pub use evaluator::{Evaluation, EvaluationReport, Scores, SubsetCounts, TrackingReport, MODEL_ARTIFACT_PATH};
