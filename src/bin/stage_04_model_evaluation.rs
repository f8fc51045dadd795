use std::process::ExitCode;

use chest_cancer_classifier::pipeline::{stage_main, Stage};

fn main() -> ExitCode {
    stage_main(Stage::Evaluation)
}
