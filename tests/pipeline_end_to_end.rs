//! Full pipeline on a 10-image toy dataset: ingestion from a local archive,
//! base model preparation, one epoch of training and evaluation with a local
//! tracker.

use std::fs::{self, File};
use std::io::{Cursor, Write};
use std::path::Path;

use image::{ImageFormat, Rgb, RgbImage};
use tempfile::tempdir;
use zip::write::SimpleFileOptions;

use chest_cancer_classifier::config::ConfigurationManager;
use chest_cancer_classifier::evaluation::Scores;
use chest_cancer_classifier::model::store;
use chest_cancer_classifier::pipeline::{run_all, run_stage, Stage, StageOutcome};
use chest_cancer_classifier::PipelineError;

const CLASSES: [(&str, u8); 2] = [("adenocarcinoma", 50), ("normal", 190)];

fn write_dataset_zip(path: &Path) {
    let mut zip = zip::ZipWriter::new(File::create(path).unwrap());
    let options = SimpleFileOptions::default();
    for (class, shade) in CLASSES {
        for i in 0..5u8 {
            let img = RgbImage::from_fn(20, 20, |x, y| {
                Rgb([shade, shade.wrapping_add((x + y) as u8), i * 10])
            });
            let mut png = Cursor::new(Vec::new());
            img.write_to(&mut png, ImageFormat::Png).unwrap();

            zip.start_file(format!("Chest-CT-Scan-data/{}/scan_{}.png", class, i), options)
                .unwrap();
            zip.write_all(png.get_ref()).unwrap();
        }
    }
    zip.finish().unwrap();
}

fn config_yaml(root: &Path, archive: &Path) -> String {
    let r = root.display();
    format!(
        r#"
artifacts_root: {r}/artifacts
data_ingestion:
  root_dir: {r}/artifacts/data_ingestion
  source_url: file://{archive}
  local_data_file: {r}/artifacts/data_ingestion/data.zip
  unzip_dir: {r}/artifacts/data_ingestion
prepare_base_model:
  root_dir: {r}/artifacts/prepare_base_model
  base_model_path: {r}/artifacts/prepare_base_model/base_model
  updated_base_model_path: {r}/artifacts/prepare_base_model/base_model_updated
training:
  root_dir: {r}/artifacts/training
  trained_model_path: {r}/artifacts/training/model
evaluation:
  scores_path: {r}/scores.json
  mlflow_uri: {r}/mlruns
  experiment_name: toy
"#,
        r = r,
        archive = archive.display()
    )
}

fn params_yaml(epochs: usize) -> String {
    format!(
        r#"
AUGMENTATION: true
IMAGE_SIZE: [16, 16, 3]
BATCH_SIZE: 2
INCLUDE_TOP: false
EPOCHS: {}
CLASSES: 2
WEIGHTS: none
LEARNING_RATE: 0.01
BACKBONE_BLOCKS: [[4], [8]]
"#,
        epochs
    )
}

#[test]
fn toy_dataset_produces_model_and_scores() {
    let dir = tempdir().unwrap();
    let archive = dir.path().join("toy.zip");
    write_dataset_zip(&archive);

    let config =
        ConfigurationManager::from_yaml(&config_yaml(dir.path(), &archive), &params_yaml(1)).unwrap();
    let outcomes = run_all(&config).unwrap();
    assert_eq!(outcomes.len(), 4);

    match &outcomes[0] {
        StageOutcome::Ingested { files, .. } => assert_eq!(*files, 10),
        other => panic!("unexpected outcome {:?}", other),
    }
    match &outcomes[1] {
        StageOutcome::Prepared(p) => assert_eq!(p.trainable_params, p.head_params),
        other => panic!("unexpected outcome {:?}", other),
    }
    match &outcomes[2] {
        StageOutcome::Trained(t) => {
            assert_eq!(t.history.epochs.len(), 1);
            assert_eq!(t.train_samples + t.val_samples, 10);
        }
        other => panic!("unexpected outcome {:?}", other),
    }

    assert!(store::model_exists(&dir.path().join("artifacts/training/model")));
    assert!(dir.path().join("artifacts/training/history.json").is_file());

    let scores: Scores =
        serde_json::from_str(&fs::read_to_string(dir.path().join("scores.json")).unwrap()).unwrap();
    assert!((0.0..=1.0).contains(&scores.accuracy));
    assert!(scores.loss.is_finite() && scores.loss >= 0.0);

    match &outcomes[3] {
        StageOutcome::Evaluated(e) => {
            assert_eq!(e.scores, scores);
            assert!(e.tracking.is_some());
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert!(dir.path().join("mlruns").is_dir());
}

#[test]
fn zero_epochs_fail_before_training() {
    let dir = tempdir().unwrap();
    let archive = dir.path().join("toy.zip");
    write_dataset_zip(&archive);

    let config =
        ConfigurationManager::from_yaml(&config_yaml(dir.path(), &archive), &params_yaml(0)).unwrap();
    run_stage(Stage::DataIngestion, &config).unwrap();
    run_stage(Stage::PrepareBaseModel, &config).unwrap();

    let result = run_stage(Stage::Training, &config);
    assert!(matches!(result, Err(PipelineError::Training(_))));
    assert!(!store::model_exists(&dir.path().join("artifacts/training/model")));
}

#[test]
fn evaluation_without_trained_model_fails() {
    let dir = tempdir().unwrap();
    let archive = dir.path().join("toy.zip");
    write_dataset_zip(&archive);

    let config =
        ConfigurationManager::from_yaml(&config_yaml(dir.path(), &archive), &params_yaml(1)).unwrap();
    run_stage(Stage::DataIngestion, &config).unwrap();

    let result = run_stage(Stage::Evaluation, &config);
    assert!(matches!(result, Err(PipelineError::Evaluation(_))));
    assert!(!dir.path().join("scores.json").exists());
}

#[test]
fn second_ingestion_skips_download() {
    let dir = tempdir().unwrap();
    let archive = dir.path().join("toy.zip");
    write_dataset_zip(&archive);

    let config =
        ConfigurationManager::from_yaml(&config_yaml(dir.path(), &archive), &params_yaml(1)).unwrap();
    let first = run_stage(Stage::DataIngestion, &config).unwrap();
    let second = run_stage(Stage::DataIngestion, &config).unwrap();

    assert!(matches!(
        first,
        StageOutcome::Ingested { fetch: chest_cancer_classifier::dataset::FetchOutcome::Downloaded { .. }, .. }
    ));
    assert!(matches!(
        second,
        StageOutcome::Ingested { fetch: chest_cancer_classifier::dataset::FetchOutcome::AlreadyPresent { .. }, files: 10 }
    ));
}
