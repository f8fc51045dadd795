//! Consistency of the DAG descriptor with the configuration it runs against:
//! stage outputs never swallow configured inputs, and each stage declares the
//! parameters and sources it actually reads.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use chest_cancer_classifier::config::Params;

#[derive(Debug, Deserialize)]
struct DvcFile {
    stages: BTreeMap<String, DvcStage>,
}

#[derive(Debug, Deserialize)]
struct DvcStage {
    cmd: String,
    #[serde(default)]
    deps: Vec<String>,
    #[serde(default)]
    params: Vec<String>,
    #[serde(default)]
    outs: Vec<String>,
    #[serde(default)]
    metrics: Vec<serde_yaml::Value>,
}

fn repo_file(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join(name)
}

fn load_dvc() -> DvcFile {
    let text = fs::read_to_string(repo_file("dvc.yaml")).unwrap();
    serde_yaml::from_str(&text).unwrap()
}

fn stage<'a>(dvc: &'a DvcFile, name: &str) -> &'a DvcStage {
    dvc.stages
        .get(name)
        .unwrap_or_else(|| panic!("dvc.yaml has no stage '{}'", name))
}

fn overlaps(a: &Path, b: &Path) -> bool {
    a.starts_with(b) || b.starts_with(a)
}

/// Paths in config.yaml that a stage reads but no stage produces
fn configured_inputs() -> Vec<PathBuf> {
    let text = fs::read_to_string(repo_file("config/config.yaml")).unwrap();
    let config: serde_yaml::Value = serde_yaml::from_str(&text).unwrap();
    let mut inputs = vec![PathBuf::from("config/config.yaml"), PathBuf::from("params.yaml")];
    if let Some(path) = config["prepare_base_model"]["pretrained_weights_path"].as_str() {
        inputs.push(PathBuf::from(path));
    }
    inputs
}

#[test]
fn stages_run_in_pipeline_order() {
    let dvc = load_dvc();
    let binaries = [
        ("data_ingestion", "stage_01_data_ingestion"),
        ("prepare_base_model", "stage_02_prepare_base_model"),
        ("training", "stage_03_model_trainer"),
        ("evaluation", "stage_04_model_evaluation"),
    ];
    assert_eq!(dvc.stages.len(), binaries.len());
    for (name, binary) in binaries {
        let s = stage(&dvc, name);
        assert!(s.cmd.ends_with(&format!("--bin {}", binary)), "{}: {}", name, s.cmd);
        assert!(s.deps.contains(&format!("src/bin/{}.rs", binary)));
    }
}

#[test]
fn outputs_never_contain_configured_inputs() {
    let dvc = load_dvc();
    let inputs = configured_inputs();
    assert!(inputs.len() > 2, "pretrained_weights_path should be configured");

    for (name, s) in &dvc.stages {
        for out in &s.outs {
            for input in &inputs {
                assert!(
                    !overlaps(Path::new(out), input),
                    "stage '{}' output {} overlaps input {}",
                    name,
                    out,
                    input.display()
                );
            }
            for dep in &s.deps {
                assert!(
                    !overlaps(Path::new(out), Path::new(dep)),
                    "stage '{}' depends on its own output {}",
                    name,
                    dep
                );
            }
        }
    }
}

#[test]
fn pretrained_weights_are_a_dependency() {
    let dvc = load_dvc();
    let prepare = stage(&dvc, "prepare_base_model");
    for input in configured_inputs().iter().skip(2) {
        assert!(
            prepare.deps.iter().any(|d| input.starts_with(d)),
            "{} is not covered by prepare_base_model deps",
            input.display()
        );
    }
}

#[test]
fn stages_declare_the_params_they_read() {
    let dvc = load_dvc();
    let expected: [(&str, &[&str]); 3] = [
        (
            "prepare_base_model",
            &[
                "IMAGE_SIZE",
                "INCLUDE_TOP",
                "CLASSES",
                "WEIGHTS",
                "LEARNING_RATE",
                "BACKBONE",
                "BACKBONE_BLOCKS",
                "FREEZE_ALL",
                "FREEZE_TILL",
                "OPTIMIZER",
                "LOSS",
            ],
        ),
        (
            "training",
            &[
                "IMAGE_SIZE",
                "EPOCHS",
                "BATCH_SIZE",
                "AUGMENTATION",
                "AUGMENTATION_PARAMS",
                "VALIDATION_SPLIT",
                "SEED",
            ],
        ),
        ("evaluation", &["IMAGE_SIZE", "BATCH_SIZE", "EVALUATION_SPLIT"]),
    ];

    for (name, keys) in expected {
        let declared: BTreeSet<&str> = stage(&dvc, name).params.iter().map(String::as_str).collect();
        for key in keys {
            assert!(declared.contains(key), "stage '{}' does not declare {}", name, key);
        }
    }
}

#[test]
fn every_pipeline_param_is_declared_somewhere() {
    let dvc = load_dvc();
    let text = fs::read_to_string(repo_file("params.yaml")).unwrap();
    let params: Params = serde_yaml::from_str(&text).unwrap();

    // Serialising fills in optional keys the file leaves out
    let serialized: BTreeMap<String, serde_yaml::Value> =
        serde_yaml::from_value(serde_yaml::to_value(&params).unwrap()).unwrap();
    let declared: BTreeSet<&str> = dvc
        .stages
        .values()
        .flat_map(|s| s.params.iter().map(String::as_str))
        .collect();

    for key in serialized.keys() {
        // Read by the server only
        if key == "PREDICTION_THRESHOLD" {
            continue;
        }
        assert!(declared.contains(key.as_str()), "{} is not declared by any stage", key);
    }
    for key in &declared {
        assert!(serialized.contains_key(*key), "unknown param {}", key);
    }
}

#[test]
fn model_consumers_depend_on_model_sources() {
    let dvc = load_dvc();
    for name in ["training", "evaluation"] {
        let deps = &stage(&dvc, name).deps;
        for source in ["src/model", "src/dataset", "src/training"] {
            assert!(deps.iter().any(|d| d == source), "stage '{}' misses {}", name, source);
        }
    }
    assert!(stage(&dvc, "evaluation").deps.iter().any(|d| d == "src/evaluation"));
}

#[test]
fn source_dependencies_exist() {
    let dvc = load_dvc();
    for (name, s) in &dvc.stages {
        for dep in s.deps.iter().filter(|d| d.starts_with("src/")) {
            assert!(repo_file(dep).exists(), "stage '{}' depends on missing {}", name, dep);
        }
    }
}

#[test]
fn scores_are_an_uncached_metric() {
    let dvc = load_dvc();
    let metrics = &stage(&dvc, "evaluation").metrics;
    assert_eq!(metrics.len(), 1);
    assert_eq!(metrics[0]["scores.json"]["cache"].as_bool(), Some(false));
}
