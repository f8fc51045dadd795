//! Stage orchestration
//!
//! Each stage loads the configuration, builds its one component and runs it to
//! completion. Stages never retry; re-execution is decided by the external DAG
//! runner (`dvc.yaml`) from the hashes of declared inputs and outputs.

use std::backtrace::Backtrace;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::process::ExitCode;
use std::str::FromStr;
use std::time::Instant;

use tracing::{error, info};

use crate::backend::{default_device, DefaultBackend, TrainingBackend};
use crate::config::ConfigurationManager;
use crate::dataset::ingestion::{DataIngestion, FetchOutcome};
use crate::evaluation::{Evaluation, EvaluationReport};
use crate::model::{PrepareBaseModel, PreparedModel};
use crate::training::{Training, TrainingSummary};
use crate::utils::error::{PipelineError, Result};
use crate::utils::logging::{init_logging, LogConfig};
use crate::utils::{format_bytes, format_duration, format_number};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    DataIngestion,
    PrepareBaseModel,
    Training,
    Evaluation,
}

impl Stage {
    /// Stages in DAG order
    pub const ALL: [Stage; 4] = [
        Stage::DataIngestion,
        Stage::PrepareBaseModel,
        Stage::Training,
        Stage::Evaluation,
    ];

    /// Name used in log banners
    pub fn name(&self) -> &'static str {
        match self {
            Stage::DataIngestion => "Data Ingestion stage",
            Stage::PrepareBaseModel => "Prepare base model",
            Stage::Training => "Training",
            Stage::Evaluation => "Evaluation stage",
        }
    }

    /// Identifier used on the command line
    pub fn slug(&self) -> &'static str {
        match self {
            Stage::DataIngestion => "data_ingestion",
            Stage::PrepareBaseModel => "prepare_base_model",
            Stage::Training => "training",
            Stage::Evaluation => "evaluation",
        }
    }

    /// Name of the standalone binary running this stage
    pub fn binary(&self) -> &'static str {
        match self {
            Stage::DataIngestion => "stage_01_data_ingestion",
            Stage::PrepareBaseModel => "stage_02_prepare_base_model",
            Stage::Training => "stage_03_model_trainer",
            Stage::Evaluation => "stage_04_model_evaluation",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Stage {
    type Err = PipelineError;

    /// Accepts the slug, the stage number or the binary name
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().to_ascii_lowercase().replace('-', "_");
        Stage::ALL
            .into_iter()
            .enumerate()
            .find(|(i, stage)| {
                s == stage.slug() || s == stage.binary() || s == (i + 1).to_string()
            })
            .map(|(_, stage)| stage)
            .ok_or_else(|| {
                PipelineError::InvalidInput(format!(
                    "unknown stage '{}' (expected one of: {})",
                    s,
                    Stage::ALL.map(|st| st.slug()).join(", ")
                ))
            })
    }
}

/// What a stage produced
#[derive(Debug, Clone)]
pub enum StageOutcome {
    Ingested { fetch: FetchOutcome, files: usize },
    Prepared(PreparedModel),
    Trained(TrainingSummary),
    Evaluated(EvaluationReport),
}

impl fmt::Display for StageOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageOutcome::Ingested { fetch, files } => {
                let (verb, bytes) = match fetch {
                    FetchOutcome::Downloaded { bytes } => ("downloaded", bytes),
                    FetchOutcome::AlreadyPresent { bytes } => ("already present", bytes),
                };
                write!(f, "archive {} ({}), {} files extracted", verb, format_bytes(*bytes), files)
            }
            StageOutcome::Prepared(p) => write!(
                f,
                "{} parameters, {} trainable (head: {})",
                format_number(p.total_params),
                format_number(p.trainable_params),
                format_number(p.head_params)
            ),
            StageOutcome::Trained(t) => match t.history.last() {
                Some(last) => write!(
                    f,
                    "{} epochs on {} images, val_loss {:.4}, val_accuracy {:.4}",
                    t.history.epochs.len(),
                    t.train_samples,
                    last.val_loss,
                    last.val_accuracy
                )
                .and_then(|_| match t.skipped_images {
                    0 => Ok(()),
                    n => write!(f, ", {} images unreadable", n),
                }),
                None => write!(f, "no epochs recorded"),
            },
            StageOutcome::Evaluated(e) => {
                write!(f, "loss {:.4}, accuracy {:.4}", e.scores.loss, e.scores.accuracy)?;
                if e.skipped_images > 0 {
                    write!(f, ", {} images unreadable", e.skipped_images)?;
                }
                match &e.tracking {
                    Some(t) => write!(f, ", tracked as run {}", t.run_id),
                    None => write!(f, ", not tracked"),
                }
            }
        }
    }
}

/// Run a single stage against an already loaded configuration
pub fn run_stage(stage: Stage, config: &ConfigurationManager) -> Result<StageOutcome> {
    match stage {
        Stage::DataIngestion => {
            let ingestion = DataIngestion::new(config.get_data_ingestion_config()?);
            let fetch = ingestion.fetch()?;
            let files = ingestion.extract()?;
            Ok(StageOutcome::Ingested { fetch, files })
        }
        Stage::PrepareBaseModel => {
            let prepare = PrepareBaseModel::<DefaultBackend>::new(
                config.get_prepare_base_model_config()?,
                default_device(),
            );
            Ok(StageOutcome::Prepared(prepare.run()?))
        }
        Stage::Training => {
            let training =
                Training::<TrainingBackend>::new(config.get_training_config()?, default_device());
            Ok(StageOutcome::Trained(training.run()?))
        }
        Stage::Evaluation => {
            let evaluation =
                Evaluation::<DefaultBackend>::new(config.get_evaluation_config()?, default_device());
            Ok(StageOutcome::Evaluated(evaluation.run()?))
        }
    }
}

/// [`run_stage`] wrapped in the start/finish banners
pub fn run_logged(stage: Stage, config: &ConfigurationManager) -> Result<StageOutcome> {
    info!(">>>>>> stage {} started <<<<<<", stage);
    let start = Instant::now();
    let outcome = run_stage(stage, config)?;
    info!("{}", outcome);
    info!(
        ">>>>>> stage {} completed in {} <<<<<<\n\nx==========x",
        stage,
        format_duration(start.elapsed().as_secs_f64())
    );
    Ok(outcome)
}

/// Every stage in order, stopping at the first failure
pub fn run_all(config: &ConfigurationManager) -> Result<Vec<StageOutcome>> {
    Stage::ALL
        .into_iter()
        .map(|stage| run_logged(stage, config))
        .collect()
}

/// Log panics with a backtrace through the tracing subscriber
fn install_panic_hook() {
    panic::set_hook(Box::new(|info| {
        error!("panic: {}\n{}", info, Backtrace::force_capture());
    }));
}

/// Entry point of the standalone stage binaries.
///
/// Exit code 0 on success; 1 after logging the failure (error or panic).
pub fn stage_main(stage: Stage) -> ExitCode {
    if let Err(e) = init_logging(&LogConfig::pipeline()) {
        eprintln!("Failed to initialise logging: {}", e);
    }
    install_panic_hook();

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        let config = ConfigurationManager::from_default_paths()?;
        run_logged(stage, &config)
    }));

    match result {
        Ok(Ok(_)) => ExitCode::SUCCESS,
        Ok(Err(e)) => {
            error!("stage {} failed: {}\n{}", stage, e, Backtrace::force_capture());
            ExitCode::FAILURE
        }
        Err(_) => {
            error!("stage {} aborted by a panic", stage);
            ExitCode::FAILURE
        }
    }
}
