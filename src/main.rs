//! Chest Cancer Classifier CLI
//!
//! Runs the whole pipeline or a single stage in-process, and classifies
//! images with the trained model. The `stage_0*` binaries remain the entry
//! points used by `dvc.yaml`.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::{error, info};

use chest_cancer_classifier::backend::{backend_name, default_device, DefaultBackend};
use chest_cancer_classifier::config::{ConfigurationManager, CONFIG_FILE_PATH, PARAMS_FILE_PATH};
use chest_cancer_classifier::inference::Predictor;
use chest_cancer_classifier::pipeline::{run_logged, Stage};
use chest_cancer_classifier::utils::logging::{init_logging, LogConfig};
use chest_cancer_classifier::VERSION;

/// Chest CT scan cancer classification pipeline
#[derive(Parser, Debug)]
#[command(name = "chest-classifier")]
#[command(version)]
#[command(about = "Transfer-learning pipeline for chest CT scan classification", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    /// Structural configuration (paths, URLs, tracking)
    #[arg(long, env = "CONFIG_FILE_PATH", default_value = CONFIG_FILE_PATH)]
    config: PathBuf,

    /// Hyperparameters
    #[arg(long, env = "PARAMS_FILE_PATH", default_value = PARAMS_FILE_PATH)]
    params: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run every stage in order
    Run {
        /// Start from this stage (name or number)
        #[arg(long)]
        from: Option<String>,
    },

    /// Run one stage: data_ingestion, prepare_base_model, training, evaluation (or 1-4)
    Stage {
        name: String,
    },

    /// Classify one or more images with the trained model
    Predict {
        /// Image files
        #[arg(required = true)]
        images: Vec<PathBuf>,

        /// Trained model path (without extension); defaults to the configured one
        #[arg(short, long)]
        model: Option<PathBuf>,

        /// Print predictions as JSON lines
        #[arg(long, default_value = "false")]
        json: bool,
    },

    /// Show the resolved configuration
    Info,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_config = if cli.verbose {
        LogConfig::verbose()
    } else {
        LogConfig::pipeline()
    };
    if let Err(e) = init_logging(&log_config) {
        eprintln!("Failed to initialise logging: {}", e);
    }

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = ConfigurationManager::new(&cli.config, &cli.params)
        .context("loading configuration")?;

    match cli.command {
        Commands::Run { from } => {
            print_banner();
            let first = match from {
                Some(name) => name.parse::<Stage>()?,
                None => Stage::DataIngestion,
            };
            for stage in Stage::ALL.into_iter().skip_while(|s| *s != first) {
                let outcome = run_logged(stage, &config)
                    .with_context(|| format!("stage {} failed", stage))?;
                println!("{} {}: {}", "OK".green(), stage, outcome);
            }
        }
        Commands::Stage { name } => {
            let stage: Stage = name.parse()?;
            let outcome = run_logged(stage, &config)
                .with_context(|| format!("stage {} failed", stage))?;
            println!("{} {}: {}", "OK".green(), stage, outcome);
        }
        Commands::Predict { images, model, json } => {
            cmd_predict(&config, &images, model, json)?;
        }
        Commands::Info => cmd_info(&config)?,
    }

    Ok(())
}

fn cmd_predict(
    config: &ConfigurationManager,
    images: &[PathBuf],
    model: Option<PathBuf>,
    json: bool,
) -> Result<()> {
    let mut prediction_config = config.get_prediction_config();
    if let Some(path) = model {
        prediction_config.model_path = path;
    }
    info!("Loading model from {}", prediction_config.model_path.display());
    let predictor = Predictor::<DefaultBackend>::from_config(&prediction_config, default_device())?;

    for path in images {
        let prediction = predictor
            .predict_path(path)
            .with_context(|| format!("classifying {}", path.display()))?;
        if json {
            println!("{}", serde_json::to_string(&prediction)?);
        } else {
            println!(
                "{}  {} ({:.1}%)",
                path.display(),
                prediction.class.cyan().bold(),
                prediction.confidence * 100.0
            );
        }
    }
    Ok(())
}

fn cmd_info(config: &ConfigurationManager) -> Result<()> {
    let params = config.params();
    println!("{}", "Configuration:".cyan().bold());
    println!("  Version:        {}", VERSION);
    println!("  Backend:        {}", backend_name());
    println!("  Artifacts root: {}", config.artifacts_root().display());
    println!("  Backbone:       {}", params.backbone.name());
    println!("  Image size:     {}", params.image_size);
    println!("  Classes:        {}", params.classes);
    println!("  Epochs:         {}", params.epochs);
    println!("  Batch size:     {}", params.batch_size);
    println!("  Learning rate:  {}", params.learning_rate);
    println!("  Augmentation:   {}", params.augmentation);

    let evaluation = config.get_evaluation_config()?;
    println!("  Tracking URI:   {}", evaluation.mlflow_uri);
    Ok(())
}

fn print_banner() {
    println!(
        "{}",
        r#"
 ╔══════════════════════════════════════════════════════════╗
 ║   Chest CT Scan Cancer Classification                    ║
 ║   VGG transfer learning with Burn + Rust                 ║
 ╚══════════════════════════════════════════════════════════╝
  "#
        .green()
    );
}
