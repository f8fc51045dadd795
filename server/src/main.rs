//! Chest CT scan classifier web server

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use chest_cancer_classifier::config::{ConfigurationManager, CONFIG_FILE_PATH, PARAMS_FILE_PATH};
use chest_cancer_classifier::utils::logging::{init_logging, LogConfig};
use chest_classifier_server::{build_router, AppState, ServerConfig, DEFAULT_PORT};

/// Model used when the configuration cannot be read
const FALLBACK_MODEL_PATH: &str = "artifacts/training/model";
const FALLBACK_THRESHOLD: f32 = 0.5;

#[derive(Parser, Debug)]
#[command(name = "chest-classifier-server")]
#[command(version)]
#[command(about = "Upload form, prediction API and background retraining", long_about = None)]
struct Args {
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    host: String,

    #[arg(short, long, env = "PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Trained model path (without extension); defaults to the configured one
    #[arg(long, env = "MODEL_PATH")]
    model_path: Option<PathBuf>,

    #[arg(long, env = "CONFIG_FILE_PATH", default_value = CONFIG_FILE_PATH)]
    config: PathBuf,

    #[arg(long, env = "PARAMS_FILE_PATH", default_value = PARAMS_FILE_PATH)]
    params: PathBuf,

    /// Command started by POST /train, split on whitespace
    #[arg(long, env = "PIPELINE_COMMAND", default_value = "chest-classifier run")]
    pipeline_command: String,

    /// Working directory of the pipeline command
    #[arg(long, env = "PROJECT_DIR", default_value = ".")]
    project_dir: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, default_value = "false")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_config = if args.verbose {
        LogConfig::verbose()
    } else {
        LogConfig::default()
    };
    if let Err(e) = init_logging(&log_config) {
        eprintln!("Failed to initialise logging: {}", e);
    }

    let (configured_model, threshold) = match ConfigurationManager::new(&args.config, &args.params) {
        Ok(config) => {
            let prediction = config.get_prediction_config();
            (prediction.model_path, prediction.threshold)
        }
        Err(e) => {
            warn!("Configuration unavailable ({}), using defaults", e);
            (PathBuf::from(FALLBACK_MODEL_PATH), FALLBACK_THRESHOLD)
        }
    };

    let config = ServerConfig {
        model_path: args.model_path.unwrap_or(configured_model),
        threshold,
        pipeline_command: args
            .pipeline_command
            .split_whitespace()
            .map(str::to_string)
            .collect(),
        project_dir: args.project_dir,
    };
    info!("Serving model {}", config.model_path.display());

    let app = build_router(AppState::new(config));

    let addr: SocketAddr = format!("{}:{}", args.host, args.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", args.host, args.port))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!(addr = %addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await
        .context("server error")?;
    Ok(())
}
