//! segment-log HTTP server binary entry point.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::runtime::Handle;
use tracing_subscriber::EnvFilter;

use segment_log::server::LogServer;
use segment_log::{build_remote, Config, Pipeline};

/// Minute-segmented log ingestion server
#[derive(Debug, Parser)]
#[command(name = "segment-log", version, about)]
struct CliArgs {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, default_value_t = 8080)]
    port: u16,

    /// Directory for local segment files, overriding the configuration
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Dotenv file with environment overrides, skipped if absent
    #[arg(long, default_value = ".env")]
    env_file: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = CliArgs::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "segment-log failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: CliArgs) -> segment_log::Result<()> {
    let mut config = Config::load(args.config.as_deref(), &args.env_file)?;
    if let Some(data_dir) = args.data_dir {
        config.pipeline.data_dir = data_dir;
    }
    tracing::info!("Opening pipeline with config: {:?}", config.pipeline);

    let remote = build_remote(&config.object_store, Handle::current())?;
    tracing::info!(remote = remote.name(), "remote store ready");

    // recovery reads the data directory, keep it off the runtime threads
    let pipeline_config = config.pipeline.clone();
    let pipeline = tokio::task::spawn_blocking(move || Pipeline::open(pipeline_config, remote))
        .await
        .map_err(|e| segment_log::Error::Configuration(format!("startup task failed: {}", e)))??;
    let pipeline = Arc::new(pipeline);
    pipeline.start()?;

    let served = LogServer::new(pipeline.clone(), args.port).run().await;

    let drained = tokio::task::spawn_blocking(move || pipeline.shutdown())
        .await
        .map_err(|e| segment_log::Error::Configuration(format!("shutdown task failed: {}", e)))?;

    served.and(drained)
}
