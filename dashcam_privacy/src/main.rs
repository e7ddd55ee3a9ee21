// The daemon entry point. Wires the SQLite work queue and an inference engine into the
// `PrivacyPipeline` and runs it until interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use dashcam_privacy::engine::NoOpEngineFactory;
use dashcam_privacy::store::SqliteWorkQueue;
use dashcam_privacy::{PipelineConfig, PrivacyPipeline, logging};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Parser)]
#[command(
    name = "dashcam_privacy",
    version,
    about = "Detects and blurs privacy-sensitive regions in captured dashcam frames",
    long_about = None
)]
struct Cli {
    /// JSON configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// SQLite database holding the frame queue
    #[arg(short, long, default_value = "/data/recording/data-logger.v1.4.1.db")]
    database: PathBuf,

    /// Create missing tables before starting
    #[arg(long)]
    init_schema: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => PipelineConfig::load_from_path(path)?,
        None => PipelineConfig::default(),
    };

    let queue = SqliteWorkQueue::open(&cli.database, &config.feature_flag_key)
        .with_context(|| format!("failed to open database {}", cli.database.display()))?;
    if cli.init_schema {
        queue.create_schema().context("failed to create schema")?;
    }
    match queue.config_values() {
        Ok(values) => {
            config.apply_overrides(&values);
        }
        Err(e) => warn!(error = %e, "could not read configuration overrides; using file values"),
    }
    config.validate()?;

    // No native runtime is linked into this binary; frames are committed without
    // detections until a real engine factory is plugged in here.
    warn!(model = %config.models.grid.path.display(), "using the no-op inference engine");
    let factory = Arc::new(NoOpEngineFactory::new(config.models.grid.version.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received; finishing the current round");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for interrupts; running until killed");
                // Keep the sender alive so the watcher never sees a closed channel.
                std::future::pending::<()>().await;
                drop(shutdown_tx);
            }
        }
    });

    let pipeline = PrivacyPipeline::new(config, Arc::new(queue), factory);
    pipeline.run(shutdown_rx).await
}
