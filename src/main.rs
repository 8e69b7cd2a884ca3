//! Galleria - event photo galleries with streamed archive downloads

use clap::{Parser, Subcommand};
use galleria::config::Config;
use galleria::reconcile::Reconciler;
use galleria::server::{state, AppState, Server};
use galleria::telemetry;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Galleria - guest uploads into event galleries
#[derive(Parser, Debug)]
#[command(name = "galleria")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file; built-in defaults are used when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level or filter directive, overrides the configured level
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP server (default)
    Serve,
    /// Cross-check blob storage against event metadata
    Reconcile {
        /// Only check this event
        #[arg(long)]
        event: Option<String>,

        /// Delete orphaned blobs instead of only reporting them
        #[arg(long)]
        delete: bool,

        /// Ignore blobs younger than this many seconds
        #[arg(long, default_value_t = 3600)]
        grace_secs: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => {
            let config = Config::default();
            config.validate()?;
            config
        }
    };

    telemetry::init_subscriber(&config.logging, args.log_level.as_deref())?;
    info!("Starting Galleria v{}", galleria::VERSION);
    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Reconcile {
            event,
            delete,
            grace_secs,
        } => reconcile(config, event, delete, grace_secs).await,
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let state = Arc::new(AppState::from_config(&config).await?);
    let server = Server::bind(&config.server.address, state).await?;
    server
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

async fn reconcile(
    config: Config,
    event: Option<String>,
    delete: bool,
    grace_secs: u64,
) -> anyhow::Result<()> {
    let blobs = state::build_blob_store(&config.storage).await?;
    let metadata = state::build_metadata_store(&config.metadata).await?;
    let reconciler = Reconciler::new(blobs, metadata, Duration::from_secs(grace_secs))?;

    let report = reconciler.run(event.as_deref(), delete).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
