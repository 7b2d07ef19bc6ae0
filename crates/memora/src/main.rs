//! Memora daemon - drains the ingestion queue into the memory store

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use memora::Memora;
use memora::config::Config;
use memora::error::Result;

/// Memora - A typed, expiring fact store that gives your agent long-term memory
#[derive(Parser)]
#[command(name = "memora")]
#[command(about = "A typed, expiring fact store that gives your agent long-term memory")]
#[command(version)]
pub struct Cli {
    /// Path to config file
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the queue processor until interrupted (default command)
    #[command(name = "serve")]
    Serve,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    init_logging();

    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Serve) => serve(cli.config).await,
    }
}

fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,memora=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    tracing::info!("Starting Memora daemon");

    let config = Config::load(config_path.as_deref())?;
    tracing::debug!("Config loaded: {:?}", config);

    let memora = Memora::open(config).await?;

    let report = memora.store().migration_report();
    if let Some(failure) = &report.failure {
        tracing::warn!(
            "Running on schema {} after failed migration {} -> {}",
            report.current_version,
            failure.from_version,
            failure.to_version
        );
    }

    let processor = memora.start_processor()?;
    tracing::info!(
        "Watching {} (Ctrl+C to stop)",
        memora.queue().root().display()
    );

    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down, finishing in-flight unit");
    processor.stop().await?;

    tracing::info!("Memora daemon stopped");
    Ok(())
}
