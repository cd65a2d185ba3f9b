//! Tus Uploadr - Resumable upload server
//!
//! Accepts TUS uploads and copies each finished file into a public directory.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;
use tus_uploadr::{config::Config, server::Server, upload::CopyToDirectoryHook};

/// Tus Uploadr - Resumable upload server
#[derive(Parser, Debug)]
#[command(name = "tus-uploadr")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_thread_ids(true)
        .json()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting Tus Uploadr v{}", tus_uploadr::VERSION);

    // Load configuration
    let config = Config::load(&args.config)?;
    info!("Loaded configuration from {:?}", args.config);

    let target_dir = config.completion.target_dir.clone();
    tokio::fs::create_dir_all(&target_dir).await?;
    let hook = Arc::new(CopyToDirectoryHook::new(target_dir));

    // Start server
    let server = Server::new(config, hook).await?;
    server.run().await?;

    Ok(())
}
