//! Telemetry publisher - Main Entry Point
//!
//! Keeps a persistent MQTT session open, publishes outage and republish
//! statistics on a fixed period and toggles a heartbeat indicator.

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process;
use telemetry_publisher::app::App;
use telemetry_publisher::config::PublisherConfig;
use telemetry_publisher::error::{AppError, AppResult};
use telemetry_publisher::observability::init_logging_with_level;
use tokio::signal;
use tracing::{error, info, Level};

/// Default configuration search locations, in order
const DEFAULT_CONFIG_PATHS: &[&str] = &["telemetry.toml", "config/telemetry.toml"];

/// Resilient MQTT telemetry publisher
#[derive(Parser)]
#[command(name = "telemetry-publisher")]
#[command(about = "Publish telemetry over a persistent MQTT session")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "TELEMETRY_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and publish until interrupted
    Run,
    /// Validate configuration
    Config {
        /// Show the effective configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => None,
        1 => Some(Level::DEBUG),
        _ => Some(Level::TRACE),
    };
    init_logging_with_level(level);

    info!(
        "Starting telemetry publisher v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(e.exit_code());
        }
    };

    let result = match cli.command {
        Commands::Run => run_publisher(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(e.exit_code());
    }

    info!("Application shutdown complete");
}

fn load_configuration(config_path: Option<&Path>) -> AppResult<PublisherConfig> {
    let path = match config_path {
        Some(path) => path.to_path_buf(),
        None => DEFAULT_CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
            .ok_or_else(|| {
                AppError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "no configuration file found; pass -c/--config or create telemetry.toml",
                ))
            })?,
    };

    info!("Loading configuration from: {}", path.display());
    Ok(PublisherConfig::load_from_file(&path)?)
}

async fn run_publisher(config: PublisherConfig) -> AppResult<()> {
    info!(
        client_id = config.session.client_id.as_deref().unwrap_or_default(),
        clean_session = config.session.clean_session,
        "Application starting"
    );

    // Set up signal handling for graceful shutdown
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let shutdown = async move {
        tokio::select! {
            _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully..."),
        }
    };

    let stats = App::new(config).run_mqtt(shutdown).await?;
    info!(
        outages = stats.outages,
        reconnects = stats.reconnects,
        republished = stats.republished,
        "Final session statistics"
    );
    Ok(())
}

fn handle_config_command(config: &PublisherConfig, show: bool) -> AppResult<()> {
    if show {
        let rendered = toml::to_string_pretty(config).map_err(|e| {
            AppError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?;
        println!("Current configuration:");
        println!("{rendered}");
    }

    info!("Configuration validation complete");
    Ok(())
}
