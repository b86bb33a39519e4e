//! icesink CLI - streaming Iceberg table-commit host.

use anyhow::Result;
use clap::{Parser, Subcommand};
use icesink_core::config::LogFormat;
use icesink_core::{Config, Error};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Exit codes for CLI operations.
///
/// Following Unix conventions:
/// - 0: Success
/// - 1-127: Application errors
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    /// Successful execution
    Success = 0,
    /// Configuration error (invalid config file, missing required fields)
    ConfigError = 1,
    /// Catalog, schema, DDL or commit error
    CatalogError = 3,
    /// Storage error (S3, filesystem)
    StorageError = 4,
    /// Shared state store error
    StateError = 5,
    /// General runtime error
    RuntimeError = 10,
}

impl ExitCode {
    /// Map an error to an exit code by its core error kind.
    fn from_error(error: &anyhow::Error) -> Self {
        match error.downcast_ref::<Error>() {
            Some(Error::Config(_)) => ExitCode::ConfigError,
            Some(Error::Catalog(_) | Error::Schema(_) | Error::Ddl(_) | Error::Commit(_)) => {
                ExitCode::CatalogError
            }
            Some(Error::Write(_) | Error::Io(_)) => ExitCode::StorageError,
            Some(Error::StateStore(_)) => ExitCode::StateError,
            Some(_) => ExitCode::RuntimeError,
            None if error.downcast_ref::<toml::de::Error>().is_some() => ExitCode::ConfigError,
            None => ExitCode::RuntimeError,
        }
    }
}

mod commands;

#[derive(Parser)]
#[command(name = "icesink")]
#[command(about = "Streaming Iceberg table-commit pipeline", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging (-v for debug, -vv for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Write JSON-lines row events through the configured sink
    Run {
        /// Input file (reads stdin when omitted)
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Events per pushed batch
        #[arg(long, default_value_t = 1000)]
        batch_size: usize,

        /// Override the worker index
        #[arg(long)]
        worker_index: Option<u32>,

        /// Override the transfer id (state scope)
        #[arg(long)]
        transfer_id: Option<String>,
    },

    /// Run one commit pass over pending writer files
    Commit,

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() {
    let exit_code = run_cli().await;
    std::process::exit(exit_code as i32);
}

/// Main CLI execution logic with proper error handling.
async fn run_cli() -> ExitCode {
    let cli = Cli::parse();

    // Log format comes from the config file when it parses, JSON otherwise
    let monitoring = cli
        .config
        .as_ref()
        .and_then(|path| std::fs::read_to_string(path).ok())
        .and_then(|content| toml::from_str::<Config>(&content).ok())
        .map(|config| config.monitoring);

    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        match cli.verbose {
            0 => EnvFilter::new(
                monitoring
                    .as_ref()
                    .map_or("info", |m| m.log_level.as_str()),
            ),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    match monitoring.map_or(LogFormat::Json, |m| m.log_format) {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json())
                .with(filter)
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer())
                .with(filter)
                .init();
        }
    }

    match execute_command(cli).await {
        Ok(()) => ExitCode::Success,
        Err(e) => {
            tracing::error!(error = %format!("{:#}", e), "Command failed");
            ExitCode::from_error(&e)
        }
    }
}

/// Execute the CLI command.
async fn execute_command(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Run {
            input,
            batch_size,
            worker_index,
            transfer_id,
        } => {
            let mut config = load_config(&cli.config)?;
            if let Some(index) = worker_index {
                config.worker.index = index;
            }
            if let Some(id) = transfer_id {
                config.worker.transfer_id = id;
            }
            config.validate()?;
            commands::run::run(config, input, batch_size).await?;
        }

        Commands::Commit => {
            let config = load_config(&cli.config)?;
            config.validate()?;
            commands::commit::run(config).await?;
        }

        Commands::Validate => {
            let config = load_config(&cli.config)?;
            commands::validate::run(&config)?;
        }
    }

    Ok(())
}

fn load_config(path: &Option<PathBuf>) -> Result<Config> {
    let path = path.clone().unwrap_or_else(|| PathBuf::from("icesink.toml"));

    let content = std::fs::read_to_string(&path)
        .map_err(|e| Error::Config(format!("read {}: {}", path.display(), e)))?;
    let config: Config = toml::from_str(&content)?;
    Ok(config)
}
