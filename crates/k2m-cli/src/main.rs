//! K2M CLI - Kafka to MongoDB record delivery.

use anyhow::Result;
use clap::{Parser, Subcommand};
use k2m_core::config::LogFormat;
use k2m_core::{Config, Error, KafkaError, StoreError};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Exit codes for CLI operations.
///
/// Following Unix conventions:
/// - 0: Success
/// - 1-127: Application errors
/// - 128+N: Signal N received (e.g., 130 = SIGINT)
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    /// Successful execution
    Success = 0,
    /// Configuration error (invalid config file, missing required fields)
    ConfigError = 1,
    /// Could not reach the broker or the store at startup
    ConnectionError = 2,
    /// Broker error while consuming
    KafkaError = 3,
    /// Document store error
    StoreError = 4,
    /// General runtime error
    RuntimeError = 10,
    /// Signal interrupt (SIGINT = 2, so 128 + 2 = 130)
    SignalInterrupt = 130,
}

impl ExitCode {
    /// Map an error to an exit code by inspecting its source chain.
    fn from_error(error: &anyhow::Error) -> Self {
        if let Some(e) = error.downcast_ref::<Error>() {
            return match e {
                Error::Config(_) | Error::Serialization(_) => ExitCode::ConfigError,
                Error::Kafka(KafkaError::ConnectionFailed { .. })
                | Error::Store(StoreError::ConnectionFailed { .. }) => ExitCode::ConnectionError,
                Error::Kafka(_) => ExitCode::KafkaError,
                Error::Store(_) => ExitCode::StoreError,
                Error::Shutdown => ExitCode::SignalInterrupt,
                _ => ExitCode::RuntimeError,
            };
        }

        let error_str = error.to_string().to_lowercase();
        if error_str.contains("config") || error_str.contains("toml") || error_str.contains("parse")
        {
            ExitCode::ConfigError
        } else {
            ExitCode::RuntimeError
        }
    }
}

mod commands;
mod server;

#[derive(Parser)]
#[command(name = "k2m")]
#[command(about = "Kafka to MongoDB record delivery CLI", long_about = None)]
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
    /// Run the group consumer
    Run {
        /// Override broker addresses (comma-separated)
        #[arg(long)]
        brokers: Option<String>,

        /// Override topics (comma-separated)
        #[arg(long)]
        topics: Option<String>,

        /// Override consumer group
        #[arg(long)]
        consumer_group: Option<String>,

        /// Archive into memory instead of the configured store
        #[arg(long)]
        dry_run: bool,
    },

    /// Show status and health
    Status {
        /// Health endpoint URL
        #[arg(long, default_value = "http://localhost:8080")]
        url: String,
    },

    /// Validate configuration
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

    // Log format comes from the config file when it parses (falls back to JSON)
    let monitoring = cli
        .config
        .as_ref()
        .and_then(|path| std::fs::read_to_string(path).ok())
        .and_then(|content| toml::from_str::<Config>(&content).ok())
        .map(|config| config.monitoring)
        .unwrap_or_default();

    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        match cli.verbose {
            0 => EnvFilter::new(monitoring.log_level.as_directive()),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    match monitoring.log_format {
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
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "Command failed");
            ExitCode::from_error(&e)
        }
    }
}

/// Execute the CLI command.
async fn execute_command(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Commands::Run {
            brokers,
            topics,
            consumer_group,
            dry_run,
        } => {
            let overrides = commands::run::Overrides {
                brokers,
                topics,
                consumer_group,
                dry_run,
            };
            commands::run::run(cli.config.as_deref(), overrides).await
        }

        Commands::Status { url } => {
            commands::status::run(&url).await?;
            Ok(ExitCode::Success)
        }

        Commands::Validate => {
            let config = Config::load(cli.config.as_deref())?;
            println!("Configuration is valid");
            println!("  brokers: {}", config.kafka.bootstrap_servers.join(","));
            println!("  topics:  {}", config.kafka.topics.join(","));
            println!("  group:   {}", config.kafka.consumer_group);
            println!("  store:   {}", config.store.redacted_connection_string());
            Ok(ExitCode::Success)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_from_core_errors() {
        let config = anyhow::Error::from(Error::Config("missing brokers".into()));
        assert_eq!(ExitCode::from_error(&config), ExitCode::ConfigError);

        let connect = anyhow::Error::from(Error::Kafka(KafkaError::ConnectionFailed {
            broker: "localhost:9092".into(),
            message: "refused".into(),
        }));
        assert_eq!(ExitCode::from_error(&connect), ExitCode::ConnectionError);

        let broker = anyhow::Error::from(Error::Kafka(KafkaError::Authentication("denied".into())));
        assert_eq!(ExitCode::from_error(&broker), ExitCode::KafkaError);

        let store = anyhow::Error::from(Error::Store(StoreError::Rejected("bad doc".into())));
        assert_eq!(ExitCode::from_error(&store), ExitCode::StoreError);
    }

    #[test]
    fn test_exit_code_from_foreign_errors() {
        let parse = anyhow::anyhow!("TOML parse error at line 3");
        assert_eq!(ExitCode::from_error(&parse), ExitCode::ConfigError);

        let other = anyhow::anyhow!("something else");
        assert_eq!(ExitCode::from_error(&other), ExitCode::RuntimeError);
    }

    #[test]
    fn test_cli_parses_run_overrides() {
        let cli = Cli::try_parse_from([
            "k2m",
            "run",
            "--brokers",
            "a:9092,b:9092",
            "--topics",
            "chat",
            "--dry-run",
        ])
        .unwrap();
        match cli.command {
            Commands::Run {
                brokers,
                topics,
                dry_run,
                ..
            } => {
                assert_eq!(brokers.as_deref(), Some("a:9092,b:9092"));
                assert_eq!(topics.as_deref(), Some("chat"));
                assert!(dry_run);
            }
            _ => panic!("expected run"),
        }
    }
}
