//! Huddle CLI - drive the realtime link from a terminal.
//!
//! Useful for checking server configuration, watching live traffic and
//! poking the publish API without running the desktop app.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;

use hd_core::config::{AppConfig, ConfigHandle};
use hd_core::error::HdResult;
use hd_core::logging;
use hd_core::platform::Platform;

/// Huddle - realtime link client.
#[derive(Parser)]
#[command(
    name = "huddle",
    version,
    about = "Huddle realtime link CLI",
    long_about = "A command-line client for the Huddle realtime link.\n\
                  Connects over STOMP/WebSocket, prints live traffic and publishes presence, \
                  typing and call signals."
)]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging (debug level).
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output format (text, json).
    #[arg(short = 'f', long, global = true, default_value = "text")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

/// Output format for CLI responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    Text,
    /// JSON output for scripting.
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and print state changes and inbound messages until Ctrl+C.
    Connect {
        /// WebSocket URL (overrides config).
        #[arg(short, long)]
        url: Option<String>,
        /// Workspace to join (overrides config).
        #[arg(short, long)]
        workspace: Option<String>,
    },
    /// Connect, publish one message and report whether it was sent.
    Publish {
        /// Seconds to wait for the link to come up.
        #[arg(short, long, default_value = "15", global = true)]
        timeout: u64,
        #[command(subcommand)]
        action: commands::publish::PublishAction,
    },
    /// Inspect or create the configuration file.
    Config {
        #[command(subcommand)]
        action: commands::config::ConfigAction,
    },
}

#[tokio::main]
async fn main() -> HdResult<()> {
    let cli = Cli::parse();

    let config_path = match cli.config {
        Some(path) => path,
        None => AppConfig::default_config_path()?,
    };

    // `config` never needs a log file; everything else logs per config.
    let command = match cli.command {
        Commands::Config { action } => {
            logging::init_console_logging(if cli.verbose { "debug" } else { "warn" });
            return commands::config::run(&config_path, action, cli.format);
        }
        other => other,
    };

    let config = if config_path.exists() {
        AppConfig::load_from_file(&config_path)?
    } else {
        AppConfig::default()
    };

    let log_dir = config
        .effective_log_dir()
        .unwrap_or_else(|_| Platform::data_dir().unwrap_or_else(|_| PathBuf::from(".")).join("logs"));
    let _guard = logging::init_from_config(&config.logging, &log_dir, cli.verbose)?;

    let config_handle = ConfigHandle::new(config);
    info!("Huddle CLI v{} on {}", hd_core::constants::APP_VERSION, Platform::current());

    match command {
        Commands::Connect { url, workspace } => {
            commands::connect::run(config_handle, &config_path, url, workspace, cli.format).await
        }
        Commands::Publish { timeout, action } => {
            commands::publish::run(
                config_handle,
                &config_path,
                action,
                std::time::Duration::from_secs(timeout),
                cli.format,
            )
            .await
        }
        // Handled before logging was set up.
        Commands::Config { .. } => Ok(()),
    }
}
