//! Config commands.

use std::path::Path;

use clap::Subcommand;
use console::style;

use hd_core::config::AppConfig;
use hd_core::error::{HdError, HdResult};

use crate::OutputFormat;

const REDACTED: &str = "********";

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print the effective configuration with tokens redacted.
    Show,
    /// Write a default configuration file.
    Init {
        /// WebSocket endpoint, e.g. wss://chat.example.com/ws.
        #[arg(long)]
        ws_url: Option<String>,
        /// REST API root used for token refresh.
        #[arg(long)]
        api_url: Option<String>,
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
    /// Print where the configuration file lives.
    Path,
}

pub fn run(path: &Path, action: ConfigAction, format: OutputFormat) -> HdResult<()> {
    match action {
        ConfigAction::Show => {
            let exists = path.exists();
            let config = if exists {
                AppConfig::load_from_file(path)?
            } else {
                AppConfig::default()
            };
            let shown = redacted(config);
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&shown)?),
                OutputFormat::Text => {
                    if !exists {
                        println!(
                            "{}",
                            style(format!("# {} not found, showing defaults", path.display())).dim()
                        );
                    }
                    let text = toml::to_string_pretty(&shown)
                        .map_err(|e| HdError::Config(format!("failed to serialize config: {e}")))?;
                    print!("{text}");
                }
            }
        }
        ConfigAction::Init {
            ws_url,
            api_url,
            force,
        } => {
            if path.exists() && !force {
                return Err(HdError::Config(format!(
                    "{} already exists (use --force to overwrite)",
                    path.display()
                )));
            }
            let mut config = AppConfig::default();
            if let Some(url) = ws_url {
                config.server.ws_url = url;
            }
            if let Some(url) = api_url {
                config.server.api_url = url;
            }
            config.ensure_device_id();
            config.save_to_file(path)?;
            match format {
                OutputFormat::Json => println!(
                    "{}",
                    serde_json::json!({ "path": path, "deviceId": config.device.device_id })
                ),
                OutputFormat::Text => {
                    println!("  {} Wrote {}", style("OK").green().bold(), path.display());
                    println!("  Device id: {}", config.device.device_id);
                    println!(
                        "  Set auth.access_token, auth.refresh_token and auth.workspace_id before connecting."
                    );
                }
            }
        }
        ConfigAction::Path => match format {
            OutputFormat::Json => println!("{}", serde_json::json!({ "path": path })),
            OutputFormat::Text => println!("{}", path.display()),
        },
    }
    Ok(())
}

/// Hide stored tokens.
fn redacted(mut config: AppConfig) -> AppConfig {
    for secret in [&mut config.auth.access_token, &mut config.auth.refresh_token] {
        if !secret.is_empty() {
            *secret = REDACTED.to_string();
        }
    }
    config
}
