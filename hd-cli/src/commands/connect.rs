//! Connect command - hold the link open and print what happens on it.

use std::path::Path;

use console::style;
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;

use hd_core::config::ConfigHandle;
use hd_core::error::{HdError, HdResult};
use hd_socket::{ConnectionState, ContextSnapshot, InboundMessage};

use crate::OutputFormat;

/// Run the connect command.
pub async fn run(
    config: ConfigHandle,
    config_path: &Path,
    url: Option<String>,
    workspace: Option<String>,
    format: OutputFormat,
) -> HdResult<()> {
    {
        let mut cfg = config.write().await;
        if let Some(url) = url {
            cfg.server.ws_url = url;
        }
        if let Some(workspace) = workspace {
            cfg.auth.workspace_id = workspace;
        }
    }

    let (ws_url, workspace) = {
        let cfg = config.read().await;
        if !cfg.is_server_configured() {
            return Err(HdError::MissingConfig(
                "server.ws_url and auth.access_token (run `huddle config init`)".into(),
            ));
        }
        (cfg.server.ws_url.clone(), cfg.auth.workspace_id.clone())
    };

    if format == OutputFormat::Text {
        println!(
            "{} Connecting to {} (workspace {})...",
            style("[link]").bold().dim(),
            ws_url,
            if workspace.is_empty() { "<none>" } else { workspace.as_str() }
        );
    }

    let link = super::start_link(&config, config_path).await?;
    let mut states = link.manager.state_receiver();
    let mut inbound = link.manager.subscribe();
    let mut outcome = Ok(());

    loop {
        tokio::select! {
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                let snapshot = link.manager.snapshot();
                print_state(state, &snapshot, format);
                if state == ConnectionState::Error && snapshot.should_stop_retrying {
                    let reason = snapshot
                        .last_failure
                        .map_or_else(|| "unknown failure".to_string(), |kind| kind.to_string());
                    outcome = Err(HdError::Socket(format!("link gave up: {reason}")));
                    break;
                }
            }
            message = inbound.recv() => match message {
                Ok(message) => print_message(&message, format),
                Err(RecvError::Lagged(n)) => {
                    println!("  {} Missed {n} messages (slow consumer)", style("WARN").yellow());
                }
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                if format == OutputFormat::Text {
                    println!("\n  Disconnecting...");
                }
                break;
            }
        }
    }

    link.shutdown().await;
    outcome
}

fn print_state(state: ConnectionState, snapshot: &ContextSnapshot, format: OutputFormat) {
    match format {
        OutputFormat::Json => println!(
            "{}",
            json!({
                "event": "state",
                "at": chrono::Utc::now().to_rfc3339(),
                "state": state.to_string(),
                "reconnectAttempts": snapshot.reconnect_attempts,
                "lastFailure": snapshot.last_failure.map(|kind| kind.to_string()),
            })
        ),
        OutputFormat::Text => {
            let mut line = format!(
                "  {} {}",
                style(chrono::Local::now().format("%H:%M:%S")).dim(),
                super::styled_state(state)
            );
            if snapshot.reconnect_attempts > 0 {
                line.push_str(&format!(" (attempt {})", snapshot.reconnect_attempts));
            }
            if let Some(kind) = snapshot.last_failure {
                line.push_str(&format!(" - {}", style(kind).red()));
            }
            println!("{line}");
        }
    }
}

fn print_message(message: &InboundMessage, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let body = serde_json::from_str::<serde_json::Value>(&message.body)
                .unwrap_or_else(|_| serde_json::Value::String(message.body.clone()));
            println!(
                "{}",
                json!({
                    "event": "message",
                    "at": chrono::Utc::now().to_rfc3339(),
                    "destination": message.destination,
                    "topic": message.topic_id,
                    "body": body,
                })
            );
        }
        OutputFormat::Text => println!(
            "  {} {}",
            style(format!("[{}]", message.destination)).cyan(),
            message.body
        ),
    }
}
