//! Publish commands - send one activity, typing or call-signal message.

use std::path::Path;
use std::time::Duration;

use clap::Subcommand;
use console::style;
use serde_json::json;

use hd_core::config::ConfigHandle;
use hd_core::error::{HdError, HdResult};
use hd_socket::{
    ActivityPayload, CallSignalPayload, CallSignalType, ConnectionManager, ConnectionState,
    PresenceStatus, TypingPayload,
};

use crate::OutputFormat;

/// Time the socket task gets to write the frame before teardown closes it.
const FLUSH_GRACE: Duration = Duration::from_millis(250);

#[derive(Subcommand)]
pub enum PublishAction {
    /// Send a typing indicator.
    Typing {
        /// Conversation the indicator belongs to.
        #[arg(long)]
        conversation: String,
        /// Report that typing stopped instead of started.
        #[arg(long)]
        stopped: bool,
    },
    /// Send a presence update for the configured workspace.
    Activity {
        /// online, away, busy or offline.
        #[arg(long, default_value = "online")]
        status: PresenceStatus,
    },
    /// Send a call-signalling message.
    Call {
        #[arg(long)]
        call_id: String,
        /// offer, answer, ice-candidate, hangup, ring or reject.
        #[arg(long)]
        signal: CallSignalType,
        /// User the signal is addressed to.
        #[arg(long)]
        target: Option<String>,
        /// Signal data as a JSON document.
        #[arg(long)]
        data: Option<String>,
    },
}

impl PublishAction {
    fn kind(&self) -> &'static str {
        match self {
            Self::Typing { .. } => "typing",
            Self::Activity { .. } => "activity",
            Self::Call { .. } => "call",
        }
    }
}

/// Run a publish subcommand.
pub async fn run(
    config: ConfigHandle,
    config_path: &Path,
    action: PublishAction,
    timeout: Duration,
    format: OutputFormat,
) -> HdResult<()> {
    // Parse before connecting so a bad --data fails fast.
    let call_data = match &action {
        PublishAction::Call { data: Some(raw), .. } => serde_json::from_str(raw)
            .map_err(|e| HdError::Config(format!("--data is not valid JSON: {e}")))?,
        _ => serde_json::Value::Null,
    };
    let workspace_id = config.read().await.auth.workspace_id.clone();

    let link = super::start_link(&config, config_path).await?;
    if let Err(e) = link.manager.wait_for_state(ConnectionState::Connected, timeout).await {
        link.shutdown().await;
        return Err(e);
    }

    let kind = action.kind();
    let sent = publish(&link.manager, action, workspace_id, call_data);
    if sent {
        tokio::time::sleep(FLUSH_GRACE).await;
    }
    link.shutdown().await;

    match format {
        OutputFormat::Json => println!("{}", json!({ "kind": kind, "sent": sent })),
        OutputFormat::Text if sent => {
            println!("  {} {kind} published", style("OK").green().bold())
        }
        OutputFormat::Text => println!("  {} {kind} not published", style("FAIL").red().bold()),
    }

    if sent {
        Ok(())
    } else {
        Err(HdError::Socket(format!("{kind} message was not sent")))
    }
}

fn publish(
    manager: &ConnectionManager,
    action: PublishAction,
    workspace_id: String,
    call_data: serde_json::Value,
) -> bool {
    match action {
        PublishAction::Typing { conversation, stopped } => manager.publish_typing(&TypingPayload {
            conversation_id: conversation,
            is_typing: !stopped,
        }),
        PublishAction::Activity { status } => manager.publish_activity(&ActivityPayload {
            status,
            workspace_id,
            last_active_at: Some(chrono::Utc::now()),
        }),
        PublishAction::Call {
            call_id,
            signal,
            target,
            ..
        } => manager.publish_call_signal(&CallSignalPayload {
            call_id,
            signal,
            target_user_id: target,
            data: call_data,
        }),
    }
}
