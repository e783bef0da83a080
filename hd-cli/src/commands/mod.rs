//! CLI command implementations.

pub mod config;
pub mod connect;
pub mod publish;

use std::path::Path;
use std::sync::Arc;

use console::style;
use tokio::sync::watch;
use tracing::info;

use hd_api::TokenClient;
use hd_core::config::{AppConfig, ConfigHandle};
use hd_core::error::HdResult;
use hd_services::{LifecycleTriggers, Service, TriggerInputs};
use hd_socket::{
    ConnectionManager, ConnectionState, LinkSettings, SessionState, TopicDispatcher, WsTransport,
};

/// A running link plus the observers feeding its lifecycle triggers.
///
/// A terminal session is always online and in the foreground, so those
/// senders only exist to keep the channels open.
pub struct Link {
    pub manager: ConnectionManager,
    triggers: LifecycleTriggers,
    _session: watch::Sender<SessionState>,
    _online: watch::Sender<bool>,
    _foreground: watch::Sender<bool>,
}

impl Link {
    pub async fn shutdown(mut self) {
        let _ = self.triggers.shutdown();
        self.manager.shutdown().await;
    }
}

/// Start the link over a real WebSocket with config-backed credentials.
///
/// Generates and saves a device id on first use.
pub async fn start_link(config: &ConfigHandle, config_path: &Path) -> HdResult<Link> {
    config.read().await.validate()?;

    let generated = config.write().await.ensure_device_id();
    if generated {
        config.save_to(config_path).await?;
        info!("generated device id, saved to {}", config_path.display());
    }
    let snapshot = config.snapshot().await;

    let credentials = TokenClient::from_config(config.clone())
        .await?
        .persist_to(config_path);
    let manager = ConnectionManager::spawn(
        LinkSettings::from_config(&snapshot),
        TopicDispatcher::new(256),
        Arc::new(WsTransport::new()),
        Arc::new(credentials),
    );

    let (session_tx, session_rx) = watch::channel(session_from_config(&snapshot));
    let (online_tx, online_rx) = watch::channel(true);
    let (foreground_tx, foreground_rx) = watch::channel(true);
    let mut triggers = LifecycleTriggers::new(
        manager.clone(),
        TriggerInputs {
            session: session_rx,
            online: online_rx,
            foreground: foreground_rx,
        },
    )
    .with_debounce(snapshot.connection.lifecycle_debounce());
    triggers.init()?;

    Ok(Link {
        manager,
        triggers,
        _session: session_tx,
        _online: online_tx,
        _foreground: foreground_tx,
    })
}

/// A stored access token counts as signed in.
pub fn session_from_config(config: &AppConfig) -> SessionState {
    SessionState {
        authenticated: !config.auth.access_token.is_empty(),
        workspace_id: Some(config.auth.workspace_id.clone()).filter(|id| !id.is_empty()),
    }
}

/// Colour a connection state for terminal output.
pub fn styled_state(state: ConnectionState) -> String {
    let text = state.to_string();
    match state {
        ConnectionState::Connected => style(text).green().bold().to_string(),
        ConnectionState::Connecting => style(text).yellow().to_string(),
        ConnectionState::Disconnected => style(text).dim().to_string(),
        ConnectionState::Error => style(text).red().bold().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_from_config() {
        let mut config = AppConfig::default();
        assert!(!session_from_config(&config).is_valid());

        config.auth.access_token = "token".into();
        let session = session_from_config(&config);
        assert!(session.authenticated);
        assert_eq!(session.workspace_id, None);

        config.auth.workspace_id = "ws-1".into();
        assert_eq!(session_from_config(&config), SessionState::signed_in("ws-1"));
    }
}
