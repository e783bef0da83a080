//! Config-backed credential provider.

use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info};

use hd_core::config::ConfigHandle;
use hd_core::error::{HdError, HdResult};
use hd_socket::credentials::{CredentialProvider, Credentials};

use crate::client::ApiClient;
use crate::response::TokenPair;

const REFRESH_PATH: &str = "/auth/refresh";

/// Reads credentials from the shared configuration and refreshes the access
/// token over REST when the link asks for it.
#[derive(Clone)]
pub struct TokenClient {
    api: ApiClient,
    config: ConfigHandle,
    /// Where refreshed tokens are written back, if anywhere.
    persist_to: Option<PathBuf>,
}

impl TokenClient {
    pub fn new(api: ApiClient, config: ConfigHandle) -> Self {
        Self {
            api,
            config,
            persist_to: None,
        }
    }

    /// Build the REST client from the `[server]` section of `config`.
    pub async fn from_config(config: ConfigHandle) -> HdResult<Self> {
        let api = ApiClient::new(&config.read().await.server)?;
        Ok(Self::new(api, config))
    }

    /// Save the configuration to `path` after every successful refresh.
    pub fn persist_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.persist_to = Some(path.into());
        self
    }
}

#[async_trait]
impl CredentialProvider for TokenClient {
    async fn get_credentials(&self) -> HdResult<Credentials> {
        let config = self.config.read().await;
        if config.auth.access_token.is_empty() {
            return Err(HdError::TokenInvalid("no access token stored".into()));
        }
        if config.auth.workspace_id.is_empty() {
            return Err(HdError::MissingConfig("auth.workspace_id".into()));
        }
        if config.device.device_id.is_empty() {
            return Err(HdError::MissingConfig("device.device_id".into()));
        }

        Ok(Credentials {
            auth_token: config.auth.access_token.clone(),
            workspace_id: config.auth.workspace_id.clone(),
            device_id: config.device.device_id.clone(),
            device_type: config.device.device_type.clone(),
        })
    }

    async fn refresh_token(&self) -> HdResult<()> {
        let refresh_token = self.config.read().await.auth.refresh_token.clone();
        if refresh_token.is_empty() {
            return Err(HdError::TokenInvalid("no refresh token stored".into()));
        }

        debug!("requesting new access token");
        let pair: TokenPair = self
            .api
            .post_json(REFRESH_PATH, &json!({ "refreshToken": refresh_token }))
            .await?;
        if pair.access_token.is_empty() {
            return Err(HdError::TokenInvalid("server returned an empty access token".into()));
        }

        {
            let mut config = self.config.write().await;
            config.auth.access_token = pair.access_token;
            if let Some(rotated) = pair.refresh_token {
                config.auth.refresh_token = rotated;
            }
        }

        if let Some(path) = &self.persist_to {
            self.config.save_to(path).await?;
        }
        info!("access token refreshed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use hd_core::config::AppConfig;

    fn config(api_url: &str) -> AppConfig {
        let mut config = AppConfig::default();
        config.server.ws_url = "ws://127.0.0.1:1/ws".into();
        config.server.api_url = api_url.into();
        config.auth.access_token = "old-access".into();
        config.auth.refresh_token = "old-refresh".into();
        config.auth.workspace_id = "ws-7".into();
        config.device.device_id = "device-7".into();
        config
    }

    /// Serve one HTTP response and hand back the raw request.
    async fn serve_once(status: &'static str, body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let task = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request);
                if let Some(end) = text.find("\r\n\r\n") {
                    let length = text[..end]
                        .lines()
                        .find_map(|l| l.to_ascii_lowercase().strip_prefix("content-length:").map(|v| v.trim().parse::<usize>().unwrap()))
                        .unwrap_or(0);
                    if request.len() >= end + 4 + length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            let response = format!(
                "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&request).into_owned()
        });
        (url, task)
    }

    #[tokio::test]
    async fn test_get_credentials_from_config() {
        let client = TokenClient::new(
            ApiClient::new(&config("http://127.0.0.1:1").server).unwrap(),
            ConfigHandle::new(config("http://127.0.0.1:1")),
        );
        let credentials = client.get_credentials().await.unwrap();
        assert_eq!(credentials.auth_token, "old-access");
        assert_eq!(credentials.workspace_id, "ws-7");
        assert_eq!(credentials.device_id, "device-7");
        assert_eq!(credentials.device_type, "desktop");
    }

    #[tokio::test]
    async fn test_missing_token_is_auth_error() {
        let mut cfg = config("http://127.0.0.1:1");
        cfg.auth.access_token.clear();
        let client = TokenClient::from_config(ConfigHandle::new(cfg)).await.unwrap();
        let err = client.get_credentials().await.unwrap_err();
        assert!(err.is_auth());
    }

    #[tokio::test]
    async fn test_refresh_updates_and_persists_tokens() {
        let (url, server) =
            serve_once("200 OK", r#"{"data":{"accessToken":"new-access","refreshToken":"new-refresh"}}"#).await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let handle = ConfigHandle::new(config(&url));
        let client = TokenClient::from_config(handle.clone())
            .await
            .unwrap()
            .persist_to(&path);

        client.refresh_token().await.unwrap();

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /auth/refresh HTTP/1.1"));
        assert!(request.contains(r#""refreshToken":"old-refresh""#));

        let current = handle.snapshot().await;
        assert_eq!(current.auth.access_token, "new-access");
        assert_eq!(current.auth.refresh_token, "new-refresh");
        let saved = AppConfig::load_from_file(&path).unwrap();
        assert_eq!(saved.auth.access_token, "new-access");
    }

    #[tokio::test]
    async fn test_refresh_rejected() {
        let (url, server) = serve_once("401 Unauthorized", r#"{"message":"refresh token revoked"}"#).await;
        let handle = ConfigHandle::new(config(&url));
        let client = TokenClient::from_config(handle.clone()).await.unwrap();

        let err = client.refresh_token().await.unwrap_err();
        assert!(matches!(err, HdError::AuthFailed(_)));
        server.await.unwrap();
        assert_eq!(handle.snapshot().await.auth.access_token, "old-access");
    }

    #[tokio::test]
    async fn test_refresh_without_refresh_token() {
        let mut cfg = config("http://127.0.0.1:1");
        cfg.auth.refresh_token.clear();
        let client = TokenClient::from_config(ConfigHandle::new(cfg)).await.unwrap();
        assert!(matches!(client.refresh_token().await, Err(HdError::TokenInvalid(_))));
    }
}
