//! 登录：用长期 API Key 换取短期 session token

use async_trait::async_trait;
use serde::Deserialize;

use crate::core::ConnectorError;

#[async_trait]
pub trait Authenticator: Send + Sync {
    /// 返回 session token。
    /// 凭证被拒绝（4xx）返回 `Auth`（致命）；网络失败或 5xx 返回 `Transport`（可重试）。
    async fn authenticate(&self, api_key: &str) -> Result<String, ConnectorError>;
}

/// `POST {server}/v1/signin/`，body `{"api_key": ...}`，200 返回 `{"token": ...}`
pub struct HttpAuthenticator {
    http: reqwest::Client,
    url: String,
}

#[derive(Deserialize)]
struct SigninResponse {
    token: Option<String>,
}

impl HttpAuthenticator {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl Authenticator for HttpAuthenticator {
    async fn authenticate(&self, api_key: &str) -> Result<String, ConnectorError> {
        let response = self
            .http
            .post(&self.url)
            .json(&serde_json::json!({ "api_key": api_key }))
            .send()
            .await
            .map_err(|e| ConnectorError::Transport(format!("signin request failed: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            let body: SigninResponse = response
                .json()
                .await
                .map_err(|e| ConnectorError::Auth(format!("invalid signin response: {}", e)))?;
            return body
                .token
                .filter(|t| !t.is_empty())
                .ok_or_else(|| ConnectorError::Auth("signin response has no token".to_string()));
        }

        let body = response.text().await.unwrap_or_default();
        let detail = error_detail(&body);
        let message = format!("{}: {}", status.as_u16(), detail);
        if status.is_client_error() {
            Err(ConnectorError::Auth(message))
        } else {
            Err(ConnectorError::Transport(format!("signin failed with {}", message)))
        }
    }
}

/// 取响应体中的 `detail` 字段，没有则原样返回
fn error_detail(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("detail").map(|d| match d.as_str() {
            Some(s) => s.to_string(),
            None => d.to_string(),
        }))
        .unwrap_or_else(|| body.to_string())
}
