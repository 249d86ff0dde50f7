//! REST 协作层：状态、消息、智能体目录
//!
//! 所有调用都是 `POST {server}/v1/<endpoint>/`，请求体自动注入 `api_key`。
//! 状态码映射：
//! - 401 / 403 -> `ApiError::Authorization`
//! - 404 -> `ApiError::NotFound`（读写状态时改为创建空状态）
//! - 502 / 503 / 504 -> 指数退避重试，超过次数后按其他非 2xx 处理
//! - 其他非 2xx -> `ApiError::Request`

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::agents::Agent;
use crate::config::AppConfig;
use crate::core::{ApiError, ConnectorError};
use crate::interface::{Message, StateStore};

const CREATE_STATE: &str = "create-state";
const READ_STATE: &str = "read-state";
const UPDATE_STATE: &str = "update-state";
const CREATE_MESSAGE: &str = "create-message";
const READ_MESSAGE: &str = "read-message";
const DELETE_MESSAGE: &str = "delete-message";
const GET_AGENTS: &str = "get-agents";
const GET_AGENT: &str = "get-agent";

/// 消息投递目标
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageTarget {
    pub eezo_id: String,
    pub thread_id: String,
    /// 默认 "direct_message"；编辑已有消息时为原消息的 skill_id
    pub context: String,
}

impl MessageTarget {
    pub fn new(eezo_id: impl Into<String>, thread_id: impl Into<String>) -> Self {
        Self {
            eezo_id: eezo_id.into(),
            thread_id: thread_id.into(),
            context: "direct_message".to_string(),
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }
}

/// 服务端保存的消息记录
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    #[serde(default)]
    pub thread_id: String,
    #[serde(default)]
    pub eezo_id: String,
    #[serde(default)]
    pub skill_id: String,
    #[serde(default)]
    pub interface: Vec<Value>,
}

pub struct ApiClient {
    http: reqwest::Client,
    /// 如 https://host/v1
    base_url: String,
    api_key: String,
    max_retries: u32,
    retry_backoff: Duration,
}

impl ApiClient {
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            max_retries: 5,
            retry_backoff: Duration::from_secs(1),
        }
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, ConnectorError> {
        let base = format!("{}{}", config.server.base_url(), config.server.api_version);
        Ok(Self::new(config.api_key()?, base).with_retries(config.connection.request_retries))
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// 第 n 次重试前等待 `backoff * 2^(n-1)`
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}/", self.base_url, endpoint)
    }

    async fn post(&self, endpoint: &str, mut body: Map<String, Value>) -> Result<Value, ApiError> {
        body.insert("api_key".to_string(), Value::String(self.api_key.clone()));
        let url = self.url(endpoint);

        let mut attempt = 0u32;
        loop {
            let response = self
                .http
                .post(&url)
                .json(&body)
                .send()
                .await
                .map_err(|e| ApiError::Network(e.to_string()))?;

            let status = response.status().as_u16();
            if matches!(status, 502..=504) && attempt < self.max_retries {
                attempt += 1;
                let delay = self.retry_backoff * 2u32.saturating_pow(attempt - 1);
                tracing::warn!(endpoint, status, attempt, "Retrying request in {:?}", delay);
                tokio::time::sleep(delay).await;
                continue;
            }

            if (200..300).contains(&status) {
                return response
                    .json::<Value>()
                    .await
                    .map_err(|e| ApiError::Network(format!("invalid response from {endpoint}: {e}")));
            }

            let text = response.text().await.unwrap_or_default();
            return Err(match status {
                401 | 403 => ApiError::Authorization,
                404 => ApiError::NotFound(url),
                _ => ApiError::Request {
                    status,
                    detail: text,
                },
            });
        }
    }

    pub async fn create_state(
        &self,
        state_id: &str,
        state: &Map<String, Value>,
    ) -> Result<Map<String, Value>, ApiError> {
        let body = object(json!({ "state_id": state_id, "state": state }));
        let response = self.post(CREATE_STATE, body).await?;
        Ok(extract_state(&response))
    }

    /// 创建（context 为 MessageTarget 指定）或覆盖一条消息
    pub async fn create_message(&self, target: &MessageTarget, message: &Message) -> Result<(), ApiError> {
        let body = object(json!({
            "thread_id": target.thread_id,
            "eezo_id": target.eezo_id,
            "message_id": message.id,
            "interface": message.interface,
            "context": target.context,
        }));
        self.post(CREATE_MESSAGE, body).await?;
        Ok(())
    }

    pub async fn read_message(&self, message_id: &str) -> Result<StoredMessage, ApiError> {
        let response = self
            .post(READ_MESSAGE, object(json!({ "message_id": message_id })))
            .await?;
        let data = response
            .get("data")
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("Message not found for id {message_id}")))?;
        serde_json::from_value(data).map_err(|e| ApiError::Network(format!("invalid message record: {e}")))
    }

    /// 取出已有消息以便重写：返回沿用原 ID 的空消息与原投递目标
    pub async fn edit_message(&self, message_id: &str) -> Result<(Message, MessageTarget), ApiError> {
        let stored = self.read_message(message_id).await?;
        let target = MessageTarget::new(stored.eezo_id, stored.thread_id).with_context(stored.skill_id);
        Ok((Message::with_id(stored.id), target))
    }

    pub async fn delete_message(&self, message_id: &str) -> Result<(), ApiError> {
        self.post(DELETE_MESSAGE, object(json!({ "message_id": message_id })))
            .await?;
        Ok(())
    }

    pub async fn get_agents(&self, online_only: bool) -> Result<Vec<Agent>, ApiError> {
        let response = self.post(GET_AGENTS, Map::new()).await?;
        let data = response.get("data").cloned().unwrap_or(Value::Array(Vec::new()));
        let agents: Vec<Agent> = serde_json::from_value(data)
            .map_err(|e| ApiError::Network(format!("invalid agent list: {e}")))?;
        Ok(if online_only {
            agents.into_iter().filter(Agent::is_online).collect()
        } else {
            agents
        })
    }

    pub async fn get_agent(&self, agent_id: &str) -> Result<Agent, ApiError> {
        let response = self
            .post(GET_AGENT, object(json!({ "agent_id": agent_id })))
            .await?;
        let data = response
            .get("data")
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("Agent not found for id {agent_id}")))?;
        serde_json::from_value(data).map_err(|e| ApiError::Network(format!("invalid agent record: {e}")))
    }
}

#[async_trait]
impl StateStore for ApiClient {
    async fn read_state(&self, state_id: &str) -> Result<Map<String, Value>, ApiError> {
        match self
            .post(READ_STATE, object(json!({ "state_id": state_id })))
            .await
        {
            Ok(response) => Ok(extract_state(&response)),
            Err(ApiError::NotFound(_)) => {
                tracing::info!(state_id, "State not found, creating empty state");
                self.create_state(state_id, &Map::new()).await
            }
            Err(e) => Err(e),
        }
    }

    async fn update_state(
        &self,
        state_id: &str,
        state: &Map<String, Value>,
    ) -> Result<Map<String, Value>, ApiError> {
        match self
            .post(UPDATE_STATE, object(json!({ "state_id": state_id, "state": state })))
            .await
        {
            Ok(response) => Ok(extract_state(&response)),
            Err(ApiError::NotFound(_)) => {
                tracing::info!(state_id, "State not found, creating empty state");
                self.create_state(state_id, &Map::new()).await
            }
            Err(e) => Err(e),
        }
    }
}

/// 响应体 `{"data": {"state": {...}}}`，缺失时为空
fn extract_state(response: &Value) -> Map<String, Value> {
    response
        .get("data")
        .and_then(|d| d.get("state"))
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> ApiClient {
        ApiClient::new("key-1", format!("{}/v1", server.uri())).with_retry_backoff(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_api_key_injected_and_state_read() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/read-state/"))
            .and(body_partial_json(json!({ "api_key": "key-1", "state_id": "u-1" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": { "state": { "visits": 3 } } })))
            .expect(1)
            .mount(&server)
            .await;

        let state = client(&server).read_state("u-1").await.unwrap();
        assert_eq!(state["visits"], json!(3));
    }

    #[tokio::test]
    async fn test_missing_state_is_created() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/read-state/"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/create-state/"))
            .and(body_partial_json(json!({ "state_id": "u-2", "state": {} })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": { "state": {} } })))
            .expect(1)
            .mount(&server)
            .await;

        let state = client(&server).read_state("u-2").await.unwrap();
        assert!(state.is_empty());
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/delete-message/"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/get-agent/"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/get-agents/"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad request"))
            .mount(&server)
            .await;

        let api = client(&server);
        assert_eq!(api.delete_message("m-1").await.unwrap_err(), ApiError::Authorization);
        assert!(matches!(api.get_agent("nobody").await.unwrap_err(), ApiError::NotFound(_)));
        assert_eq!(
            api.get_agents(false).await.unwrap_err(),
            ApiError::Request {
                status: 400,
                detail: "bad request".into()
            }
        );
    }

    #[tokio::test]
    async fn test_gateway_errors_are_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/get-agents/"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/get-agents/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    { "id": "a", "name": "A", "status": "online" },
                    { "id": "b", "name": "B", "status": "offline" }
                ]
            })))
            .mount(&server)
            .await;

        let online = client(&server).get_agents(true).await.unwrap();
        assert_eq!(online.len(), 1);
        assert_eq!(online[0].id, "a");
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502))
            .expect(3)
            .mount(&server)
            .await;

        let err = client(&server).with_retries(2).delete_message("m").await.unwrap_err();
        assert!(matches!(err, ApiError::Request { status: 502, .. }));
    }

    #[tokio::test]
    async fn test_edit_message_reuses_id_and_target() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/read-message/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": { "id": "m-7", "thread_id": "t-1", "eezo_id": "e-1", "skill_id": "s_chart" }
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/create-message/"))
            .and(body_partial_json(json!({
                "message_id": "m-7",
                "thread_id": "t-1",
                "eezo_id": "e-1",
                "context": "s_chart",
                "interface": [{ "type": "text", "text": "updated" }]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let api = client(&server);
        let (mut message, target) = api.edit_message("m-7").await.unwrap();
        message.text("updated");
        api.create_message(&target, &message).await.unwrap();
    }

    #[tokio::test]
    async fn test_read_message_without_data_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/read-message/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;

        let err = client(&server).read_message("m-9").await.unwrap_err();
        assert_eq!(err, ApiError::NotFound("Message not found for id m-9".into()));
    }
}
