//! 客户端：注册处理函数并运行全部连接
//!
//! 每个注册的智能体 ID 启动一条独立的 `ConnectionManager`，互不影响；
//! 进程关闭（Ctrl+C / SIGTERM / `stop()`）时全部停止。

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use tokio::task::JoinSet;

use crate::agent::{handler_fn, SharedHandler};
use crate::api::ApiClient;
use crate::config::AppConfig;
use crate::connector::{
    Authenticator, ConnectionManager, ConnectionOptions, HttpAuthenticator, Transport, WebSocketTransport,
};
use crate::core::{ConnectorError, ShutdownManager, ShutdownReason};
use crate::interface::{HandlerContext, StateStore};
use crate::protocol::JobPayload;

pub struct Client {
    config: AppConfig,
    api_key: String,
    handlers: HashMap<String, SharedHandler>,
    api: Arc<ApiClient>,
    state_store: Arc<dyn StateStore>,
    authenticator: Arc<dyn Authenticator>,
    transport: Arc<dyn Transport>,
    shutdown: Arc<ShutdownManager>,
    handle_signals: bool,
}

impl Client {
    /// 使用默认配置；`api_key` 为 None 时读取 BEE_API_KEY 环境变量
    pub fn new(api_key: Option<String>) -> Result<Self, ConnectorError> {
        let mut config = AppConfig::default();
        config.client.api_key = api_key;
        Self::from_config(config)
    }

    pub fn from_config(config: AppConfig) -> Result<Self, ConnectorError> {
        let api_key = config.api_key()?;
        let api = Arc::new(ApiClient::from_config(&config)?);
        let authenticator = Arc::new(HttpAuthenticator::new(config.server.auth_url()));
        let transport = Arc::new(WebSocketTransport::new(config.server.ws_url()));

        Ok(Self {
            api_key,
            handlers: HashMap::new(),
            state_store: api.clone(),
            api,
            authenticator,
            transport,
            shutdown: Arc::new(ShutdownManager::new()),
            handle_signals: true,
            config,
        })
    }

    /// 注册闭包处理函数；同一 ID 重复注册时替换旧的
    pub fn on<F, Fut>(&mut self, agent_id: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(HandlerContext, JobPayload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.on_handler(agent_id, handler_fn(handler))
    }

    /// 注册实现了 `AgentHandler` 的类型
    pub fn on_handler(&mut self, agent_id: impl Into<String>, handler: SharedHandler) -> &mut Self {
        let agent_id = agent_id.into();
        if self.handlers.insert(agent_id.clone(), handler).is_some() {
            tracing::warn!(agent_id = %agent_id, "Handler replaced");
        }
        self
    }

    pub fn agent_ids(&self) -> impl Iterator<Item = &String> {
        self.handlers.keys()
    }

    /// REST 协作层（消息、状态、智能体目录）
    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub fn with_state_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.state_store = store;
        self
    }

    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }

    /// 不安装 Ctrl+C / SIGTERM 处理器（嵌入到已有进程时使用）
    pub fn without_signal_handlers(mut self) -> Self {
        self.handle_signals = false;
        self
    }

    pub fn shutdown_manager(&self) -> Arc<ShutdownManager> {
        Arc::clone(&self.shutdown)
    }

    /// 停止全部连接；`connect()` 随后返回
    pub fn stop(&self) {
        self.shutdown.shutdown(ShutdownReason::UserInitiated);
    }

    /// 为每个处理函数启动一条连接，等待全部结束。
    /// 某条连接因凭证被拒绝而停止时，其他连接继续运行；全部结束后返回第一个错误
    pub async fn connect(&self) -> Result<(), ConnectorError> {
        if self.handlers.is_empty() {
            tracing::warn!("No handlers registered, nothing to connect");
            return Ok(());
        }
        if self.handle_signals {
            self.shutdown.install_signal_handlers();
        }

        let options = ConnectionOptions::from_config(&self.config.connection)
            .with_state_store(Arc::clone(&self.state_store));

        let mut connections = JoinSet::new();
        for (agent_id, handler) in &self.handlers {
            let manager = ConnectionManager::new(
                agent_id.clone(),
                self.api_key.clone(),
                Arc::clone(handler),
                Arc::clone(&self.authenticator),
                Arc::clone(&self.transport),
                options.clone(),
                self.shutdown.child_token(),
            );
            connections.spawn(async move { manager.run().await });
        }
        tracing::info!("Started {} connection(s)", connections.len());

        let mut first_error = None;
        while let Some(joined) = connections.join_next().await {
            let outcome = joined.map_err(|e| ConnectorError::TaskFailed(e.to_string()));
            if let Err(e) = outcome.and_then(|r| r) {
                first_error.get_or_insert(e);
            }
        }

        self.shutdown.shutdown(ShutdownReason::AllConnectionsClosed);
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::API_KEY_ENV;
    use crate::connector::TransportSession;
    use async_trait::async_trait;

    struct StubAuth;

    #[async_trait]
    impl Authenticator for StubAuth {
        async fn authenticate(&self, _api_key: &str) -> Result<String, ConnectorError> {
            Ok("tok-1".into())
        }
    }

    struct PanickingTransport;

    #[async_trait]
    impl Transport for PanickingTransport {
        async fn open(&self) -> Result<TransportSession, ConnectorError> {
            panic!("transport exploded")
        }
    }

    #[test]
    fn test_missing_api_key_is_config_error() {
        std::env::remove_var(API_KEY_ENV);
        assert!(matches!(Client::new(None), Err(ConnectorError::Config(_))));
    }

    #[test]
    fn test_register_handlers() {
        let mut client = Client::new(Some("key".into())).unwrap();
        client
            .on("demo-1", |_ctx, _payload| async move { Ok(Value::Null) })
            .on("demo-2", |_ctx, _payload| async move { Ok(Value::Null) })
            .on("demo-1", |_ctx, _payload| async move { Ok(Value::Bool(true)) });

        let mut ids: Vec<_> = client.agent_ids().cloned().collect();
        ids.sort();
        assert_eq!(ids, vec!["demo-1", "demo-2"]);
    }

    #[tokio::test]
    async fn test_connect_without_handlers_returns() {
        let client = Client::new(Some("key".into())).unwrap().without_signal_handlers();
        client.connect().await.unwrap();
    }

    #[tokio::test]
    async fn test_panicked_connection_task_is_reported() {
        let mut client = Client::new(Some("key".into()))
            .unwrap()
            .with_authenticator(Arc::new(StubAuth))
            .with_transport(Arc::new(PanickingTransport))
            .without_signal_handlers();
        client.on("demo-1", |_ctx, _payload| async move { Ok(Value::Null) });

        match client.connect().await {
            Err(ConnectorError::TaskFailed(message)) => assert!(message.contains("panicked")),
            other => panic!("Expected TaskFailed, got {:?}", other),
        }
        assert!(client.shutdown_manager().is_shutdown());
    }
}
