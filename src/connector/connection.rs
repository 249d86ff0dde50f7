//! 连接管理
//!
//! 每个注册的智能体一条长连接。状态机：
//!
//! ```text
//! Connecting -> Connected -> (Disconnected -> Connecting)* -> Stopped
//! ```
//!
//! - 连接前先登录换取 token，连上后发送 `authenticate`
//! - `token_expired`：原地重新登录并重发 `authenticate`，不断开；登录进行期间
//!   会话循环照常处理作业与停止请求
//! - `auth_error`：致命，停止且不重试
//! - 断线或连接失败：固定间隔后重连（重新登录）
//! - 运行标志被取消：发送 `disconnect`，中止进行中的作业，正常返回

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::auth::Authenticator;
use super::correlator::ResultCorrelator;
use super::dispatcher::JobDispatcher;
use super::emitter::EventEmitter;
use super::transport::Transport;
use crate::agent::SharedHandler;
use crate::config::ConnectionSection;
use crate::core::ConnectorError;
use crate::interface::StateStore;
use crate::protocol::{AuthenticatePayload, InboundEvent, OutboundEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Stopped,
}

/// 单条连接的可调参数
#[derive(Clone)]
pub struct ConnectionOptions {
    pub reconnect_delay: Duration,
    pub invoke_timeout: Option<Duration>,
    pub state_store: Option<Arc<dyn StateStore>>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(5),
            invoke_timeout: None,
            state_store: None,
        }
    }
}

impl ConnectionOptions {
    pub fn from_config(section: &ConnectionSection) -> Self {
        Self {
            reconnect_delay: section.reconnect_delay(),
            invoke_timeout: section.invoke_timeout(),
            state_store: None,
        }
    }

    pub fn with_state_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.state_store = Some(store);
        self
    }
}

/// 一次会话的结束方式
enum SessionEnd {
    Stopped,
    Disconnected,
}

/// 进行中的 token 刷新
type PendingRefresh = BoxFuture<'static, Result<String, ConnectorError>>;

pub struct ConnectionManager {
    agent_id: String,
    api_key: String,
    authenticator: Arc<dyn Authenticator>,
    transport: Arc<dyn Transport>,
    reconnect_delay: Duration,
    emitter: EventEmitter,
    correlator: Arc<ResultCorrelator>,
    dispatcher: Arc<JobDispatcher>,
    run_flag: CancellationToken,
    state_tx: watch::Sender<ConnectionState>,
}

impl ConnectionManager {
    pub fn new(
        agent_id: impl Into<String>,
        api_key: impl Into<String>,
        handler: SharedHandler,
        authenticator: Arc<dyn Authenticator>,
        transport: Arc<dyn Transport>,
        options: ConnectionOptions,
        run_flag: CancellationToken,
    ) -> Self {
        let agent_id = agent_id.into();
        let emitter = EventEmitter::new();
        let correlator = Arc::new(ResultCorrelator::new(
            emitter.clone(),
            options.invoke_timeout,
            run_flag.clone(),
        ));
        let dispatcher = Arc::new(JobDispatcher::new(
            agent_id.clone(),
            handler,
            emitter.clone(),
            Arc::clone(&correlator),
            options.state_store,
        ));
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);

        Self {
            agent_id,
            api_key: api_key.into(),
            authenticator,
            transport,
            reconnect_delay: options.reconnect_delay,
            emitter,
            correlator,
            dispatcher,
            run_flag,
            state_tx,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// 订阅状态变化
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn is_running(&self) -> bool {
        !self.run_flag.is_cancelled()
    }

    /// 请求停止；`run()` 会在当前等待点返回 `Ok(())`
    pub fn stop(&self) {
        self.run_flag.cancel();
    }

    /// 运行连接直到停止。只有凭证被拒绝时返回 Err
    pub async fn run(&self) -> Result<(), ConnectorError> {
        let span = tracing::info_span!("connection", agent_id = %self.agent_id);
        async {
            let mut jobs = JoinSet::new();
            let result = self.run_loop(&mut jobs).await;

            let abandoned = self.correlator.abandon_all().await;
            if abandoned > 0 {
                tracing::warn!("Abandoned {} pending sub job(s)", abandoned);
            }
            match &result {
                Ok(()) => {
                    if !jobs.is_empty() {
                        tracing::info!("Aborting {} in-flight job(s)", jobs.len());
                    }
                    jobs.abort_all();
                }
                Err(e) => {
                    tracing::error!("Connection stopped: {}", e);
                    jobs.detach_all();
                }
            }
            self.emitter.detach().await;
            self.run_flag.cancel();
            self.set_state(ConnectionState::Stopped);
            result
        }
        .instrument(span)
        .await
    }

    async fn run_loop(&self, jobs: &mut JoinSet<()>) -> Result<(), ConnectorError> {
        loop {
            if self.run_flag.is_cancelled() {
                return Ok(());
            }

            self.set_state(ConnectionState::Connecting);
            let connected = tokio::select! {
                _ = self.run_flag.cancelled() => return Ok(()),
                r = self.connect() => r,
            };

            match connected {
                Ok(mut inbound) => {
                    self.set_state(ConnectionState::Connected);
                    tracing::info!("Connected");
                    match self.session_loop(&mut inbound, jobs).await? {
                        SessionEnd::Stopped => {
                            self.close_session().await;
                            return Ok(());
                        }
                        SessionEnd::Disconnected => {}
                    }
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => tracing::warn!("Connection attempt failed: {}", e),
            }

            self.emitter.detach().await;
            self.set_state(ConnectionState::Disconnected);
            tracing::info!("Reconnecting in {}s", self.reconnect_delay.as_secs_f32());
            tokio::select! {
                _ = self.run_flag.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }
    }

    /// 登录、打开传输并发送 authenticate；断线期间积压的完成报告紧随其后补发
    async fn connect(&self) -> Result<mpsc::UnboundedReceiver<InboundEvent>, ConnectorError> {
        let token = self.authenticator.authenticate(&self.api_key).await?;
        let session = self.transport.open().await?;
        self.emitter
            .attach_after(session.outbound, self.authenticate_event(token))
            .await?;
        Ok(session.inbound)
    }

    async fn session_loop(
        &self,
        inbound: &mut mpsc::UnboundedReceiver<InboundEvent>,
        jobs: &mut JoinSet<()>,
    ) -> Result<SessionEnd, ConnectorError> {
        let mut refresh: Option<PendingRefresh> = None;
        loop {
            tokio::select! {
                _ = self.run_flag.cancelled() => return Ok(SessionEnd::Stopped),
                refreshed = next_refresh(&mut refresh), if refresh.is_some() => {
                    refresh = None;
                    self.finish_refresh(refreshed).await?;
                }
                Some(joined) = jobs.join_next(), if !jobs.is_empty() => {
                    if let Err(e) = joined {
                        if !e.is_cancelled() {
                            tracing::error!("Job task failed: {}", e);
                        }
                    }
                }
                event = inbound.recv() => match event {
                    None => {
                        tracing::warn!("Connection lost");
                        return Ok(SessionEnd::Disconnected);
                    }
                    Some(InboundEvent::JobRequest(request)) => {
                        self.dispatcher.dispatch(request, jobs);
                    }
                    Some(InboundEvent::JobResponse(response)) => {
                        self.correlator.on_job_response(response).await;
                    }
                    Some(InboundEvent::TokenExpired) => {
                        if refresh.is_some() {
                            tracing::debug!("Token refresh already in progress");
                        } else {
                            tracing::info!("Token expired, re-authenticating");
                            refresh = Some(self.start_refresh());
                        }
                    }
                    Some(InboundEvent::AuthError(payload)) => {
                        return Err(ConnectorError::Auth(payload.message));
                    }
                    Some(InboundEvent::Disconnect) => {
                        tracing::info!("Server requested disconnect");
                        return Ok(SessionEnd::Disconnected);
                    }
                },
            }
        }
    }

    /// token 过期：在后台重新登录，不阻塞会话循环
    fn start_refresh(&self) -> PendingRefresh {
        let authenticator = Arc::clone(&self.authenticator);
        let api_key = self.api_key.clone();
        Box::pin(async move { authenticator.authenticate(&api_key).await })
    }

    /// 刷新结束：成功则在当前会话上重发 authenticate，凭证被拒绝是致命的
    async fn finish_refresh(&self, refreshed: Result<String, ConnectorError>) -> Result<(), ConnectorError> {
        match refreshed {
            Ok(token) => {
                if let Err(e) = self.send_authenticate(token).await {
                    tracing::warn!("Failed to send refreshed token: {}", e);
                }
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                tracing::warn!("Token refresh failed, keeping current session: {}", e);
                Ok(())
            }
        }
    }

    async fn send_authenticate(&self, token: String) -> Result<(), ConnectorError> {
        self.emitter.emit(self.authenticate_event(token)).await
    }

    fn authenticate_event(&self, token: String) -> OutboundEvent {
        OutboundEvent::Authenticate(AuthenticatePayload {
            token,
            cid: self.agent_id.clone(),
            key: self.api_key.clone(),
        })
    }

    /// 主动停止时通知服务端
    async fn close_session(&self) {
        if let Err(e) = self.emitter.emit(OutboundEvent::Disconnect).await {
            tracing::debug!("Could not send disconnect: {}", e);
        }
        tracing::info!("Disconnected");
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            tracing::debug!(?previous, ?state, "Connection state changed");
        }
    }
}

async fn next_refresh(refresh: &mut Option<PendingRefresh>) -> Result<String, ConnectorError> {
    match refresh.as_mut() {
        Some(pending) => pending.await,
        None => std::future::pending().await,
    }
}
