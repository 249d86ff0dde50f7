//! HandlerContext：处理函数唯一能接触到的对象
//!
//! 每个入站作业创建一个，处理函数返回后销毁。它对外提供消息推送、嵌套调用与状态访问，
//! 不暴露任何传输细节。

use std::sync::Arc;

use serde_json::{json, Value};

use super::message::Message;
use super::state::{StateProxy, StateStore};
use crate::connector::correlator::ResultCorrelator;
use crate::connector::emitter::EventEmitter;
use crate::core::ConnectorError;
use crate::protocol::{JobPayload, OutboundEvent};

/// 读取会话历史的内置技能 ID
pub const GET_THREAD_SKILL: &str = "s_get_thread";

pub struct HandlerContext {
    job_id: String,
    agent_id: String,
    message: Option<Message>,
    emitter: EventEmitter,
    correlator: Arc<ResultCorrelator>,
    state: StateProxy,
}

impl HandlerContext {
    pub(crate) fn new(
        job_id: String,
        agent_id: String,
        state_id: String,
        emitter: EventEmitter,
        correlator: Arc<ResultCorrelator>,
        state_store: Option<Arc<dyn StateStore>>,
    ) -> Self {
        Self {
            job_id,
            agent_id,
            message: None,
            emitter,
            correlator,
            state: StateProxy::new(state_id, state_store),
        }
    }

    /// 当前作业 ID（服务端生成）
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// 当前处理函数注册的智能体 ID
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// 创建一条新消息并返回其可变引用；会替换之前创建的消息
    pub fn new_message(&mut self) -> &mut Message {
        self.message.insert(Message::new())
    }

    pub fn message(&self) -> Option<&Message> {
        self.message.as_ref()
    }

    pub fn message_mut(&mut self) -> Option<&mut Message> {
        self.message.as_mut()
    }

    /// 把当前消息推送给用户（`direct_message` 事件）
    pub async fn notify(&self) -> Result<(), ConnectorError> {
        let message = self.message.as_ref().ok_or(ConnectorError::NoMessage)?;
        self.emitter
            .emit(OutboundEvent::DirectMessage(message.to_direct_message()))
            .await
    }

    /// 调用另一个智能体并等待结果。`payload` 必须是 JSON 对象（或 null）
    pub async fn invoke(&self, agent_id: &str, payload: Value) -> Result<Value, ConnectorError> {
        let payload = match payload {
            Value::Object(map) => map,
            Value::Null => JobPayload::new(),
            other => {
                return Err(ConnectorError::InvalidInput(format!(
                    "invoke payload must be an object, got {}",
                    other
                )))
            }
        };
        self.correlator.invoke(agent_id, payload).await
    }

    /// 读取当前会话最近 `nr` 条消息
    pub async fn get_thread(&self, nr: usize, to_string: bool) -> Result<Value, ConnectorError> {
        self.invoke(
            GET_THREAD_SKILL,
            json!({ "nr_of_messages": nr, "to_string": to_string }),
        )
        .await
    }

    pub fn state(&self) -> &StateProxy {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut StateProxy {
        &mut self.state
    }

    pub async fn load_state(&mut self) -> Result<(), ConnectorError> {
        self.state.load().await
    }

    pub async fn save_state(&mut self) -> Result<(), ConnectorError> {
        self.state.save().await
    }
}

impl std::fmt::Debug for HandlerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerContext")
            .field("job_id", &self.job_id)
            .field("agent_id", &self.agent_id)
            .field("message", &self.message)
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::state::tests::MemoryStateStore;
    use crate::protocol::{JobResponse, NestedInvocation};
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    async fn context() -> (HandlerContext, Arc<ResultCorrelator>, mpsc::UnboundedReceiver<OutboundEvent>) {
        let emitter = EventEmitter::new();
        let (tx, rx) = mpsc::unbounded_channel();
        emitter.attach(tx).await;
        let correlator = Arc::new(ResultCorrelator::new(
            emitter.clone(),
            None,
            CancellationToken::new(),
        ));
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::default());
        let ctx = HandlerContext::new(
            "j1".into(),
            "demo-1".into(),
            "user-1".into(),
            emitter,
            Arc::clone(&correlator),
            Some(store),
        );
        (ctx, correlator, rx)
    }

    async fn next_invocation(rx: &mut mpsc::UnboundedReceiver<OutboundEvent>) -> NestedInvocation {
        match rx.recv().await {
            Some(OutboundEvent::InvokeSkill(inv)) => inv,
            other => panic!("Expected invoke_skill, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_notify_requires_message() {
        let (ctx, _, mut rx) = context().await;
        assert!(matches!(ctx.notify().await, Err(ConnectorError::NoMessage)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_notify_emits_direct_message() {
        let (mut ctx, _, mut rx) = context().await;
        ctx.new_message().text("working on it");
        let id = ctx.message().unwrap().id.clone();
        ctx.notify().await.unwrap();

        match rx.recv().await {
            Some(OutboundEvent::DirectMessage(dm)) => {
                assert_eq!(dm.message_id, id);
                assert_eq!(dm.interface, vec![json!({"type": "text", "text": "working on it"})]);
            }
            other => panic!("Expected direct_message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_get_thread_invokes_builtin_skill() {
        let (ctx, correlator, mut rx) = context().await;
        let ctx = Arc::new(ctx);

        let c = Arc::clone(&ctx);
        let call = tokio::spawn(async move { c.get_thread(5, false).await });

        let inv = next_invocation(&mut rx).await;
        assert_eq!(inv.skill_id, GET_THREAD_SKILL);
        assert_eq!(inv.skill_payload["nr_of_messages"], json!(5));
        assert_eq!(inv.skill_payload["to_string"], json!(false));

        correlator
            .on_job_response(JobResponse {
                id: inv.new_job_id,
                success: true,
                result: json!(["m1", "m2"]),
                error: None,
                traceback: None,
            })
            .await;
        assert_eq!(call.await.unwrap().unwrap(), json!(["m1", "m2"]));
    }

    #[tokio::test]
    async fn test_invoke_rejects_non_object_payload() {
        let (ctx, _, _rx) = context().await;
        let err = ctx.invoke("demo-2", json!([1, 2])).await.unwrap_err();
        assert!(matches!(err, ConnectorError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_state_round_trip() {
        let (mut ctx, _, _rx) = context().await;
        ctx.load_state().await.unwrap();
        ctx.state_mut().insert("visits", json!(1));
        ctx.save_state().await.unwrap();
        assert_eq!(ctx.state()["visits"], json!(1));
        assert_eq!(ctx.state().state_id(), "user-1");
    }
}
