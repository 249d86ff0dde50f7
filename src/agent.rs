//! 智能体处理函数
//!
//! 每个注册的智能体 ID 对应一个 `AgentHandler`。服务端派发作业时，
//! 连接器为该作业创建一个 `HandlerContext` 并连同作业载荷交给处理函数；
//! 处理函数返回的值即作业结果，返回 Err（或 panic）即作业失败。
//!
//! 闭包可以直接作为处理函数注册：
//!
//! ```no_run
//! use bee_connector::{Client, HandlerContext, JobPayload};
//! use serde_json::{json, Value};
//!
//! let mut client = Client::new(Some("api-key".into())).unwrap();
//! client.on("demo-1", |ctx: HandlerContext, payload: JobPayload| async move {
//!     let query = payload.get("query").cloned().unwrap_or(Value::Null);
//!     let answer = ctx.invoke("demo-2", json!({ "query": query })).await?;
//!     Ok(json!({ "status": "success", "answer": answer }))
//! });
//! ```

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::interface::HandlerContext;
use crate::protocol::JobPayload;

#[async_trait]
pub trait AgentHandler: Send + Sync {
    async fn handle(&self, ctx: HandlerContext, payload: JobPayload) -> anyhow::Result<Value>;
}

#[async_trait]
impl<F, Fut> AgentHandler for F
where
    F: Fn(HandlerContext, JobPayload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn handle(&self, ctx: HandlerContext, payload: JobPayload) -> anyhow::Result<Value> {
        (self)(ctx, payload).await
    }
}

/// 共享的处理函数引用
pub type SharedHandler = Arc<dyn AgentHandler>;

/// 把闭包包装为 `SharedHandler`，闭包的返回类型由这里的约束推断
pub fn handler_fn<F, Fut>(f: F) -> SharedHandler
where
    F: Fn(HandlerContext, JobPayload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(f)
}
