//! 连接器与服务端之间的事件协议
//!
//! 每个 WebSocket 文本帧是一个 JSON 对象：`{"event": <事件名>, "data": <载荷>}`。
//! 只有两类业务消息（作业请求、作业响应/完成），其余为认证与连接控制事件。

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::ConnectorError;

/// 作业载荷：按名字展开给处理函数的参数
pub type JobPayload = Map<String, Value>;

/// 处理函数失败时写入 JobCompletion 的错误标签
pub const CONNECTOR_ERROR_TAG: &str = "Connector error";

/// 服务端 -> 连接器
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum InboundEvent {
    /// 服务端派发的作业
    JobRequest(JobRequest),
    /// 嵌套调用的结果
    JobResponse(JobResponse),
    /// token 过期，需要重新登录
    TokenExpired,
    /// 凭证无效（致命）
    AuthError(AuthErrorPayload),
    /// 服务端主动断开
    Disconnect,
}

/// 连接器 -> 服务端
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum OutboundEvent {
    Authenticate(AuthenticatePayload),
    JobCompleted(JobCompletion),
    /// 嵌套调用其他智能体
    InvokeSkill(NestedInvocation),
    /// 处理函数推送给用户的消息
    DirectMessage(DirectMessage),
    Disconnect,
}

impl OutboundEvent {
    /// 事件名（用于日志）
    pub fn name(&self) -> &'static str {
        match self {
            OutboundEvent::Authenticate(_) => "authenticate",
            OutboundEvent::JobCompleted(_) => "job_completed",
            OutboundEvent::InvokeSkill(_) => "invoke_skill",
            OutboundEvent::DirectMessage(_) => "direct_message",
            OutboundEvent::Disconnect => "disconnect",
        }
    }

    pub fn to_frame(&self) -> Result<String, ConnectorError> {
        serde_json::to_string(self).map_err(|e| ConnectorError::Protocol(e.to_string()))
    }
}

impl InboundEvent {
    pub fn from_frame(text: &str) -> Result<Self, ConnectorError> {
        serde_json::from_str(text).map_err(|e| ConnectorError::Protocol(e.to_string()))
    }
}

/// 连接建立后发送的认证信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthenticatePayload {
    pub token: String,
    /// 处理函数（智能体）ID
    pub cid: String,
    pub key: String,
}

/// 服务端派发的作业
///
/// `job_payload` 按原样保留；不是对象（例如 null）时由分发器回报失败的完成报告，
/// 而不是在解析阶段丢弃整帧。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub job_id: String,
    #[serde(default = "empty_payload")]
    pub job_payload: Value,
}

fn empty_payload() -> Value {
    Value::Object(JobPayload::new())
}

/// 作业完成报告：每个 JobRequest 恰好一个
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobCompletion {
    pub result: Value,
    pub success: bool,
    pub error: Option<String>,
    pub traceback: Option<String>,
    pub error_tag: Option<String>,
}

impl JobCompletion {
    pub fn succeeded(result: Value) -> Self {
        Self {
            result,
            success: true,
            error: None,
            traceback: None,
            error_tag: None,
        }
    }

    pub fn failed(error: impl Into<String>, traceback: impl Into<String>) -> Self {
        Self {
            result: Value::Null,
            success: false,
            error: Some(error.into()),
            traceback: Some(traceback.into()),
            error_tag: Some(CONNECTOR_ERROR_TAG.to_string()),
        }
    }
}

/// 发往其他智能体的嵌套调用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NestedInvocation {
    /// 客户端生成的全局唯一 ID
    pub new_job_id: String,
    pub skill_id: String,
    #[serde(default)]
    pub skill_payload: JobPayload,
}

/// 嵌套调用的结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResponse {
    pub id: String,
    #[serde(default = "default_success")]
    pub success: bool,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub traceback: Option<String>,
}

fn default_success() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectMessage {
    pub message_id: String,
    pub interface: Vec<Value>,
}

/// auth_error 载荷：服务端可能发 `{"message": ...}`，也可能直接发字符串
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "AuthErrorRepr")]
pub struct AuthErrorPayload {
    pub message: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AuthErrorRepr {
    Text(String),
    Object {
        #[serde(default)]
        message: String,
    },
}

impl From<AuthErrorRepr> for AuthErrorPayload {
    fn from(repr: AuthErrorRepr) -> Self {
        match repr {
            AuthErrorRepr::Text(message) | AuthErrorRepr::Object { message } => Self { message },
        }
    }
}
