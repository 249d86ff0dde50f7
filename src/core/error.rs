//! 连接器错误类型
//!
//! 只有 `Auth` 与显式停止会终止一条连接；其余错误都在发生处被转换为结构化结果
//! （失败的 JobCompletion、invoke 的 Err），不会冒泡到重连循环。

use thiserror::Error;

/// 连接器运行过程中可能出现的错误
#[derive(Error, Debug)]
pub enum ConnectorError {
    /// 凭证或 token 被拒绝：对该连接是致命的，不重试
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// 网络层连接 / 读写失败：在连接活跃期间按固定间隔无限重试
    #[error("Transport error: {0}")]
    Transport(String),

    /// 作业无法交给处理函数执行（在分发器边界被转换为失败的 JobCompletion）
    #[error("Handler error: {0}")]
    Handler(String),

    /// 连接任务 panic 或被中止
    #[error("Connection task failed: {0}")]
    TaskFailed(String),

    /// 嵌套调用的远端返回失败
    #[error("Propagating error from sub job {job_id}: {message}")]
    Correlation { job_id: String, message: String },

    /// 嵌套调用等待超时（仅在配置了 invoke_timeout 时出现）
    #[error("Sub job {job_id} timed out after {timeout_secs}s")]
    InvokeTimeout { job_id: String, timeout_secs: u64 },

    /// 连接关闭，等待中的调用被放弃
    #[error("Connection is shutting down")]
    Cancelled,

    #[error("Please create a message first")]
    NoMessage,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// 收到无法解析的事件帧
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("Config error: {0}")]
    Config(String),
}

impl ConnectorError {
    /// 是否对连接致命（不再重连）
    pub fn is_fatal(&self) -> bool {
        matches!(self, ConnectorError::Auth(_))
    }
}

/// REST 协作层错误（状态 / 消息 / 智能体目录）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// 401 / 403
    #[error("Authorization error. Check your API key.")]
    Authorization,

    #[error("Not found: {0}")]
    NotFound(String),

    /// 其他非 2xx 状态
    #[error("Unexpected error {status}: {detail}")]
    Request { status: u16, detail: String },

    /// 请求未送达或响应无法解析
    #[error("Request failed: {0}")]
    Network(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_auth_is_fatal() {
        assert!(ConnectorError::Auth("401: bad key".into()).is_fatal());
        assert!(!ConnectorError::Transport("refused".into()).is_fatal());
        assert!(!ConnectorError::Cancelled.is_fatal());
        assert!(!ConnectorError::TaskFailed("task 3 panicked".into()).is_fatal());
    }

    #[test]
    fn test_correlation_message_carries_remote_error() {
        let err = ConnectorError::Correlation {
            job_id: "k1".into(),
            message: "remote agent offline".into(),
        };
        let text = err.to_string();
        assert!(text.contains("k1"));
        assert!(text.contains("remote agent offline"));
    }

    #[test]
    fn test_api_error_converts() {
        let err: ConnectorError = ApiError::Authorization.into();
        assert!(matches!(err, ConnectorError::Api(ApiError::Authorization)));
    }
}
