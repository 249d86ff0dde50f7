//! 连接器核心：连接管理、作业分发、嵌套调用关联
//!
//! - **connection**: 每个智能体一条长连接，登录、重连、状态机
//! - **dispatcher**: 入站作业 -> 处理函数 -> job_completed
//! - **correlator**: invoke_skill 与 job_response 的按 id 关联
//! - **transport**: 传输层接缝（WebSocket）
//! - **auth**: API Key 换 token
//! - **emitter**: 出站事件路由到当前会话

pub mod auth;
pub mod connection;
pub mod correlator;
pub mod dispatcher;
pub mod emitter;
pub mod transport;

pub use auth::{Authenticator, HttpAuthenticator};
pub use connection::{ConnectionManager, ConnectionOptions, ConnectionState};
pub use correlator::ResultCorrelator;
pub use dispatcher::JobDispatcher;
pub use emitter::EventEmitter;
pub use transport::{Transport, TransportSession, WebSocketTransport};
