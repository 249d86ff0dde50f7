//! Bee Connector - 远程智能体连接器
//!
//! 工作进程注册若干处理函数（智能体），每个处理函数与服务端保持一条已认证的长连接，
//! 接收服务端派发的作业、执行、回报结果；处理函数内部可以同步地调用其他智能体。
//!
//! 模块划分：
//! - **agent**: 处理函数 trait（闭包自动实现）
//! - **client**: 处理函数注册与进程级生命周期
//! - **connector**: 连接管理、作业分发、嵌套调用关联、传输与登录
//! - **interface**: HandlerContext、消息构建器、状态代理
//! - **protocol**: 线上事件格式
//! - **api**: REST 协作层（状态、消息、智能体目录）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型、优雅关闭
//! - **observability**: 日志初始化

pub mod agent;
pub mod api;
pub mod client;
pub mod config;
pub mod connector;
pub mod core;
pub mod interface;
pub mod observability;
pub mod protocol;

pub use agent::{handler_fn, AgentHandler, SharedHandler};
pub use client::Client;
pub use crate::core::{ApiError, ConnectorError, ShutdownManager, ShutdownReason};
pub use interface::{HandlerContext, Message, StateProxy, StateStore};
pub use protocol::JobPayload;
