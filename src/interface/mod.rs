//! 处理函数侧接口：HandlerContext、消息构建器、状态代理

pub mod context;
pub mod message;
pub mod state;

pub use context::{HandlerContext, GET_THREAD_SKILL};
pub use message::Message;
pub use state::{StateProxy, StateStore};
