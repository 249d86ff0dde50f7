//! 核心层：错误类型与进程关闭信号

pub mod error;
pub mod shutdown;

pub use error::{ApiError, ConnectorError};
pub use shutdown::{ShutdownManager, ShutdownReason};
