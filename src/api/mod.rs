//! REST 协作层与智能体目录

pub mod agents;
pub mod client;

pub use agents::Agent;
pub use client::{ApiClient, MessageTarget, StoredMessage};
