//! Bee Connector - 示例工作进程
//!
//! 用法：`bee-connector <agent-id>...`
//!
//! 为每个给定的智能体 ID 注册一个演示处理函数并连接服务端：
//! 先推送一条“处理中”消息，若载荷带 `delegate_to` 则把 `query` 转交给该智能体，
//! 最后回显结果。配置文件路径可通过 BEE_CONFIG 指定。

use std::path::PathBuf;

use anyhow::Context;
use bee_connector::{
    config::{load_config, RuntimeFlavor, RuntimeSection},
    observability, Client, HandlerContext, JobPayload,
};
use serde_json::{json, Value};

fn main() -> anyhow::Result<()> {
    observability::init();

    let agent_ids: Vec<String> = std::env::args().skip(1).collect();
    if agent_ids.is_empty() {
        anyhow::bail!("usage: bee-connector <agent-id>...");
    }

    let config_path = std::env::var_os("BEE_CONFIG").map(PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load config")?;
    let runtime = build_runtime(&cfg.runtime).context("Failed to build runtime")?;

    runtime.block_on(async move {
        let mut client = Client::from_config(cfg)?;
        for id in agent_ids {
            client.on(id, demo_handler);
        }
        client.connect().await?;
        Ok::<(), anyhow::Error>(())
    })
}

fn build_runtime(section: &RuntimeSection) -> std::io::Result<tokio::runtime::Runtime> {
    match section.flavor {
        RuntimeFlavor::CurrentThread => tokio::runtime::Builder::new_current_thread().enable_all().build(),
        RuntimeFlavor::MultiThread => {
            let mut builder = tokio::runtime::Builder::new_multi_thread();
            if let Some(n) = section.worker_threads {
                builder.worker_threads(n);
            }
            builder.enable_all().build()
        }
    }
}

async fn demo_handler(mut ctx: HandlerContext, payload: JobPayload) -> anyhow::Result<Value> {
    let query = payload.get("query").cloned().unwrap_or(Value::Null);

    ctx.new_message().text("Working on it...");
    if let Err(e) = ctx.notify().await {
        tracing::warn!("Could not send progress message: {}", e);
    }

    let answer = match payload.get("delegate_to").and_then(Value::as_str) {
        Some(agent) => ctx
            .invoke(agent, json!({ "query": query }))
            .await
            .with_context(|| format!("delegating to {agent}"))?,
        None => query,
    };

    Ok(json!({ "status": "success", "agent": ctx.agent_id(), "answer": answer }))
}
