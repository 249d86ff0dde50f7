//! 作业分发
//!
//! 每个入站 JobRequest 在独立任务中执行，恰好产生一个 JobCompletion。
//! 处理函数返回 Err 或 panic 都在这里被捕获并转换为失败的 JobCompletion，
//! 不会影响连接循环或其他并发作业。失败报告的 traceback 带有调用栈回溯。

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Once};

use futures_util::FutureExt;
use serde_json::Value;
use tokio::task::JoinSet;
use tracing::Instrument;

use super::correlator::ResultCorrelator;
use super::emitter::EventEmitter;
use crate::agent::SharedHandler;
use crate::core::ConnectorError;
use crate::interface::{HandlerContext, StateStore};
use crate::protocol::{JobCompletion, JobRequest, OutboundEvent};

pub struct JobDispatcher {
    agent_id: String,
    handler: SharedHandler,
    emitter: EventEmitter,
    correlator: Arc<ResultCorrelator>,
    state_store: Option<Arc<dyn StateStore>>,
}

impl JobDispatcher {
    pub fn new(
        agent_id: String,
        handler: SharedHandler,
        emitter: EventEmitter,
        correlator: Arc<ResultCorrelator>,
        state_store: Option<Arc<dyn StateStore>>,
    ) -> Self {
        install_panic_hook();
        Self {
            agent_id,
            handler,
            emitter,
            correlator,
            state_store,
        }
    }

    /// 在 `tasks` 中启动作业；不等待其完成
    pub fn dispatch(self: &Arc<Self>, request: JobRequest, tasks: &mut JoinSet<()>) {
        let span = tracing::info_span!("job", agent_id = %self.agent_id, job_id = %request.job_id);
        let dispatcher = Arc::clone(self);
        tasks.spawn(async move { dispatcher.execute(request).await }.instrument(span));
    }

    /// 执行作业并发出 job_completed
    ///
    /// 断线期间完成的作业由发射器暂存，重连认证后补发。
    pub async fn execute(&self, request: JobRequest) {
        let completion = self.run_job(request).await;
        if let Err(e) = self.emitter.emit(OutboundEvent::JobCompleted(completion)).await {
            tracing::error!("Failed to report job completion: {}", e);
        }
    }

    /// 执行处理函数，返回完成报告（成功或失败都恰好一个）
    pub async fn run_job(&self, request: JobRequest) -> JobCompletion {
        let JobRequest { job_id, job_payload } = request;
        tracing::info!(payload = %job_payload, "<< Job received");

        let payload = match job_payload {
            Value::Object(map) => map,
            other => {
                let err = ConnectorError::Handler(format!(
                    "job_payload must be a JSON object, got {}",
                    value_kind(&other)
                ));
                let traceback = format!("{err}\n\nStack backtrace:\n{}", Backtrace::force_capture());
                tracing::error!("Job rejected: {}", err);
                return JobCompletion::failed(err.to_string(), traceback);
            }
        };

        // 状态归属：载荷中的 user_id，否则按智能体区分
        let state_id = payload
            .get("user_id")
            .and_then(|v| v.as_str())
            .unwrap_or(&self.agent_id)
            .to_string();

        let ctx = HandlerContext::new(
            job_id,
            self.agent_id.clone(),
            state_id,
            self.emitter.clone(),
            Arc::clone(&self.correlator),
            self.state_store.clone(),
        );

        let outcome = AssertUnwindSafe(self.handler.handle(ctx, payload))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(result)) => {
                tracing::info!(">> Job completed");
                JobCompletion::succeeded(result)
            }
            Ok(Err(err)) => {
                let traceback = error_traceback(&err);
                tracing::error!("Job failed:\n{}", traceback);
                JobCompletion::failed(err.to_string(), traceback)
            }
            Err(panic) => {
                // 回溯由 panic hook 在同一线程上记录
                let message = panic_message(panic.as_ref());
                let traceback = take_panic_trace().unwrap_or_else(|| {
                    format!(
                        "handler panicked: {message}\n\nStack backtrace:\n{}",
                        Backtrace::force_capture()
                    )
                });
                tracing::error!("Job failed: {}", traceback);
                JobCompletion::failed(message, traceback)
            }
        }
    }
}

thread_local! {
    static PANIC_TRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

/// 安装一次 panic hook：在 panic 所在线程记录位置与回溯，然后交给原来的 hook
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let trace = format!("{info}\n\nStack backtrace:\n{}", Backtrace::force_capture());
            PANIC_TRACE.with(|slot| *slot.borrow_mut() = Some(trace));
            previous(info);
        }));
    });
}

fn take_panic_trace() -> Option<String> {
    PANIC_TRACE.with(|slot| slot.borrow_mut().take())
}

/// 错误链；anyhow 未捕获回溯时在分发边界补一份
fn error_traceback(err: &anyhow::Error) -> String {
    let chain = format!("{err:?}");
    if chain.contains("Stack backtrace:") {
        chain
    } else {
        format!("{chain}\n\nStack backtrace:\n{}", Backtrace::force_capture())
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
