//! 嵌套调用结果关联
//!
//! 处理函数调用其他智能体时，从它自己的视角看是一次同步调用：
//! 先按 `new_job_id` 登记一个 oneshot 槽位，再发出 `invoke_skill`，然后挂起等待；
//! 连接循环收到 `job_response` 时按 id 取出槽位并唤醒对应的等待者。
//!
//! 待决表只属于一条连接，不在连接之间共享。

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use super::emitter::EventEmitter;
use crate::core::ConnectorError;
use crate::protocol::{JobPayload, JobResponse, NestedInvocation, OutboundEvent};

pub struct ResultCorrelator {
    pending: Mutex<HashMap<String, oneshot::Sender<JobResponse>>>,
    emitter: EventEmitter,
    /// None 表示一直等待，直到结果到达或连接停止
    invoke_timeout: Option<Duration>,
    /// 连接的运行标志；取消后所有等待中的调用返回 Cancelled
    cancel: CancellationToken,
}

impl ResultCorrelator {
    pub fn new(emitter: EventEmitter, invoke_timeout: Option<Duration>, cancel: CancellationToken) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            emitter,
            invoke_timeout,
            cancel,
        }
    }

    /// 调用另一个智能体并等待其结果
    pub async fn invoke(&self, skill_id: &str, payload: JobPayload) -> Result<Value, ConnectorError> {
        if skill_id.is_empty() {
            return Err(ConnectorError::InvalidInput("skill_id is required".to_string()));
        }

        let job_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();

        // 先登记再发射：响应不可能早于登记被处理
        self.pending.lock().await.insert(job_id.clone(), tx);

        let invocation = NestedInvocation {
            new_job_id: job_id.clone(),
            skill_id: skill_id.to_string(),
            skill_payload: payload,
        };
        if let Err(e) = self.emitter.emit(OutboundEvent::InvokeSkill(invocation)).await {
            self.pending.lock().await.remove(&job_id);
            return Err(e);
        }
        tracing::info!(job_id = %job_id, skill_id, ">> Sub job invoked");

        let response = tokio::select! {
            received = self.wait(&job_id, rx) => received?,
            _ = self.cancel.cancelled() => {
                self.pending.lock().await.remove(&job_id);
                return Err(ConnectorError::Cancelled);
            }
        };

        resolve(response)
    }

    async fn wait(
        &self,
        job_id: &str,
        mut rx: oneshot::Receiver<JobResponse>,
    ) -> Result<JobResponse, ConnectorError> {
        let received = match self.invoke_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, &mut rx).await {
                Ok(r) => r,
                Err(_) => {
                    if let Some(response) = self.reclaim_after_timeout(job_id, &mut rx).await {
                        return Ok(response);
                    }
                    tracing::warn!(job_id, "Sub job abandoned after {}s", timeout.as_secs());
                    return Err(ConnectorError::InvokeTimeout {
                        job_id: job_id.to_string(),
                        timeout_secs: timeout.as_secs(),
                    });
                }
            },
            None => rx.await,
        };
        // 发送端只会在 abandon_all 中被丢弃
        received.map_err(|_| ConnectorError::Cancelled)
    }

    /// 超时后撤销槽位。若响应已在超时与撤销之间送达，返回它而不是判定超时
    async fn reclaim_after_timeout(
        &self,
        job_id: &str,
        rx: &mut oneshot::Receiver<JobResponse>,
    ) -> Option<JobResponse> {
        self.pending.lock().await.remove(job_id);
        rx.try_recv().ok()
    }

    /// 处理一条 job_response；没有对应等待者时丢弃并返回 false
    pub async fn on_job_response(&self, response: JobResponse) -> bool {
        // 持锁发送：槽位一旦被取出，结果在锁释放前已写入通道
        let mut pending = self.pending.lock().await;
        match pending.remove(&response.id) {
            Some(tx) => {
                let id = response.id.clone();
                if tx.send(response).is_err() {
                    tracing::debug!(job_id = %id, "Waiter went away before sub job result arrived");
                }
                true
            }
            None => {
                tracing::warn!(job_id = %response.id, "Dropping job_response with no pending invocation");
                false
            }
        }
    }

    /// 放弃全部等待中的调用
    pub async fn abandon_all(&self) -> usize {
        let mut pending = self.pending.lock().await;
        let count = pending.len();
        pending.clear();
        count
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

fn resolve(response: JobResponse) -> Result<Value, ConnectorError> {
    tracing::info!(job_id = %response.id, "<< Sub job completed");
    if !response.success {
        tracing::warn!(
            job_id = %response.id,
            traceback = response.traceback.as_deref().unwrap_or(""),
            "Sub job failed"
        );
        return Err(ConnectorError::Correlation {
            job_id: response.id,
            message: response.error.unwrap_or_else(|| "unknown error".to_string()),
        });
    }
    Ok(response.result)
}
