//! 出站事件发射器
//!
//! 作业任务与连接循环共享同一个发射器；它总是把事件写入“当前”传输会话。
//! 重连后旧会话的发送端被替换。断线期间产生的 job_completed 暂存在积压队列里，
//! 新会话认证之后按原顺序补发；其他事件在断线期间直接返回 Transport 错误。

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use crate::core::ConnectorError;
use crate::protocol::OutboundEvent;

#[derive(Default)]
struct Outbox {
    sink: Option<mpsc::UnboundedSender<OutboundEvent>>,
    /// 等待补发的作业完成报告
    backlog: Vec<OutboundEvent>,
}

#[derive(Clone, Default)]
pub struct EventEmitter {
    outbox: Arc<Mutex<Outbox>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// 绑定新的传输会话，并补发积压的完成报告
    pub async fn attach(&self, sender: mpsc::UnboundedSender<OutboundEvent>) {
        let mut outbox = self.outbox.lock().await;
        flush_backlog(&mut outbox, &sender);
        outbox.sink = Some(sender);
    }

    /// 绑定新的传输会话：先发送 `first`（authenticate），再补发积压的完成报告。
    /// 整个过程持有锁，作业任务的发射不会插到 `first` 之前。
    pub async fn attach_after(
        &self,
        sender: mpsc::UnboundedSender<OutboundEvent>,
        first: OutboundEvent,
    ) -> Result<(), ConnectorError> {
        let mut outbox = self.outbox.lock().await;
        let name = first.name();
        sender
            .send(first)
            .map_err(|_| ConnectorError::Transport(format!("session closed while emitting {name}")))?;
        flush_backlog(&mut outbox, &sender);
        outbox.sink = Some(sender);
        Ok(())
    }

    /// 解绑当前会话；返回旧的发送端（用于发送 disconnect 后关闭）
    pub async fn detach(&self) -> Option<mpsc::UnboundedSender<OutboundEvent>> {
        self.outbox.lock().await.sink.take()
    }

    pub async fn emit(&self, event: OutboundEvent) -> Result<(), ConnectorError> {
        let mut outbox = self.outbox.lock().await;
        let name = event.name();
        let undelivered = match outbox.sink.as_ref() {
            Some(tx) => match tx.send(event) {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(event)) => event,
            },
            None => event,
        };

        match undelivered {
            event @ OutboundEvent::JobCompleted(_) => {
                tracing::debug!("Session unavailable, holding job_completed until reconnect");
                outbox.backlog.push(event);
                Ok(())
            }
            _ if outbox.sink.is_some() => Err(ConnectorError::Transport(format!(
                "session closed while emitting {name}"
            ))),
            _ => Err(ConnectorError::Transport("not connected".to_string())),
        }
    }
}

fn flush_backlog(outbox: &mut Outbox, sender: &mpsc::UnboundedSender<OutboundEvent>) {
    if outbox.backlog.is_empty() {
        return;
    }
    tracing::info!("Re-sending {} job completion(s) held during disconnect", outbox.backlog.len());
    // 通道一旦关闭后续发送都会失败，未送出的报告按原顺序放回
    for event in std::mem::take(&mut outbox.backlog) {
        if let Err(mpsc::error::SendError(event)) = sender.send(event) {
            outbox.backlog.push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{AuthenticatePayload, JobCompletion};
    use serde_json::json;

    fn completion(n: u32) -> OutboundEvent {
        OutboundEvent::JobCompleted(JobCompletion::succeeded(json!(n)))
    }

    fn authenticate() -> OutboundEvent {
        OutboundEvent::Authenticate(AuthenticatePayload {
            token: "tok-2".into(),
            cid: "demo-1".into(),
            key: "key-1".into(),
        })
    }

    #[tokio::test]
    async fn test_emit_without_session_fails() {
        let emitter = EventEmitter::new();
        let err = emitter.emit(OutboundEvent::Disconnect).await.unwrap_err();
        assert!(matches!(err, ConnectorError::Transport(_)));
    }

    #[tokio::test]
    async fn test_emit_follows_latest_session() {
        let emitter = EventEmitter::new();
        let (old_tx, mut old_rx) = mpsc::unbounded_channel();
        emitter.attach(old_tx).await;
        emitter.emit(OutboundEvent::Disconnect).await.unwrap();
        assert_eq!(old_rx.recv().await, Some(OutboundEvent::Disconnect));

        let (new_tx, mut new_rx) = mpsc::unbounded_channel();
        emitter.attach(new_tx).await;
        emitter.emit(OutboundEvent::Disconnect).await.unwrap();
        assert_eq!(new_rx.recv().await, Some(OutboundEvent::Disconnect));
        assert!(old_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_detach() {
        let emitter = EventEmitter::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        emitter.attach(tx).await;
        assert!(emitter.detach().await.is_some());
        assert!(emitter.detach().await.is_none());
        assert!(emitter.emit(OutboundEvent::Disconnect).await.is_err());
    }

    #[tokio::test]
    async fn test_completion_held_while_detached_is_sent_after_authenticate() {
        let emitter = EventEmitter::new();
        emitter.emit(completion(1)).await.unwrap();
        emitter.emit(completion(2)).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        emitter.attach_after(tx, authenticate()).await.unwrap();

        assert_eq!(rx.recv().await, Some(authenticate()));
        assert_eq!(rx.recv().await, Some(completion(1)));
        assert_eq!(rx.recv().await, Some(completion(2)));
        assert!(rx.try_recv().is_err());
        assert!(emitter.outbox.lock().await.backlog.is_empty());
    }

    #[tokio::test]
    async fn test_completion_held_when_session_closed_before_detach() {
        let emitter = EventEmitter::new();
        let (old_tx, old_rx) = mpsc::unbounded_channel();
        emitter.attach(old_tx).await;
        drop(old_rx);

        emitter.emit(completion(7)).await.unwrap();
        assert!(emitter.emit(OutboundEvent::Disconnect).await.is_err());

        let (new_tx, mut new_rx) = mpsc::unbounded_channel();
        emitter.attach_after(new_tx, authenticate()).await.unwrap();
        assert_eq!(new_rx.recv().await, Some(authenticate()));
        assert_eq!(new_rx.recv().await, Some(completion(7)));
    }

    #[tokio::test]
    async fn test_attach_after_closed_session_keeps_backlog() {
        let emitter = EventEmitter::new();
        emitter.emit(completion(3)).await.unwrap();

        let (dead_tx, dead_rx) = mpsc::unbounded_channel();
        drop(dead_rx);
        assert!(emitter.attach_after(dead_tx, authenticate()).await.is_err());
        assert_eq!(emitter.outbox.lock().await.backlog.len(), 1);

        let (tx, mut rx) = mpsc::unbounded_channel();
        emitter.attach(tx).await;
        assert_eq!(rx.recv().await, Some(completion(3)));
    }
}
