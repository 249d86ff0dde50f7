//! 传输层：打开一条与服务端的事件会话
//!
//! `Transport` 是连接管理器与网络之间的接缝：生产环境用 WebSocket，测试用内存通道。
//! 一个会话由一对通道组成；入站通道结束（recv 返回 None）即表示断线。

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::core::ConnectorError;
use crate::protocol::{InboundEvent, OutboundEvent};

/// 一次已建立的传输会话
pub struct TransportSession {
    /// 出站事件；丢弃全部发送端即关闭会话
    pub outbound: mpsc::UnboundedSender<OutboundEvent>,
    /// 入站事件；None 表示连接已断开
    pub inbound: mpsc::UnboundedReceiver<InboundEvent>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// 建立会话；网络层失败返回 `ConnectorError::Transport`
    async fn open(&self) -> Result<TransportSession, ConnectorError>;
}

/// WebSocket 传输：JSON 文本帧 `{"event": ..., "data": ...}`
pub struct WebSocketTransport {
    url: String,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self) -> Result<TransportSession, ConnectorError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| ConnectorError::Transport(format!("connect {} failed: {}", self.url, e)))?;

        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<OutboundEvent>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<InboundEvent>();

        tokio::spawn(async move {
            while let Some(event) = out_rx.recv().await {
                let frame = match event.to_frame() {
                    Ok(f) => f,
                    Err(e) => {
                        tracing::error!("Failed to encode {} event: {}", event.name(), e);
                        continue;
                    }
                };
                if let Err(e) = ws_tx.send(WsMessage::Text(frame)).await {
                    tracing::warn!("WebSocket send error: {}", e);
                    break;
                }
            }
            let _ = ws_tx.send(WsMessage::Close(None)).await;
        });

        tokio::spawn(async move {
            while let Some(msg) = ws_rx.next().await {
                let msg = match msg {
                    Ok(m) => m,
                    Err(e) => {
                        tracing::warn!("WebSocket receive error: {}", e);
                        break;
                    }
                };

                match msg {
                    WsMessage::Text(text) => match InboundEvent::from_frame(&text) {
                        Ok(event) => {
                            if in_tx.send(event).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::warn!("Ignoring unrecognised frame: {}", e);
                        }
                    },
                    WsMessage::Close(_) => break,
                    _ => {}
                }
            }
        });

        Ok(TransportSession {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
