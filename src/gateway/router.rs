//! 帧分发：会话收到的每一帧先看是不是 API 响应（交给关联表），否则当作事件交给事件处理者
//!
//! 无法解析的帧记录后丢弃，不影响接收循环。

use std::sync::Arc;

use tokio::sync::mpsc;

use super::frame::{parse_frame, Frame, InboundEvent};
use super::registry::CorrelationRegistry;
use super::session::SessionEvent;

/// 事件处理者：不得阻塞调用方（耗时处理自行 spawn）
pub trait EventSink: Send + Sync {
    fn on_event(&self, event: InboundEvent);
}

/// 单个会话的帧分发器
pub struct FrameRouter {
    name: String,
    registry: Arc<CorrelationRegistry>,
    sink: Option<Arc<dyn EventSink>>,
    /// 本会话是否承载关联表的请求（断开时需清空 pending）
    owns_registry: bool,
}

impl FrameRouter {
    /// 承载 API 请求的会话：响应交给关联表，事件忽略
    pub fn for_api(name: &str, registry: Arc<CorrelationRegistry>) -> Self {
        Self {
            name: name.to_string(),
            registry,
            sink: None,
            owns_registry: true,
        }
    }

    /// 事件会话：事件交给 sink，偶发的响应帧仍交给关联表
    pub fn for_events(name: &str, registry: Arc<CorrelationRegistry>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            name: name.to_string(),
            registry,
            sink: Some(sink),
            owns_registry: false,
        }
    }

    /// 分发一帧文本
    pub fn route(&self, text: &str) {
        match parse_frame(text) {
            Ok(Frame::Response(response)) => {
                self.registry.on_response(response);
            }
            Ok(Frame::Event(event)) => match &self.sink {
                Some(sink) => sink.on_event(*event),
                None => tracing::trace!(session = %self.name, kind = ?event.kind, "忽略事件"),
            },
            Ok(Frame::Other) => {
                tracing::trace!(session = %self.name, "忽略无 echo 的帧");
            }
            Err(e) => {
                let preview: String = text.chars().take(200).collect();
                tracing::warn!(session = %self.name, error = %e, raw = %preview, "处理 WebSocket 消息失败");
            }
        }
    }

    pub fn handle(&self, event: SessionEvent) {
        match event {
            SessionEvent::Opened => {
                tracing::info!(session = %self.name, "会话已就绪");
            }
            SessionEvent::Frame(text) => self.route(&text),
            SessionEvent::Closed => {
                if self.owns_registry {
                    self.registry.fail_all();
                }
            }
        }
    }

    /// 消费会话事件直到会话结束
    pub async fn run(self, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
        while let Some(event) = events.recv().await {
            self.handle(event);
        }
        tracing::debug!(session = %self.name, "帧分发结束");
    }
}
