//! 传输会话：一条 WebSocket 连接的完整生命周期
//!
//! 状态机 `Disconnected → Connecting → Open → Disconnected(重连已排期)`，`stop()` 之后进入终态 `Stopped`，
//! 不再重连。入站帧、建连、断开都以 [`SessionEvent`] 发给调用方，由调用方决定交给 Registry 还是事件分类器。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use super::registry::FrameWriter;
use crate::core::GatewayError;

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Open,
    /// stop() 之后的终态
    Stopped,
}

/// 会话向调用方报告的事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Opened,
    Frame(String),
    /// 一条已建立的连接断开（含 stop 触发的断开）
    Closed,
}

/// 会话配置
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// 日志里区分会话用，如 "event" / "api"
    pub name: String,
    pub url: String,
    /// 非空时以 `Authorization: Bearer <token>` 发送
    pub access_token: Option<String>,
    pub reconnect_delay: Duration,
    /// 首次连接前等待（API 会话让事件会话先建立）
    pub initial_delay: Duration,
}

impl SessionConfig {
    pub fn new(name: &str, url: &str) -> Self {
        Self {
            name: name.to_string(),
            url: url.to_string(),
            access_token: None,
            reconnect_delay: Duration::from_secs(5),
            initial_delay: Duration::ZERO,
        }
    }
}

/// 单条 WebSocket 连接的拥有者
pub struct TransportSession {
    config: SessionConfig,
    state: watch::Sender<SessionState>,
    writer: Mutex<Option<mpsc::UnboundedSender<String>>>,
    running: AtomicBool,
    shutdown: CancellationToken,
}

impl TransportSession {
    pub fn new(config: SessionConfig) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        Self {
            config,
            state,
            writer: Mutex::new(None),
            running: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// 订阅状态变化（测试与启动等待用）
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// 启动连接循环，返回事件接收端；每个会话只能启动一次
    pub fn start(
        self: &Arc<Self>,
    ) -> Result<mpsc::UnboundedReceiver<SessionEvent>, GatewayError> {
        if self.shutdown.is_cancelled() || self.running.swap(true, Ordering::SeqCst) {
            return Err(GatewayError::Transport(format!(
                "会话 {} 已启动或已停止",
                self.config.name
            )));
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = Arc::clone(self);
        tokio::spawn(async move {
            session.run(events_tx).await;
        });
        Ok(events_rx)
    }

    /// 停止会话：进入终态，取消待执行的重连
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.state.send_replace(SessionState::Stopped);
        self.shutdown.cancel();
        tracing::info!(session = %self.config.name, "会话已停止");
    }

    fn set_state(&self, next: SessionState) {
        self.state.send_if_modified(|current| {
            if *current == SessionState::Stopped || *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    fn writer_guard(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<String>>> {
        self.writer.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn run(self: Arc<Self>, events: mpsc::UnboundedSender<SessionEvent>) {
        let name = self.config.name.clone();

        if !self.config.initial_delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(self.config.initial_delay) => {}
                _ = self.shutdown.cancelled() => return,
            }
        }

        while self.is_running() {
            self.set_state(SessionState::Connecting);
            tracing::info!(session = %name, url = %self.config.url, "连接到 WebSocket");

            let result = self.connect_and_run(&events).await;
            let was_open = self.writer_guard().take().is_some();
            match result {
                Ok(()) => tracing::info!(session = %name, "WebSocket 连接已断开"),
                Err(e) => tracing::warn!(session = %name, error = %e, "WebSocket 错误"),
            }
            if was_open {
                let _ = events.send(SessionEvent::Closed);
            }

            if !self.is_running() {
                break;
            }
            self.set_state(SessionState::Disconnected);
            tracing::info!(
                session = %name,
                delay_secs = self.config.reconnect_delay.as_secs(),
                "稍后尝试重新连接..."
            );

            tokio::select! {
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
                _ = self.shutdown.cancelled() => break,
            }
        }

        self.set_state(SessionState::Stopped);
        tracing::debug!(session = %name, "连接循环退出");
    }

    /// 单次连接：握手后双向转发，直到断开或 stop
    async fn connect_and_run(
        &self,
        events: &mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<(), GatewayError> {
        let mut request = self.config.url.as_str().into_client_request()?;
        if let Some(token) = self.config.access_token.as_deref().filter(|t| !t.is_empty()) {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| GatewayError::Transport(e.to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (ws_stream, _response) = tokio::select! {
            result = tokio_tungstenite::connect_async(request) => result?,
            _ = self.shutdown.cancelled() => return Ok(()),
        };
        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        *self.writer_guard() = Some(tx);
        self.set_state(SessionState::Open);
        tracing::info!(session = %self.config.name, "WebSocket 连接已建立！");
        let _ = events.send(SessionEvent::Opened);

        loop {
            tokio::select! {
                msg = ws_rx.next() => match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        let _ = events.send(SessionEvent::Frame(text));
                    }
                    Some(Ok(WsMessage::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => {
                            let _ = events.send(SessionEvent::Frame(text));
                        }
                        Err(e) => tracing::warn!(error = %e, "丢弃非 UTF-8 二进制帧"),
                    },
                    Some(Ok(WsMessage::Ping(data))) => {
                        ws_tx.send(WsMessage::Pong(data)).await?;
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        tracing::info!(session = %self.config.name, ?frame, "服务端关闭连接");
                        return Ok(());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => return Ok(()),
                },
                out = rx.recv() => match out {
                    Some(text) => ws_tx.send(WsMessage::Text(text)).await?,
                    None => return Ok(()),
                },
                _ = self.shutdown.cancelled() => {
                    let _ = ws_tx.send(WsMessage::Close(None)).await;
                    return Ok(());
                }
            }
        }
    }
}

impl FrameWriter for TransportSession {
    fn is_open(&self) -> bool {
        self.state() == SessionState::Open && self.writer_guard().is_some()
    }

    fn write(&self, text: String) -> Result<(), GatewayError> {
        if self.state() != SessionState::Open {
            return Err(GatewayError::NotConnected);
        }
        match self.writer_guard().as_ref() {
            Some(tx) => tx.send(text).map_err(|_| GatewayError::NotConnected),
            None => Err(GatewayError::NotConnected),
        }
    }
}
