//! 关联表：echo → 等待中的请求
//!
//! 每个请求在表中持有一个 oneshot 发送端，谁先把条目从表里移除谁负责完成它（响应 / 超时 / 断线），
//! 因此同一个 echo 最多只会被完成一次。表的增删查都在同一把锁下进行，锁内不 await。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::frame::{RequestFrame, RpcResponse};
use crate::core::GatewayError;

/// 固定请求超时
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Registry 写帧的出口（由传输会话实现）
pub trait FrameWriter: Send + Sync {
    /// 底层会话是否处于 Open
    fn is_open(&self) -> bool;

    /// 写出一帧文本；未连接时返回 `NotConnected`
    fn write(&self, text: String) -> Result<(), GatewayError>;
}

type Completion = oneshot::Sender<Result<Value, GatewayError>>;

struct PendingRequest {
    action: String,
    created_at: Instant,
    deadline: Instant,
    completion: Completion,
}

/// 请求 / 响应关联表
pub struct CorrelationRegistry {
    writer: Arc<dyn FrameWriter>,
    pending: Mutex<HashMap<String, PendingRequest>>,
    counter: AtomicU64,
    timeout: Duration,
}

/// send() 的 future 被提前丢弃时清理表项
struct PendingGuard<'a> {
    registry: &'a CorrelationRegistry,
    echo: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.registry.table().remove(self.echo);
    }
}

impl CorrelationRegistry {
    pub fn new(writer: Arc<dyn FrameWriter>, timeout: Duration) -> Self {
        Self {
            writer,
            pending: Mutex::new(HashMap::new()),
            counter: AtomicU64::new(0),
            timeout,
        }
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, PendingRequest>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// `{action}_{自增序号}_{毫秒时间戳}`
    fn next_echo(&self, action: &str) -> String {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}_{}_{}", action, seq, chrono::Utc::now().timestamp_millis())
    }

    /// 发出请求并等待匹配的响应
    pub async fn send(&self, action: &str, params: Value) -> Result<Value, GatewayError> {
        if !self.writer.is_open() {
            return Err(GatewayError::NotConnected);
        }

        let echo = self.next_echo(action);
        let frame = serde_json::to_string(&RequestFrame {
            action,
            params,
            echo: &echo,
        })
        .map_err(|e| GatewayError::Transport(e.to_string()))?;

        let (tx, mut rx) = oneshot::channel();
        let now = Instant::now();
        self.table().insert(
            echo.clone(),
            PendingRequest {
                action: action.to_string(),
                created_at: now,
                deadline: now + self.timeout,
                completion: tx,
            },
        );
        let _guard = PendingGuard {
            registry: self,
            echo: &echo,
        };

        tracing::debug!(echo = %echo, action, "发送 API 请求");
        self.writer.write(frame)?;

        match tokio::time::timeout(self.timeout, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(GatewayError::ConnectionLost),
            Err(_) => {
                if self.table().remove(&echo).is_some() {
                    tracing::warn!(echo = %echo, action, "API 请求超时");
                    Err(GatewayError::Timeout)
                } else {
                    // 超时与响应同时到达：条目已被响应方取走，以响应为准
                    rx.try_recv().unwrap_or(Err(GatewayError::Timeout))
                }
            }
        }
    }

    /// 处理一条响应；未知或已过期的 echo 直接丢弃
    pub fn on_response(&self, response: RpcResponse) -> bool {
        let Some(entry) = self.table().remove(&response.echo) else {
            tracing::debug!(echo = %response.echo, "未知或已过期的响应，丢弃");
            return false;
        };

        let late = Instant::now() > entry.deadline;
        tracing::debug!(
            echo = %response.echo,
            action = %entry.action,
            elapsed_ms = entry.created_at.elapsed().as_millis() as u64,
            late,
            ok = response.result.is_ok(),
            "收到 API 响应"
        );
        if let Err(e) = &response.result {
            tracing::error!(echo = %response.echo, action = %entry.action, error = %e, "API 请求失败");
        }
        let _ = entry.completion.send(response.result);
        true
    }

    /// 连接断开：所有未完成请求以 ConnectionLost 失败并清空表
    pub fn fail_all(&self) -> usize {
        let drained: Vec<(String, PendingRequest)> = self.table().drain().collect();
        let count = drained.len();
        for (echo, entry) in drained {
            tracing::debug!(echo = %echo, action = %entry.action, "连接断开，请求失败");
            let _ = entry.completion.send(Err(GatewayError::ConnectionLost));
        }
        if count > 0 {
            tracing::warn!(count, "连接断开，清理等待中的请求");
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.table().len()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::AtomicBool;

    use super::*;

    /// 记录写出帧的假会话
    #[derive(Default)]
    pub(crate) struct FakeWriter {
        pub open: AtomicBool,
        pub frames: Mutex<Vec<String>>,
    }

    impl FakeWriter {
        pub fn open() -> Arc<Self> {
            let writer = Self::default();
            writer.open.store(true, Ordering::SeqCst);
            Arc::new(writer)
        }

        pub fn frames(&self) -> Vec<Value> {
            self.frames
                .lock()
                .unwrap()
                .iter()
                .map(|f| serde_json::from_str(f).unwrap())
                .collect()
        }

        /// 等到第 n 帧写出后返回其 echo
        pub async fn wait_echo(&self, n: usize) -> String {
            for _ in 0..200 {
                if let Some(frame) = self.frames().get(n) {
                    return frame["echo"].as_str().unwrap().to_string();
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            panic!("frame {n} never written");
        }
    }

    impl FrameWriter for FakeWriter {
        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        fn write(&self, text: String) -> Result<(), GatewayError> {
            if !self.is_open() {
                return Err(GatewayError::NotConnected);
            }
            self.frames.lock().unwrap().push(text);
            Ok(())
        }
    }

    fn ok_response(echo: &str, data: Value) -> RpcResponse {
        RpcResponse {
            echo: echo.to_string(),
            result: Ok(data),
        }
    }

    #[tokio::test]
    async fn test_not_connected_fails_fast() {
        let writer = Arc::new(FakeWriter::default());
        let registry = CorrelationRegistry::new(writer.clone(), DEFAULT_REQUEST_TIMEOUT);

        let result = registry.send("send_group_msg", serde_json::json!({})).await;
        assert_eq!(result, Err(GatewayError::NotConnected));
        assert!(writer.frames().is_empty());
        assert_eq!(registry.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_response_resolves_matching_request() {
        let writer = FakeWriter::open();
        let registry = Arc::new(CorrelationRegistry::new(writer.clone(), DEFAULT_REQUEST_TIMEOUT));

        let r = Arc::clone(&registry);
        let call = tokio::spawn(async move {
            r.send("get_msg", serde_json::json!({"message_id": 7})).await
        });

        let echo = writer.wait_echo(0).await;
        assert!(echo.starts_with("get_msg_1_"));
        let frame = &writer.frames()[0];
        assert_eq!(frame["action"], "get_msg");
        assert_eq!(frame["params"]["message_id"], 7);

        assert!(registry.on_response(ok_response(&echo, serde_json::json!({"ok": 1}))));
        // 第二次完成同一 echo 被丢弃
        assert!(!registry.on_response(ok_response(&echo, serde_json::json!({"ok": 2}))));

        let result = call.await.unwrap();
        assert_eq!(result, Ok(serde_json::json!({"ok": 1})));
        assert_eq!(registry.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_remote_error_surfaces() {
        let writer = FakeWriter::open();
        let registry = Arc::new(CorrelationRegistry::new(writer.clone(), DEFAULT_REQUEST_TIMEOUT));

        let r = Arc::clone(&registry);
        let call = tokio::spawn(async move { r.send("send_group_msg", Value::Null).await });
        let echo = writer.wait_echo(0).await;
        registry.on_response(RpcResponse {
            echo,
            result: Err(GatewayError::RemoteError("群不存在".to_string())),
        });

        assert_eq!(
            call.await.unwrap(),
            Err(GatewayError::RemoteError("群不存在".to_string()))
        );
    }

    #[tokio::test]
    async fn test_timeout_removes_entry() {
        let writer = FakeWriter::open();
        let registry = CorrelationRegistry::new(writer.clone(), Duration::from_millis(30));

        let result = registry.send("get_status", Value::Null).await;
        assert_eq!(result, Err(GatewayError::Timeout));
        assert_eq!(registry.pending_count(), 0);

        // 超时后到达的响应被丢弃
        let echo = writer.frames()[0]["echo"].as_str().unwrap().to_string();
        assert!(!registry.on_response(ok_response(&echo, Value::Null)));
    }

    #[tokio::test]
    async fn test_fail_all_on_close() {
        let writer = FakeWriter::open();
        let registry = Arc::new(CorrelationRegistry::new(writer.clone(), DEFAULT_REQUEST_TIMEOUT));

        let mut calls = Vec::new();
        for _ in 0..3 {
            let r = Arc::clone(&registry);
            calls.push(tokio::spawn(async move { r.send("get_msg", Value::Null).await }));
        }
        writer.wait_echo(2).await;
        assert_eq!(registry.pending_count(), 3);

        assert_eq!(registry.fail_all(), 3);
        assert_eq!(registry.pending_count(), 0);
        for call in calls {
            assert_eq!(call.await.unwrap(), Err(GatewayError::ConnectionLost));
        }
    }

    #[tokio::test]
    async fn test_dropped_caller_cleans_up() {
        let writer = FakeWriter::open();
        let registry = Arc::new(CorrelationRegistry::new(writer.clone(), DEFAULT_REQUEST_TIMEOUT));

        let r = Arc::clone(&registry);
        let call = tokio::spawn(async move { r.send("get_msg", Value::Null).await });
        writer.wait_echo(0).await;
        call.abort();
        let _ = call.await;
        assert_eq!(registry.pending_count(), 0);
    }

    #[test]
    fn test_echo_ids_unique() {
        let registry = CorrelationRegistry::new(FakeWriter::open(), DEFAULT_REQUEST_TIMEOUT);
        let ids: HashSet<String> = (0..1000).map(|_| registry.next_echo("send_group_msg")).collect();
        assert_eq!(ids.len(), 1000);
    }
}
