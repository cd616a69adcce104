//! NapCat API：把出站动作变成一次 `send_group_msg` 请求，以及取引用消息的 `get_msg`
//!
//! 消息统一用 OneBot 消息段数组发送，回复时 reply 段放在最前面；
//! 文本段中的 `[CQ:...]` 不会被网关再次解析。

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use serde::Serialize;
use serde_json::Value;

use super::registry::CorrelationRegistry;
use crate::core::GatewayError;
use crate::cq;

/// 出站动作：每个被处理的事件恰好产生一个（或被提前过滤时没有）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundAction {
    SendText {
        text: String,
        reply_to: Option<i64>,
    },
    SendImage {
        bytes: Vec<u8>,
        filename: String,
        reply_to: Option<i64>,
    },
}

impl OutboundAction {
    pub fn reply_to(&self) -> Option<i64> {
        match self {
            OutboundAction::SendText { reply_to, .. } | OutboundAction::SendImage { reply_to, .. } => {
                *reply_to
            }
        }
    }

    /// 转成消息段数组
    pub fn to_segments(&self) -> Vec<MessageSegment> {
        let mut segments = Vec::with_capacity(2);
        if let Some(id) = self.reply_to() {
            segments.push(MessageSegment::Reply { id: id.to_string() });
        }
        match self {
            OutboundAction::SendText { text, .. } => {
                segments.push(MessageSegment::Text { text: text.clone() });
            }
            OutboundAction::SendImage { bytes, filename, .. } => {
                let data = base64::engine::general_purpose::STANDARD.encode(bytes);
                segments.push(MessageSegment::Image {
                    file: format!("base64://{}", data),
                    name: filename.clone(),
                });
            }
        }
        segments
    }
}

/// OneBot 消息段
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum MessageSegment {
    Reply { id: String },
    Text { text: String },
    Image { file: String, name: String },
}

/// 引用消息的内容类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Text,
    Image,
}

/// 回复标签解析出的被引用消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferencedMessage {
    pub sender_nickname: String,
    pub content_kind: ContentKind,
    /// Text 时为去标签后的文本；Image 时为图片来源（URL 或 base64://）
    pub content: String,
}

impl ReferencedMessage {
    /// 从 get_msg 的 data 解析
    pub fn from_data(data: &Value) -> Result<Self, GatewayError> {
        let raw = data
            .get("raw_message")
            .and_then(Value::as_str)
            .or_else(|| data.get("message").and_then(Value::as_str))
            .ok_or_else(|| GatewayError::MalformedFrame("get_msg 响应缺少 raw_message".to_string()))?;

        let sender = data.get("sender");
        let card = sender
            .and_then(|s| s.get("card"))
            .and_then(Value::as_str)
            .filter(|c| !c.is_empty());
        let nickname = card
            .or_else(|| sender.and_then(|s| s.get("nickname")).and_then(Value::as_str))
            .unwrap_or("某人")
            .to_string();

        Ok(match cq::first_image(raw) {
            Some(uri) => Self {
                sender_nickname: nickname,
                content_kind: ContentKind::Image,
                content: uri,
            },
            None => Self {
                sender_nickname: nickname,
                content_kind: ContentKind::Text,
                content: cq::plain_text(raw),
            },
        })
    }
}

/// 流水线依赖的网关能力
#[async_trait]
pub trait GatewayApi: Send + Sync {
    /// 在群内执行一个出站动作，返回新消息 ID
    async fn send_action(&self, group_id: i64, action: &OutboundAction) -> Result<i64, GatewayError>;

    /// 按消息 ID 取回消息
    async fn get_msg(&self, message_id: i64) -> Result<ReferencedMessage, GatewayError>;
}

/// 基于关联表的 NapCat API 客户端
pub struct NapCatApi {
    registry: Arc<CorrelationRegistry>,
}

impl NapCatApi {
    pub fn new(registry: Arc<CorrelationRegistry>) -> Self {
        Self { registry }
    }

    pub async fn send_group_msg(
        &self,
        group_id: i64,
        message: Vec<MessageSegment>,
    ) -> Result<i64, GatewayError> {
        let data = self
            .registry
            .send(
                "send_group_msg",
                serde_json::json!({ "group_id": group_id, "message": message }),
            )
            .await?;
        Ok(data.get("message_id").and_then(Value::as_i64).unwrap_or_default())
    }

    /// 连接探测
    pub async fn get_status(&self) -> bool {
        match self.registry.send("get_status", serde_json::json!({})).await {
            Ok(_) => true,
            Err(e) => {
                tracing::error!(error = %e, "NapCat 连接测试失败");
                false
            }
        }
    }
}

#[async_trait]
impl GatewayApi for NapCatApi {
    async fn send_action(&self, group_id: i64, action: &OutboundAction) -> Result<i64, GatewayError> {
        self.send_group_msg(group_id, action.to_segments()).await
    }

    async fn get_msg(&self, message_id: i64) -> Result<ReferencedMessage, GatewayError> {
        let data = self
            .registry
            .send("get_msg", serde_json::json!({ "message_id": message_id }))
            .await?;
        ReferencedMessage::from_data(&data)
    }
}
