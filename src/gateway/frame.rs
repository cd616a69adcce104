//! NapCat（OneBot 11）帧格式
//!
//! 入站文本帧要么是事件（带 `post_type`），要么是 API 响应（带 `echo`、不带 `post_type`）。
//! 响应在这里就归一化为 `Result<Value, GatewayError>`，下游不再关心 status / retcode / msg 等别名字段。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::GatewayError;

/// 事件类型（post_type）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Message,
    Notice,
    Request,
    #[serde(rename = "meta_event")]
    Meta,
    #[serde(other)]
    Unknown,
}

/// 发送者信息
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SenderInfo {
    #[serde(default)]
    pub user_id: Option<i64>,
    #[serde(default)]
    pub nickname: String,
    /// 群名片
    #[serde(default)]
    pub card: Option<String>,
    /// owner / admin / member
    #[serde(default)]
    pub role: Option<String>,
}

impl SenderInfo {
    /// 优先群名片，其次昵称
    pub fn display_name(&self) -> &str {
        match self.card.as_deref() {
            Some(card) if !card.is_empty() => card,
            _ => &self.nickname,
        }
    }
}

/// 入站事件（只读，处理完即丢弃）
#[derive(Debug, Clone, Deserialize)]
pub struct InboundEvent {
    #[serde(rename = "post_type")]
    pub kind: EventKind,
    /// group / private
    #[serde(default)]
    pub message_type: Option<String>,
    #[serde(default)]
    pub group_id: Option<i64>,
    #[serde(default)]
    pub user_id: i64,
    #[serde(default)]
    pub self_id: i64,
    #[serde(default)]
    pub message_id: i64,
    #[serde(default, rename = "raw_message")]
    pub raw_text: String,
    #[serde(default)]
    pub sender: SenderInfo,
}

impl InboundEvent {
    /// 群消息事件时返回群号
    pub fn group_message_id(&self) -> Option<i64> {
        if self.kind == EventKind::Message && self.message_type.as_deref() == Some("group") {
            self.group_id
        } else {
            None
        }
    }
}

/// 出站 RPC 帧：`{action, params, echo}`
#[derive(Debug, Clone, Serialize)]
pub struct RequestFrame<'a> {
    pub action: &'a str,
    pub params: Value,
    pub echo: &'a str,
}

/// 网关原始响应（字段别名众多，只在本模块内部使用）
#[derive(Debug, Deserialize)]
struct RawResponse {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    retcode: Option<i64>,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    wording: Option<String>,
}

impl RawResponse {
    fn into_result(self) -> Result<Value, GatewayError> {
        if self.status.as_deref() == Some("ok") || self.retcode == Some(0) {
            return Ok(self.data);
        }

        let reason = [self.msg, self.message, self.wording]
            .into_iter()
            .flatten()
            .find(|s| !s.is_empty())
            .unwrap_or_else(|| {
                let status = self
                    .status
                    .or_else(|| self.retcode.map(|c| c.to_string()))
                    .unwrap_or_else(|| "unknown".to_string());
                format!("请求失败，状态: {}", status)
            });
        Err(GatewayError::RemoteError(reason))
    }
}

/// 归一化后的 RPC 响应
#[derive(Debug, Clone)]
pub struct RpcResponse {
    pub echo: String,
    pub result: Result<Value, GatewayError>,
}

/// 一帧入站数据的分类结果
#[derive(Debug, Clone)]
pub enum Frame {
    Response(RpcResponse),
    Event(Box<InboundEvent>),
    /// 既非事件也非响应（如无 echo 的响应），忽略
    Other,
}

/// 解析一帧文本
pub fn parse_frame(text: &str) -> Result<Frame, GatewayError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| GatewayError::MalformedFrame(e.to_string()))?;
    let Some(obj) = value.as_object() else {
        return Err(GatewayError::MalformedFrame("顶层不是 JSON 对象".to_string()));
    };

    if obj.contains_key("post_type") {
        let event: InboundEvent = serde_json::from_value(value)
            .map_err(|e| GatewayError::MalformedFrame(e.to_string()))?;
        return Ok(Frame::Event(Box::new(event)));
    }

    let echo = match obj.get("echo") {
        None | Some(Value::Null) => return Ok(Frame::Other),
        Some(Value::String(s)) if s.is_empty() => return Ok(Frame::Other),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    };

    let raw: RawResponse = serde_json::from_value(value)
        .map_err(|e| GatewayError::MalformedFrame(e.to_string()))?;
    Ok(Frame::Response(RpcResponse {
        echo,
        result: raw.into_result(),
    }))
}
