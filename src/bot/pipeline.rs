//! 动作流水线：每个被放行的事件恰好产生一个出站动作（内容分支不含 Markdown 时不产生）
//!
//! - **直接对话**：清理 @ 与回复标签 → 解析引用 → 组装提示 → 调用 LLM → 检测 Markdown → 发送
//! - **内容分支**：清理回复标签 → 检测 Markdown → 渲染成图片发送，否则静默跳过
//!
//! 下游错误（LLM、渲染、网关）都在这里降级为兜底回复或日志，不再向上传播。

use std::sync::Arc;

use crate::cq;
use crate::gateway::{GatewayApi, InboundEvent, OutboundAction};
use crate::llm::{CompletionProvider, PromptBundle};
use crate::markdown::{self, MarkdownRenderer};

use super::classifier::{Admitted, Route};
use super::quote::QuoteResolver;

/// 一次流水线运行的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// 已发出一个动作；`delivered` 为网关是否确认
    Emitted {
        action: OutboundAction,
        delivered: bool,
    },
    Skipped(SkipReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// 内容分支里的普通聊天
    NotMarkdown,
}

/// 兜底文案
#[derive(Debug, Clone)]
pub struct FallbackTexts {
    /// LLM 失败时
    pub apology: String,
    /// 渲染失败时
    pub render_failure: String,
}

impl Default for FallbackTexts {
    fn default() -> Self {
        Self {
            apology: "抱歉，我现在有点忙，稍后再试吧 😕".to_string(),
            render_failure: "处理 Markdown 消息时出错了 😕".to_string(),
        }
    }
}

pub struct ActionPipeline {
    api: Arc<dyn GatewayApi>,
    provider: Arc<dyn CompletionProvider>,
    renderer: Arc<dyn MarkdownRenderer>,
    quotes: QuoteResolver,
    texts: FallbackTexts,
}

impl ActionPipeline {
    pub fn new(
        api: Arc<dyn GatewayApi>,
        provider: Arc<dyn CompletionProvider>,
        renderer: Arc<dyn MarkdownRenderer>,
        quotes: QuoteResolver,
        texts: FallbackTexts,
    ) -> Self {
        Self {
            api,
            provider,
            renderer,
            quotes,
            texts,
        }
    }

    pub async fn handle(&self, admitted: Admitted) -> Outcome {
        match admitted.route {
            Route::DirectAddress => self.run_direct(admitted.group_id, &admitted.event).await,
            Route::Content => self.run_content(admitted.group_id, &admitted.event).await,
        }
    }

    /// 直接对话分支
    pub async fn run_direct(&self, group_id: i64, event: &InboundEvent) -> Outcome {
        let message_id = event.message_id;
        let (text, _) = cq::extract_mention(&event.raw_text, event.self_id);
        let (text, reply_id) = cq::extract_reply(&text);

        tracing::info!(
            group_id,
            message_id,
            user = event.sender.display_name(),
            "收到直接对话: {}",
            text
        );

        let quote = match reply_id {
            Some(id) => Some(self.quotes.resolve(id).await),
            None => None,
        };

        let question = if text.is_empty() { "你好".to_string() } else { text };
        let mut builder = PromptBundle::builder();
        let mut attachment = None;
        match quote {
            Some(q) => {
                builder = builder.text(format!("{}\n{}", q.header, question));
                attachment = q.attachment;
            }
            None => builder = builder.text(question),
        }
        if let Some((mime, bytes)) = attachment {
            builder = builder.binary(mime, bytes);
        }
        let prompt = builder.build();

        let action = match self.provider.complete(prompt).await {
            Ok(answer) => {
                let detection = markdown::detect(&answer);
                if detection.is_markdown() {
                    tracing::info!(group_id, features = %detection.describe(), "回答含 Markdown，渲染为图片");
                    self.render_or_fallback(&answer, Some(message_id)).await
                } else {
                    OutboundAction::SendText {
                        text: answer,
                        reply_to: Some(message_id),
                    }
                }
            }
            Err(e) => {
                tracing::error!(group_id, message_id, error = %e, "LLM 调用失败");
                OutboundAction::SendText {
                    text: self.texts.apology.clone(),
                    reply_to: Some(message_id),
                }
            }
        };

        self.emit(group_id, action).await
    }

    /// 内容分支
    pub async fn run_content(&self, group_id: i64, event: &InboundEvent) -> Outcome {
        let (clean, reply_id) = cq::extract_reply(&event.raw_text);

        let detection = markdown::detect(&clean);
        if !detection.is_markdown() {
            tracing::debug!(group_id, message_id = event.message_id, "消息不包含 Markdown 语法，跳过处理");
            return Outcome::Skipped(SkipReason::NotMarkdown);
        }

        tracing::info!(
            group_id,
            message_id = event.message_id,
            reply_to = ?reply_id,
            features = %detection.describe(),
            "检测到 Markdown 特性"
        );

        let action = self.render_or_fallback(&clean, reply_id).await;
        self.emit(group_id, action).await
    }

    async fn render_or_fallback(&self, text: &str, reply_to: Option<i64>) -> OutboundAction {
        match self.renderer.render(text).await {
            Ok(bytes) => OutboundAction::SendImage {
                bytes,
                filename: format!("markdown_{}.png", chrono::Utc::now().timestamp_millis()),
                reply_to,
            },
            Err(e) => {
                tracing::error!(error = %e, "渲染 Markdown 失败");
                OutboundAction::SendText {
                    text: self.texts.render_failure.clone(),
                    reply_to,
                }
            }
        }
    }

    async fn emit(&self, group_id: i64, action: OutboundAction) -> Outcome {
        let delivered = match self.api.send_action(group_id, &action).await {
            Ok(message_id) => {
                tracing::info!(group_id, message_id, "消息发送成功");
                true
            }
            Err(e) => {
                tracing::error!(group_id, error = %e, "消息发送失败");
                false
            }
        };
        Outcome::Emitted { action, delivered }
    }
}
