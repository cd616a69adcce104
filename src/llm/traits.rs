//! 补全服务抽象
//!
//! 流水线只认 [`CompletionProvider`]：输入有序的提示片段（文本 / 内联二进制），输出一段文本。

use async_trait::async_trait;

use crate::core::ProviderError;

/// 提示片段
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptPart {
    Text(String),
    InlineBinary { mime_type: String, data: Vec<u8> },
}

/// 一次调用的完整提示，组装完成后不可修改
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromptBundle {
    parts: Vec<PromptPart>,
}

impl PromptBundle {
    pub fn builder() -> PromptBuilder {
        PromptBuilder::default()
    }

    pub fn parts(&self) -> &[PromptPart] {
        &self.parts
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// 所有文本片段拼接（日志 / Mock 用）
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                PromptPart::Text(t) => Some(t.as_str()),
                PromptPart::InlineBinary { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn binary_count(&self) -> usize {
        self.parts
            .iter()
            .filter(|p| matches!(p, PromptPart::InlineBinary { .. }))
            .count()
    }
}

#[derive(Debug, Default)]
pub struct PromptBuilder {
    parts: Vec<PromptPart>,
}

impl PromptBuilder {
    /// 追加文本片段；空文本忽略
    pub fn text(mut self, text: impl Into<String>) -> Self {
        let text = text.into();
        if !text.is_empty() {
            self.parts.push(PromptPart::Text(text));
        }
        self
    }

    pub fn binary(mut self, mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        self.parts.push(PromptPart::InlineBinary {
            mime_type: mime_type.into(),
            data,
        });
        self
    }

    pub fn build(self) -> PromptBundle {
        PromptBundle { parts: self.parts }
    }
}

/// 补全服务：空结果返回 `ProviderError::EmptyResponse`
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete(&self, prompt: PromptBundle) -> Result<String, ProviderError>;
}
