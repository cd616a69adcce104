//! Mock 补全服务（本地调试用，无需 API）
//!
//! 回显提示中的文本片段。

use async_trait::async_trait;

use super::traits::{CompletionProvider, PromptBundle};
use crate::core::ProviderError;

#[derive(Debug, Default)]
pub struct MockProvider;

#[async_trait]
impl CompletionProvider for MockProvider {
    async fn complete(&self, prompt: PromptBundle) -> Result<String, ProviderError> {
        let text = prompt.text();
        if text.trim().is_empty() {
            return Err(ProviderError::EmptyResponse);
        }
        Ok(format!("Echo from Mock: {}", text))
    }
}
