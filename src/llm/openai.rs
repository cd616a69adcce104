//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（默认 Gemini 的兼容端点）；
//! 内联二进制以 data URI 的 image_url 片段发送，支持 HTTP 代理。

use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestMessage, ChatCompletionRequestMessageContentPartImage,
    ChatCompletionRequestMessageContentPartText, ChatCompletionRequestSystemMessageArgs,
    ChatCompletionRequestUserMessage, ChatCompletionRequestUserMessageContent,
    ChatCompletionRequestUserMessageContentPart, CreateChatCompletionRequestArgs, ImageUrl,
};
use async_openai::Client;
use async_trait::async_trait;
use base64::Engine as _;

use super::traits::{CompletionProvider, PromptBundle, PromptPart};
use crate::core::ProviderError;

/// OpenAI 兼容客户端
pub struct OpenAiProvider {
    client: Client<OpenAIConfig>,
    model: String,
    system_prompt: Option<String>,
}

impl OpenAiProvider {
    pub fn new(
        base_url: Option<&str>,
        model: &str,
        api_key: Option<&str>,
        proxy: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("GEMINI_API_KEY").ok())
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| {
                tracing::warn!("未配置 LLM API Key，补全请求将会失败");
                String::new()
            });

        let mut config = OpenAIConfig::new().with_api_key(api_key);
        if let Some(url) = base_url {
            config = config.with_api_base(url);
        }

        let mut http = reqwest::Client::builder().timeout(timeout);
        if let Some(proxy) = proxy.filter(|p| !p.is_empty()) {
            let proxy = reqwest::Proxy::all(proxy)
                .map_err(|e| ProviderError::Request(format!("代理配置无效: {}", e)))?;
            http = http.proxy(proxy);
            tracing::info!("LLM 请求使用代理");
        }
        let http = http
            .build()
            .map_err(|e| ProviderError::Request(e.to_string()))?;

        Ok(Self {
            client: Client::with_config(config).with_http_client(http),
            model: model.to_string(),
            system_prompt: None,
        })
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        let prompt = prompt.into();
        self.system_prompt = (!prompt.trim().is_empty()).then_some(prompt);
        self
    }

    fn to_openai_messages(
        &self,
        prompt: &PromptBundle,
    ) -> Result<Vec<ChatCompletionRequestMessage>, ProviderError> {
        let mut messages = Vec::with_capacity(2);

        if let Some(system) = &self.system_prompt {
            messages.push(ChatCompletionRequestMessage::System(
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(system.clone())
                    .build()
                    .map_err(|e| ProviderError::Request(e.to_string()))?,
            ));
        }

        let parts = prompt
            .parts()
            .iter()
            .map(|part| match part {
                PromptPart::Text(text) => ChatCompletionRequestUserMessageContentPart::Text(
                    ChatCompletionRequestMessageContentPartText { text: text.clone() },
                ),
                PromptPart::InlineBinary { mime_type, data } => {
                    let encoded = base64::engine::general_purpose::STANDARD.encode(data);
                    ChatCompletionRequestUserMessageContentPart::ImageUrl(
                        ChatCompletionRequestMessageContentPartImage {
                            image_url: ImageUrl {
                                url: format!("data:{};base64,{}", mime_type, encoded),
                                detail: None,
                            },
                        },
                    )
                }
            })
            .collect();

        messages.push(ChatCompletionRequestMessage::User(
            ChatCompletionRequestUserMessage {
                content: ChatCompletionRequestUserMessageContent::Array(parts),
                name: None,
            },
        ));
        Ok(messages)
    }
}

#[async_trait]
impl CompletionProvider for OpenAiProvider {
    async fn complete(&self, prompt: PromptBundle) -> Result<String, ProviderError> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(self.to_openai_messages(&prompt)?)
            .build()
            .map_err(|e| ProviderError::Request(e.to_string()))?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| ProviderError::Request(e.to_string()))?;

        if let Some(usage) = &response.usage {
            tracing::debug!(
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                "LLM token 使用"
            );
        }

        let content = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();

        if content.trim().is_empty() {
            return Err(ProviderError::EmptyResponse);
        }
        Ok(content)
    }
}
