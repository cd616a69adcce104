//! LLM 层：补全服务抽象与实现（OpenAI 兼容 / Mock）

pub mod mock;
pub mod openai;
pub mod traits;

pub use mock::MockProvider;
pub use openai::OpenAiProvider;
pub use traits::{CompletionProvider, PromptBuilder, PromptBundle, PromptPart};
