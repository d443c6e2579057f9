//! 决策后端层：客户端抽象与实现（OpenAI 兼容 / Provider 路由 / 脚本化 Mock）

pub mod mock;
pub mod openai;
pub mod router;
pub mod traits;

pub use mock::ScriptedLlmClient;
pub use openai::{OpenAiClient, TokenUsage};
pub use router::ProviderRouter;
pub use traits::{
    ChatMessage, ChatRequest, ContentPart, LlmClient, RetryingLlmClient, Role, SamplingParams,
};
