//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url），模型名取自请求。
//! 图片片段统一转成 data URL：本地文件读出后 base64 编码，data/http URL 原样透传。

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
    CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;
use base64::Engine;
use serde_json::json;

use crate::llm::{ChatMessage, ChatRequest, ContentPart, LlmClient, Role};

/// Token 使用统计（累计值）
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Arc<AtomicU64>,
    pub completion_tokens: Arc<AtomicU64>,
    pub total_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    pub fn add(&self, prompt: u64, completion: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
        self.total_tokens.fetch_add(prompt + completion, Ordering::Relaxed);
    }

    pub fn get(&self) -> (u64, u64, u64) {
        (
            self.prompt_tokens.load(Ordering::Relaxed),
            self.completion_tokens.load(Ordering::Relaxed),
            self.total_tokens.load(Ordering::Relaxed),
        )
    }
}

pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    pub usage: TokenUsage,
}

impl OpenAiClient {
    pub fn new(base_url: Option<&str>, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = if let Some(url) = base_url {
            OpenAIConfig::new().with_api_base(url).with_api_key(api_key)
        } else {
            OpenAIConfig::new().with_api_key(api_key)
        };

        Self {
            client: Client::with_config(config),
            usage: TokenUsage::default(),
        }
    }

    async fn to_openai_message(&self, m: &ChatMessage) -> Result<ChatCompletionRequestMessage, String> {
        if m.role == Role::System {
            return ChatCompletionRequestSystemMessageArgs::default()
                .content(m.text())
                .build()
                .map(ChatCompletionRequestMessage::System)
                .map_err(|e| e.to_string());
        }
        let mut content = Vec::with_capacity(m.parts.len());
        for part in &m.parts {
            match part {
                ContentPart::Text { text } => content.push(json!({"type": "text", "text": text})),
                ContentPart::Image { url } => {
                    let url = image_to_url(url).await?;
                    content.push(json!({"type": "image_url", "image_url": {"url": url}}));
                }
            }
        }
        let role = match m.role {
            Role::Assistant => "assistant",
            _ => "user",
        };
        // assistant 消息不支持图片片段，只保留文本
        let value = if m.role == Role::Assistant {
            json!({"role": role, "content": m.text()})
        } else {
            json!({"role": role, "content": content})
        };
        serde_json::from_value(value).map_err(|e| format!("build message: {e}"))
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(&self, request: &ChatRequest) -> Result<String, String> {
        let mut messages = Vec::with_capacity(request.messages.len());
        for m in &request.messages {
            messages.push(self.to_openai_message(m).await?);
        }

        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(&request.model).messages(messages);
        if let Some(t) = request.params.temperature {
            args.temperature(t);
        }
        if let Some(p) = request.params.top_p {
            args.top_p(p);
        }
        if let Some(n) = request.params.max_tokens {
            args.max_completion_tokens(n);
        }
        let body = args.build().map_err(|e| e.to_string())?;

        let response = self
            .client
            .chat()
            .create(body)
            .await
            .map_err(|e| e.to_string())?;

        if let Some(usage) = &response.usage {
            self.usage
                .add(usage.prompt_tokens as u64, usage.completion_tokens as u64);
        }

        let content = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();
        Ok(content)
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }
}

/// data / http(s) URL 透传，其余按本地文件读出并编码为 data URL
pub async fn image_to_url(reference: &str) -> Result<String, String> {
    if reference.starts_with("data:")
        || reference.starts_with("http://")
        || reference.starts_with("https://")
    {
        return Ok(reference.to_string());
    }
    let path = Path::new(reference.strip_prefix("file://").unwrap_or(reference));
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| format!("read image {}: {}", path.display(), e))?;
    Ok(data_url(mime_for(path), &bytes))
}

pub fn data_url(mime: &str, bytes: &[u8]) -> String {
    format!(
        "data:{};base64,{}",
        mime,
        base64::engine::general_purpose::STANDARD.encode(bytes)
    )
}

fn mime_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        _ => "image/png",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_image_reference_passthrough() {
        assert_eq!(
            image_to_url("https://example.com/a.png").await.unwrap(),
            "https://example.com/a.png"
        );
        assert_eq!(
            image_to_url("data:image/png;base64,AA==").await.unwrap(),
            "data:image/png;base64,AA=="
        );
    }

    #[tokio::test]
    async fn test_local_file_becomes_data_url() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shot.jpg");
        std::fs::write(&path, b"abc").unwrap();
        let url = image_to_url(path.to_str().unwrap()).await.unwrap();
        assert_eq!(url, "data:image/jpeg;base64,YWJj");
        assert!(image_to_url("/definitely/missing.png").await.is_err());
    }
}
