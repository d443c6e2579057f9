//! Provider 路由：按请求的 provider 名分发到已配置的客户端

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::{ChatRequest, LlmClient, OpenAiClient};
use crate::config::LlmSection;

pub struct ProviderRouter {
    clients: HashMap<String, Arc<dyn LlmClient>>,
    default_provider: String,
}

impl ProviderRouter {
    pub fn new(default_provider: impl Into<String>) -> Self {
        Self {
            clients: HashMap::new(),
            default_provider: default_provider.into(),
        }
    }

    pub fn with_client(mut self, provider: impl Into<String>, client: Arc<dyn LlmClient>) -> Self {
        self.clients.insert(provider.into(), client);
        self
    }

    /// 为 [llm.providers.*] 中的每一项创建 OpenAI 兼容客户端
    pub fn from_config(llm: &LlmSection) -> Self {
        let mut router = Self::new(llm.default_provider.clone());
        for (name, provider) in &llm.providers {
            let api_key = provider.api_key.clone().or_else(|| {
                provider
                    .api_key_env
                    .as_deref()
                    .and_then(|var| std::env::var(var).ok())
            });
            tracing::debug!(
                provider = %name,
                base_url = provider.base_url.as_deref().unwrap_or("(default)"),
                has_key = api_key.is_some(),
                "register llm provider"
            );
            let client = OpenAiClient::new(provider.base_url.as_deref(), api_key.as_deref());
            router = router.with_client(name.clone(), Arc::new(client));
        }
        router
    }

    pub fn providers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clients.keys().cloned().collect();
        names.sort();
        names
    }

    fn resolve(&self, provider: &str) -> Result<&Arc<dyn LlmClient>, String> {
        let name = if provider.is_empty() {
            self.default_provider.as_str()
        } else {
            provider
        };
        self.clients
            .get(name)
            .ok_or_else(|| format!("unknown model provider '{name}'"))
    }
}

#[async_trait]
impl LlmClient for ProviderRouter {
    async fn complete(&self, request: &ChatRequest) -> Result<String, String> {
        self.resolve(&request.provider)?.complete(request).await
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.clients.values().fold((0, 0, 0), |acc, c| {
            let (p, c2, t) = c.token_usage();
            (acc.0 + p, acc.1 + c2, acc.2 + t)
        })
    }
}
