use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use chatrelay_types::{ModelInfo, Part, ProviderInfo, Role, ToolInvocation, ToolSchema, Turn};

mod gemini;

pub use gemini::GeminiProvider;

pub type ChunkStream = Pin<Box<dyn Stream<Item = anyhow::Result<StreamChunk>> + Send>>;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub url: Option<String>,
    pub default_model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    pub default_provider: Option<String>,
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
}

/// One round-trip worth of input for a generative model.
#[derive(Debug, Clone, Default)]
pub struct GenerateRequest {
    pub system_instruction: Option<String>,
    pub contents: Vec<Turn>,
    pub tools: Vec<ToolSchema>,
}

impl GenerateRequest {
    pub fn from_prompt(prompt: &str) -> Self {
        Self {
            contents: vec![Turn::user_text(prompt)],
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ModelResponse {
    pub parts: Vec<Part>,
    pub finish_reason: Option<String>,
    pub usage: Option<TokenUsage>,
}

impl ModelResponse {
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(Part::as_text)
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn function_calls(&self) -> Vec<&ToolInvocation> {
        self.parts
            .iter()
            .filter_map(|part| match part {
                Part::FunctionCall(call) => Some(call),
                _ => None,
            })
            .collect()
    }

    pub fn is_safety_blocked(&self) -> bool {
        self.finish_reason
            .as_deref()
            .map(|r| r.eq_ignore_ascii_case("SAFETY"))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone)]
pub enum StreamChunk {
    TextDelta(String),
    ToolCall(ToolInvocation),
    Done {
        finish_reason: String,
        usage: Option<TokenUsage>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn info(&self) -> ProviderInfo;

    async fn generate(
        &self,
        request: GenerateRequest,
        model_override: Option<&str>,
        cancel: CancellationToken,
    ) -> anyhow::Result<ModelResponse>;

    async fn stream(
        &self,
        request: GenerateRequest,
        model_override: Option<&str>,
        cancel: CancellationToken,
    ) -> anyhow::Result<ChunkStream> {
        let response = self.generate(request, model_override, cancel).await?;
        let mut chunks = Vec::new();
        for part in response.parts {
            match part {
                Part::Text(text) if !text.is_empty() => chunks.push(Ok(StreamChunk::TextDelta(text))),
                Part::FunctionCall(call) => chunks.push(Ok(StreamChunk::ToolCall(call))),
                _ => {}
            }
        }
        chunks.push(Ok(StreamChunk::Done {
            finish_reason: response.finish_reason.unwrap_or_else(|| "stop".to_string()),
            usage: response.usage,
        }));
        Ok(Box::pin(futures::stream::iter(chunks)))
    }
}

#[derive(Clone)]
pub struct ProviderRegistry {
    providers: Arc<RwLock<Vec<Arc<dyn Provider>>>>,
    default_provider: Arc<RwLock<Option<String>>>,
}

impl ProviderRegistry {
    pub fn new(config: AppConfig) -> Self {
        let providers = build_providers(&config);
        Self {
            providers: Arc::new(RwLock::new(providers)),
            default_provider: Arc::new(RwLock::new(config.default_provider)),
        }
    }

    pub fn from_providers(providers: Vec<Arc<dyn Provider>>, default_provider: Option<String>) -> Self {
        Self {
            providers: Arc::new(RwLock::new(providers)),
            default_provider: Arc::new(RwLock::new(default_provider)),
        }
    }

    pub async fn list(&self) -> Vec<ProviderInfo> {
        self.providers
            .read()
            .await
            .iter()
            .map(|p| p.info())
            .collect()
    }

    pub async fn generate_for_provider(
        &self,
        provider_id: Option<&str>,
        model_id: Option<&str>,
        request: GenerateRequest,
        cancel: CancellationToken,
    ) -> anyhow::Result<ModelResponse> {
        let provider = self.select_provider(provider_id).await?;
        provider.generate(request, model_id, cancel).await
    }

    pub async fn stream_for_provider(
        &self,
        provider_id: Option<&str>,
        model_id: Option<&str>,
        request: GenerateRequest,
        cancel: CancellationToken,
    ) -> anyhow::Result<ChunkStream> {
        let provider = self.select_provider(provider_id).await?;
        provider.stream(request, model_id, cancel).await
    }

    /// Resolved provider and model ids, for logging.
    pub async fn describe(&self, provider_id: Option<&str>) -> Option<(String, String)> {
        let provider = self.select_provider(provider_id).await.ok()?;
        let info = provider.info();
        let model = info.models.first().map(|m| m.id.clone()).unwrap_or_default();
        Some((info.id, model))
    }

    async fn select_provider(&self, provider_id: Option<&str>) -> anyhow::Result<Arc<dyn Provider>> {
        let providers = self.providers.read().await;
        let available = providers.iter().map(|p| p.info().id).collect::<Vec<_>>();

        if let Some(id) = provider_id {
            if let Some(provider) = providers.iter().find(|p| p.info().id == id) {
                return Ok(provider.clone());
            }
            anyhow::bail!(
                "provider `{}` is not configured. configured providers: {}",
                id,
                available.join(", ")
            );
        };

        let configured_default = self.default_provider.read().await.clone();
        if let Some(default_id) = configured_default {
            if let Some(provider) = providers.iter().find(|p| p.info().id == default_id) {
                return Ok(provider.clone());
            }
        };

        let Some(provider) = providers.first() else {
            anyhow::bail!("No provider configured.");
        };
        Ok(provider.clone())
    }
}

fn build_providers(config: &AppConfig) -> Vec<Arc<dyn Provider>> {
    let mut providers: Vec<Arc<dyn Provider>> = Vec::new();
    let client = build_client(config.request_timeout_secs);

    let gemini_entry = config
        .providers
        .get("gemini")
        .or_else(|| config.providers.get("google"));
    if let Some(entry) = gemini_entry {
        providers.push(Arc::new(GeminiProvider::new(
            entry
                .api_key
                .as_deref()
                .filter(|key| !is_placeholder_api_key(key))
                .map(|key| key.to_string())
                .or_else(env_gemini_api_key),
            entry.url.as_deref(),
            entry.default_model.as_deref(),
            client.clone(),
        )));
    }

    if providers.is_empty() {
        providers.push(Arc::new(LocalEchoProvider));
    }
    providers
}

fn build_client(timeout_secs: Option<u64>) -> Client {
    let timeout = Duration::from_secs(timeout_secs.filter(|s| *s > 0).unwrap_or(60));
    Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|_| Client::new())
}

pub fn is_placeholder_api_key(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.is_empty()
        || trimmed.eq_ignore_ascii_case("x")
        || trimmed.eq_ignore_ascii_case("placeholder")
}

fn env_gemini_api_key() -> Option<String> {
    ["GEMINI_API_KEY", "GOOGLE_API_KEY"]
        .iter()
        .find_map(|name| std::env::var(name).ok().filter(|v| !v.trim().is_empty()))
}

/// Fallback provider used when nothing is configured; answers with the latest user text.
pub struct LocalEchoProvider;

#[async_trait]
impl Provider for LocalEchoProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: "local".to_string(),
            name: "Local Echo".to_string(),
            models: vec![ModelInfo {
                id: "echo-1".to_string(),
                provider_id: "local".to_string(),
                display_name: "Echo Model".to_string(),
                context_window: 8192,
            }],
        }
    }

    async fn generate(
        &self,
        request: GenerateRequest,
        _model_override: Option<&str>,
        _cancel: CancellationToken,
    ) -> anyhow::Result<ModelResponse> {
        let prompt = request
            .contents
            .iter()
            .rev()
            .find(|turn| turn.role == Role::User)
            .map(Turn::text)
            .unwrap_or_default();
        Ok(ModelResponse {
            parts: vec![Part::text(format!("Echo: {prompt}"))],
            finish_reason: Some("STOP".to_string()),
            usage: None,
        })
    }
}

pub(crate) fn normalize_plain_base(input: &str) -> String {
    input.trim_end_matches('/').to_string()
}

pub(crate) fn truncate_for_error(input: &str, max_len: usize) -> String {
    if input.chars().count() <= max_len {
        input.to_string()
    } else {
        format!("{}...", input.chars().take(max_len).collect::<String>())
    }
}
