use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use chatrelay_providers::{GenerateRequest, ModelResponse, Provider, ProviderRegistry};
use chatrelay_tools::{Tool, ToolRegistry};
use chatrelay_types::{ModelInfo, Part, ProviderInfo, ToolInvocation, ToolResult, ToolSchema};

/// Replays canned responses and records every request it receives.
pub(crate) struct ScriptedProvider {
    script: Mutex<VecDeque<anyhow::Result<ModelResponse>>>,
    pub(crate) seen: Arc<Mutex<Vec<GenerateRequest>>>,
    repeat: Option<ModelResponse>,
}

impl ScriptedProvider {
    pub(crate) fn new(script: Vec<anyhow::Result<ModelResponse>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            seen: Arc::new(Mutex::new(Vec::new())),
            repeat: None,
        }
    }

    pub(crate) fn always(response: ModelResponse) -> Self {
        Self {
            repeat: Some(response),
            ..Self::new(Vec::new())
        }
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: "scripted".to_string(),
            name: "Scripted".to_string(),
            models: vec![ModelInfo {
                id: "scripted-1".to_string(),
                provider_id: "scripted".to_string(),
                display_name: "Scripted".to_string(),
                context_window: 1024,
            }],
        }
    }

    async fn generate(
        &self,
        request: GenerateRequest,
        _model_override: Option<&str>,
        _cancel: CancellationToken,
    ) -> anyhow::Result<ModelResponse> {
        self.seen.lock().unwrap().push(request);
        if let Some(next) = self.script.lock().unwrap().pop_front() {
            return next;
        }
        match &self.repeat {
            Some(response) => Ok(response.clone()),
            None => anyhow::bail!("script exhausted"),
        }
    }
}

pub(crate) struct RecordingTool {
    pub(crate) name: &'static str,
    pub(crate) calls: Arc<AtomicUsize>,
    pub(crate) result: Value,
}

#[async_trait]
impl Tool for RecordingTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: self.name.to_string(),
            description: "test tool".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {"query": {"type": "string"}},
                "required": ["query"]
            }),
        }
    }

    async fn execute(&self, _args: Map<String, Value>) -> anyhow::Result<ToolResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ToolResult::success(self.result.clone()))
    }
}

pub(crate) fn text(value: &str) -> anyhow::Result<ModelResponse> {
    Ok(ModelResponse {
        parts: vec![Part::text(value)],
        finish_reason: Some("STOP".to_string()),
        usage: None,
    })
}

pub(crate) fn call(name: &str, args: Value) -> ModelResponse {
    let args = match args {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    ModelResponse {
        parts: vec![Part::FunctionCall(ToolInvocation::new(name, args))],
        finish_reason: Some("STOP".to_string()),
        usage: None,
    }
}

pub(crate) struct Fixture {
    pub(crate) providers: ProviderRegistry,
    pub(crate) tools: ToolRegistry,
    pub(crate) seen: Arc<Mutex<Vec<GenerateRequest>>>,
    pub(crate) tool_calls: Arc<AtomicUsize>,
}

/// Registry pair with the scripted provider and a recording `web_search`.
pub(crate) async fn fixture(provider: ScriptedProvider) -> Fixture {
    let seen = provider.seen.clone();
    let providers = ProviderRegistry::from_providers(vec![Arc::new(provider)], None);
    let tools = ToolRegistry::empty();
    let tool_calls = Arc::new(AtomicUsize::new(0));
    tools
        .register(Arc::new(RecordingTool {
            name: "web_search",
            calls: tool_calls.clone(),
            result: json!({"results": [{"title": "Gold", "snippet": "$2,400/oz", "link": "https://example.com"}]}),
        }))
        .await;
    Fixture {
        providers,
        tools,
        seen,
        tool_calls,
    }
}
