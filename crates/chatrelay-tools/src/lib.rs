use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use chatrelay_types::{ToolInvocation, ToolResult, ToolSchema};

mod fetch;
mod image;
mod search;
mod transcript;

pub use fetch::{html_to_text, FetchWebpageTool, PageFetcher};
pub use image::ImageClient;
pub use search::{format_hits, SearchClient, SearchHit, WebSearchTool};
pub use transcript::{youtube_video_id, TranscriptFetcher, YoutubeTranscriptTool};

#[async_trait]
pub trait Tool: Send + Sync {
    fn schema(&self) -> ToolSchema;
    async fn execute(&self, args: Map<String, Value>) -> anyhow::Result<ToolResult>;
    async fn execute_with_cancel(
        &self,
        args: Map<String, Value>,
        _cancel: CancellationToken,
    ) -> anyhow::Result<ToolResult> {
        self.execute(args).await
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SearchConfig {
    pub api_key: Option<String>,
    pub url: Option<String>,
    pub max_results: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ImageConfig {
    pub api_key: Option<String>,
    pub url: Option<String>,
    pub engine: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub steps: Option<u32>,
    pub cfg_scale: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ToolsConfig {
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub image: ImageConfig,
    pub request_timeout_secs: Option<u64>,
}

impl ToolsConfig {
    pub fn http_client(&self) -> Client {
        let timeout = Duration::from_secs(self.request_timeout_secs.filter(|s| *s > 0).unwrap_or(60));
        Client::builder()
            .timeout(timeout)
            .user_agent(concat!("chatrelay/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| Client::new())
    }
}

/// Outcome of looking a capability up and running it.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    Completed(ToolResult),
    UnknownTool,
}

#[derive(Clone)]
pub struct ToolRegistry {
    tools: Arc<RwLock<HashMap<String, Arc<dyn Tool>>>>,
}

impl ToolRegistry {
    pub fn new(config: &ToolsConfig) -> Self {
        let client = config.http_client();
        let mut map: HashMap<String, Arc<dyn Tool>> = HashMap::new();
        map.insert(
            "web_search".to_string(),
            Arc::new(WebSearchTool::new(SearchClient::new(
                client.clone(),
                &config.search,
            ))),
        );
        map.insert(
            "fetch_webpage".to_string(),
            Arc::new(FetchWebpageTool::new(PageFetcher::new(client.clone()))),
        );
        map.insert(
            "youtube_transcript".to_string(),
            Arc::new(YoutubeTranscriptTool::new(TranscriptFetcher::new(client))),
        );
        Self {
            tools: Arc::new(RwLock::new(map)),
        }
    }

    pub fn empty() -> Self {
        Self {
            tools: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.schema().name;
        self.tools.write().await.insert(name, tool);
    }

    pub async fn list(&self) -> Vec<ToolSchema> {
        let mut dedup: HashMap<String, ToolSchema> = HashMap::new();
        for schema in self.tools.read().await.values().map(|t| t.schema()) {
            dedup.entry(schema.name.clone()).or_insert(schema);
        }
        let mut schemas = dedup.into_values().collect::<Vec<_>>();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    pub async fn lookup(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().await.get(name).cloned()
    }

    /// Runs a registered capability. Executor errors, missing arguments and
    /// cancellation all come back as failure payloads; only an unknown name
    /// is reported separately.
    pub async fn dispatch(&self, invocation: &ToolInvocation, cancel: CancellationToken) -> Dispatch {
        let Some(tool) = self.lookup(&invocation.name).await else {
            return Dispatch::UnknownTool;
        };

        let missing = tool.schema().missing_params(&invocation.args);
        if !missing.is_empty() {
            tracing::warn!(
                "tool `{}` called without required arguments: {}",
                invocation.name,
                missing.join(", ")
            );
            return Dispatch::Completed(ToolResult::failure(format!(
                "missing required argument(s): {}",
                missing.join(", ")
            )));
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(anyhow::anyhow!("tool execution cancelled")),
            result = tool.execute_with_cancel(invocation.args.clone(), cancel.clone()) => result,
        };
        match result {
            Ok(result) => Dispatch::Completed(result),
            Err(err) => {
                tracing::warn!("tool `{}` failed: {}", invocation.name, err);
                Dispatch::Completed(ToolResult::failure(err.to_string()))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSchemaValidationError {
    pub tool_name: String,
    pub path: String,
    pub reason: String,
}

impl std::fmt::Display for ToolSchemaValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid tool schema `{}` at `{}`: {}",
            self.tool_name, self.path, self.reason
        )
    }
}

impl std::error::Error for ToolSchemaValidationError {}

/// Rejects schemas the function-declaration API refuses: arrays without `items`
/// and `required` names that are not declared properties.
pub fn validate_tool_schemas(schemas: &[ToolSchema]) -> Result<(), ToolSchemaValidationError> {
    for schema in schemas {
        validate_schema_node(&schema.name, "$", &schema.input_schema)?;
    }
    Ok(())
}

fn validate_schema_node(
    tool_name: &str,
    path: &str,
    value: &Value,
) -> Result<(), ToolSchemaValidationError> {
    let Some(obj) = value.as_object() else {
        if let Some(arr) = value.as_array() {
            for (idx, item) in arr.iter().enumerate() {
                validate_schema_node(tool_name, &format!("{path}[{idx}]"), item)?;
            }
        }
        return Ok(());
    };

    if obj.get("type").and_then(|t| t.as_str()) == Some("array") && !obj.contains_key("items") {
        return Err(ToolSchemaValidationError {
            tool_name: tool_name.to_string(),
            path: path.to_string(),
            reason: "array schema missing items".to_string(),
        });
    }

    let props = obj.get("properties").and_then(|v| v.as_object());
    if let Some(required) = obj.get("required").and_then(|v| v.as_array()) {
        for name in required.iter().filter_map(|v| v.as_str()) {
            if !props.map(|p| p.contains_key(name)).unwrap_or(false) {
                return Err(ToolSchemaValidationError {
                    tool_name: tool_name.to_string(),
                    path: format!("{path}.required"),
                    reason: format!("required property `{name}` is not declared"),
                });
            }
        }
    }

    if let Some(items) = obj.get("items") {
        validate_schema_node(tool_name, &format!("{path}.items"), items)?;
    }
    if let Some(props) = props {
        for (key, child) in props {
            validate_schema_node(tool_name, &format!("{path}.properties.{key}"), child)?;
        }
    }
    if let Some(any_of) = obj.get("anyOf").and_then(|v| v.as_array()) {
        for (idx, child) in any_of.iter().enumerate() {
            validate_schema_node(tool_name, &format!("{path}.anyOf[{idx}]"), child)?;
        }
    }

    Ok(())
}

/// Parses an absolute http(s) URL.
pub fn require_http_url(raw: &str) -> anyhow::Result<reqwest::Url> {
    let url = reqwest::Url::parse(raw.trim())
        .map_err(|e| anyhow::anyhow!("invalid url `{}`: {}", raw.trim(), e))?;
    if !matches!(url.scheme(), "http" | "https") {
        anyhow::bail!("unsupported url scheme `{}`", url.scheme());
    }
    Ok(url)
}

pub(crate) fn truncate_chars(input: &str, max_chars: usize) -> (String, bool) {
    if input.chars().count() <= max_chars {
        return (input.to_string(), false);
    }
    (input.chars().take(max_chars).collect(), true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingTool {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl Tool for CountingTool {
        fn schema(&self) -> ToolSchema {
            ToolSchema {
                name: "lookup".to_string(),
                description: "test lookup".to_string(),
                input_schema: json!({
                    "type": "object",
                    "properties": {"key": {"type": "string"}},
                    "required": ["key"]
                }),
            }
        }

        async fn execute(&self, args: Map<String, Value>) -> anyhow::Result<ToolResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("backend unavailable");
            }
            Ok(ToolResult::success(json!({"echo": args.get("key")})))
        }
    }

    fn invocation(name: &str, args: Value) -> ToolInvocation {
        ToolInvocation::new(name, args.as_object().cloned().unwrap_or_default())
    }

    #[test]
    fn validator_rejects_array_without_items() {
        let schemas = vec![ToolSchema {
            name: "bad".to_string(),
            description: "bad schema".to_string(),
            input_schema: json!({
                "type":"object",
                "properties":{"urls":{"type":"array"}}
            }),
        }];
        let err = validate_tool_schemas(&schemas).expect_err("expected schema validation failure");
        assert_eq!(err.tool_name, "bad");
        assert!(err.path.contains("properties.urls"));
    }

    #[test]
    fn validator_rejects_undeclared_required_property() {
        let schemas = vec![ToolSchema {
            name: "bad".to_string(),
            description: "bad schema".to_string(),
            input_schema: json!({"type":"object","properties":{},"required":["query"]}),
        }];
        let err = validate_tool_schemas(&schemas).expect_err("expected failure");
        assert!(err.reason.contains("`query`"));
    }

    #[tokio::test]
    async fn registry_schemas_are_unique_and_valid() {
        let registry = ToolRegistry::new(&ToolsConfig::default());
        let schemas = registry.list().await;
        validate_tool_schemas(&schemas).expect("registry tool schemas should validate");
        let unique = schemas
            .iter()
            .map(|schema| schema.name.as_str())
            .collect::<HashSet<_>>();
        assert_eq!(unique.len(), schemas.len(), "tool schemas must be unique by name");
        assert_eq!(
            schemas.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
            vec!["fetch_webpage", "web_search", "youtube_transcript"]
        );
    }

    #[tokio::test]
    async fn unknown_tool_is_an_explicit_lookup_miss() {
        let registry = ToolRegistry::empty();
        let outcome = registry
            .dispatch(&invocation("unknown_tool", json!({})), CancellationToken::new())
            .await;
        assert_eq!(outcome, Dispatch::UnknownTool);
    }

    #[tokio::test]
    async fn missing_required_argument_fails_without_running_executor() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = ToolRegistry::empty();
        registry
            .register(Arc::new(CountingTool {
                calls: calls.clone(),
                fail: false,
            }))
            .await;
        let outcome = registry
            .dispatch(&invocation("lookup", json!({})), CancellationToken::new())
            .await;
        assert_eq!(
            outcome,
            Dispatch::Completed(ToolResult::failure("missing required argument(s): key"))
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn executor_error_becomes_failure_payload() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = ToolRegistry::empty();
        registry
            .register(Arc::new(CountingTool {
                calls: calls.clone(),
                fail: true,
            }))
            .await;
        let outcome = registry
            .dispatch(&invocation("lookup", json!({"key": "k"})), CancellationToken::new())
            .await;
        assert_eq!(
            outcome,
            Dispatch::Completed(ToolResult::failure("backend unavailable"))
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_dispatch_reports_failure() {
        let registry = ToolRegistry::empty();
        registry
            .register(Arc::new(CountingTool {
                calls: Arc::new(AtomicUsize::new(0)),
                fail: false,
            }))
            .await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = registry
            .dispatch(&invocation("lookup", json!({"key": "k"})), cancel)
            .await;
        let Dispatch::Completed(result) = outcome else {
            panic!("expected completed dispatch");
        };
        assert!(result.is_failure());
    }

    #[test]
    fn rejects_non_http_urls() {
        assert!(require_http_url("file:///etc/passwd").is_err());
        assert!(require_http_url("not a url").is_err());
        assert!(require_http_url(" https://example.com/a ").is_ok());
    }
}
