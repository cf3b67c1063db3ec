use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use chatrelay_types::{ToolResult, ToolSchema};

use crate::{SearchConfig, Tool};

const DEFAULT_SEARCH_URL: &str = "https://google.serper.dev/search";
const DEFAULT_MAX_RESULTS: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub snippet: String,
    pub link: String,
}

/// Client for a Serper-compatible search endpoint.
#[derive(Clone)]
pub struct SearchClient {
    client: Client,
    url: String,
    api_key: Option<String>,
    max_results: usize,
}

impl SearchClient {
    pub fn new(client: Client, config: &SearchConfig) -> Self {
        Self {
            client,
            url: config
                .url
                .clone()
                .filter(|u| !u.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_SEARCH_URL.to_string()),
            api_key: config
                .api_key
                .clone()
                .filter(|k| !k.trim().is_empty()),
            max_results: config
                .max_results
                .filter(|n| *n > 0)
                .unwrap_or(DEFAULT_MAX_RESULTS),
        }
    }

    pub async fn search(&self, query: &str, cancel: CancellationToken) -> anyhow::Result<Vec<SearchHit>> {
        let query = query.trim();
        if query.is_empty() {
            anyhow::bail!("search query is empty");
        }
        let Some(api_key) = self.api_key.as_deref() else {
            anyhow::bail!("search API key is not configured (set SERPER_API_KEY)");
        };

        let req = self
            .client
            .post(&self.url)
            .header("X-API-KEY", api_key)
            .json(&json!({ "q": query }));
        let response = tokio::select! {
            _ = cancel.cancelled() => anyhow::bail!("search cancelled"),
            response = req.send() => response?,
        };
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("search request failed with status {}: {}", status, text.trim());
        }
        let value: Value = response.json().await?;
        Ok(parse_hits(&value, self.max_results))
    }
}

fn parse_hits(value: &Value, max_results: usize) -> Vec<SearchHit> {
    value
        .get("organic")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let title = item.get("title").and_then(|v| v.as_str())?;
                    Some(SearchHit {
                        title: title.to_string(),
                        snippet: item
                            .get("snippet")
                            .and_then(|v| v.as_str())
                            .unwrap_or("")
                            .to_string(),
                        link: item
                            .get("link")
                            .and_then(|v| v.as_str())
                            .unwrap_or("")
                            .to_string(),
                    })
                })
                .take(max_results)
                .collect()
        })
        .unwrap_or_default()
}

/// Renders hits as numbered source blocks for prompt injection.
pub fn format_hits(hits: &[SearchHit]) -> String {
    hits.iter()
        .enumerate()
        .map(|(idx, hit)| {
            format!(
                "[{}] {}\n{}\n{}",
                idx + 1,
                hit.title,
                hit.snippet,
                hit.link
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub struct WebSearchTool {
    client: SearchClient,
}

impl WebSearchTool {
    pub fn new(client: SearchClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "web_search".to_string(),
            description: "Search the web for current information. Use for recent events, prices, news or facts you are unsure about.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "The search query" }
                },
                "required": ["query"]
            }),
        }
    }

    async fn execute(&self, args: Map<String, Value>) -> anyhow::Result<ToolResult> {
        self.execute_with_cancel(args, CancellationToken::new()).await
    }

    async fn execute_with_cancel(
        &self,
        args: Map<String, Value>,
        cancel: CancellationToken,
    ) -> anyhow::Result<ToolResult> {
        let query = args.get("query").and_then(|v| v.as_str()).unwrap_or("");
        let hits = self.client.search(query, cancel).await?;
        if hits.is_empty() {
            return Ok(ToolResult::success(json!({
                "results": [],
                "note": "no results found"
            })));
        }
        Ok(ToolResult::success(json!({ "results": hits })))
    }
}
