use std::borrow::Cow;
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use chatrelay_types::{ToolResult, ToolSchema};

use crate::{require_http_url, truncate_chars, Tool};

const DEFAULT_MAX_CHARS: usize = 20_000;
const STRIPPED_TAGS: [&str; 6] = ["script", "style", "nav", "footer", "header", "aside"];

fn stripped_blocks() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        let alternation = STRIPPED_TAGS
            .iter()
            .map(|tag| format!(r"<{tag}\b[^>]*>.*?</{tag}\s*>"))
            .collect::<Vec<_>>()
            .join("|");
        Regex::new(&format!("(?is){alternation}|<!--.*?-->")).ok()
    })
    .as_ref()
}

fn blank_runs() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\n[ \t]*\n(?:[ \t]*\n)+").ok())
        .as_ref()
}

/// Drops page chrome (scripts, navigation, headers, footers, asides) and
/// converts the remaining markup to markdown-flavoured text.
pub fn html_to_text(html: &str) -> String {
    let cleaned = match stripped_blocks() {
        Some(re) => re.replace_all(html, ""),
        None => Cow::Borrowed(html),
    };
    let markdown = html2md::parse_html(&cleaned);
    let trimmed = markdown.trim();
    match blank_runs() {
        Some(re) => re.replace_all(trimmed, "\n\n").to_string(),
        None => trimmed.to_string(),
    }
}

#[derive(Clone)]
pub struct PageFetcher {
    client: Client,
    max_chars: usize,
}

impl PageFetcher {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            max_chars: DEFAULT_MAX_CHARS,
        }
    }

    pub fn with_max_chars(mut self, max_chars: usize) -> Self {
        self.max_chars = max_chars.max(1);
        self
    }

    /// Returns readable page text and whether it was truncated.
    pub async fn fetch_text(&self, raw_url: &str, cancel: CancellationToken) -> anyhow::Result<(String, bool)> {
        let url = require_http_url(raw_url)?;
        let response = tokio::select! {
            _ = cancel.cancelled() => anyhow::bail!("fetch cancelled"),
            response = self.client.get(url.clone()).send() => response?,
        };
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("fetching {} failed with status {}", url, status);
        }
        let is_html = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.contains("html"))
            .unwrap_or(true);
        let body = response.text().await?;
        let text = if is_html { html_to_text(&body) } else { body };
        if text.trim().is_empty() {
            anyhow::bail!("no readable content found at {}", url);
        }
        Ok(truncate_chars(&text, self.max_chars))
    }
}

pub struct FetchWebpageTool {
    fetcher: PageFetcher,
}

impl FetchWebpageTool {
    pub fn new(fetcher: PageFetcher) -> Self {
        Self { fetcher }
    }
}

#[async_trait]
impl Tool for FetchWebpageTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "fetch_webpage".to_string(),
            description: "Fetch a web page and return its readable text content.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "url": { "type": "string", "description": "Absolute http(s) URL" }
                },
                "required": ["url"]
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
        let url = args.get("url").and_then(|v| v.as_str()).unwrap_or("");
        let (content, truncated) = self.fetcher.fetch_text(url, cancel).await?;
        Ok(ToolResult::success(json!({
            "url": url,
            "content": content,
            "truncated": truncated,
        })))
    }
}
