use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use chatrelay_types::{ToolResult, ToolSchema};

use crate::{require_http_url, Tool};

const YOUTUBE_BASE_URL: &str = "https://www.youtube.com";

fn video_id_pattern() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:[?&]v=|/embed/|/shorts/|/live/|youtu\.be/)([A-Za-z0-9_-]{11})").ok()
    })
    .as_ref()
}

fn caption_url_pattern() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#""baseUrl"\s*:\s*"([^"]+)""#).ok())
        .as_ref()
}

fn text_node_pattern() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<text\b[^>]*>(.*?)</text>").ok())
        .as_ref()
}

fn numeric_entity_pattern() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"&#(x[0-9a-fA-F]+|\d+);").ok())
        .as_ref()
}

/// Extracts the 11-character video id from a watch, short, embed or youtu.be URL,
/// or accepts a bare id.
pub fn youtube_video_id(input: &str) -> Option<String> {
    let input = input.trim();
    if input.len() == 11
        && input
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Some(input.to_string());
    }
    video_id_pattern()?
        .captures(input)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

fn decode_entities(input: &str) -> String {
    let named = input
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&nbsp;", " ");
    let numeric = match numeric_entity_pattern() {
        Some(re) => re
            .replace_all(&named, |caps: &regex::Captures<'_>| {
                let raw = &caps[1];
                let code = match raw.strip_prefix('x') {
                    Some(hex) => u32::from_str_radix(hex, 16).ok(),
                    None => raw.parse::<u32>().ok(),
                };
                code.and_then(char::from_u32)
                    .map(String::from)
                    .unwrap_or_default()
            })
            .to_string(),
        None => named,
    };
    numeric.replace("&amp;", "&")
}

/// Joins the `<text>` nodes of a timedtext document with single spaces.
pub(crate) fn transcript_from_timedtext(xml: &str) -> String {
    let Some(re) = text_node_pattern() else {
        return String::new();
    };
    re.captures_iter(xml)
        .filter_map(|caps| caps.get(1))
        .map(|m| decode_entities(&decode_entities(m.as_str())))
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Clone)]
pub struct TranscriptFetcher {
    client: Client,
    base_url: String,
}

impl TranscriptFetcher {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            base_url: YOUTUBE_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub async fn fetch(&self, url: &str, cancel: CancellationToken) -> anyhow::Result<String> {
        let Some(video_id) = youtube_video_id(url) else {
            anyhow::bail!("could not find a YouTube video id in `{}`", url.trim());
        };

        let watch_url = format!("{}/watch?v={}", self.base_url, video_id);
        let page = self.get_text(&watch_url, &cancel).await?;
        let Some(tracks_at) = page.find("\"captionTracks\"") else {
            anyhow::bail!("no transcript is available for video {}", video_id);
        };
        let caption_url = caption_url_pattern()
            .and_then(|re| re.captures(&page[tracks_at..]))
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().replace("\\u0026", "&").replace("\\/", "/"))
            .ok_or_else(|| anyhow::anyhow!("no caption track url for video {}", video_id))?;
        require_http_url(&caption_url)?;

        let xml = self.get_text(&caption_url, &cancel).await?;
        let transcript = transcript_from_timedtext(&xml);
        if transcript.is_empty() {
            anyhow::bail!("transcript for video {} is empty", video_id);
        }
        Ok(transcript)
    }

    async fn get_text(&self, url: &str, cancel: &CancellationToken) -> anyhow::Result<String> {
        let response = tokio::select! {
            _ = cancel.cancelled() => anyhow::bail!("transcript fetch cancelled"),
            response = self.client.get(url).header("Accept-Language", "en-US,en;q=0.9").send() => response?,
        };
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("transcript request failed with status {}", status);
        }
        Ok(response.text().await?)
    }
}

pub struct YoutubeTranscriptTool {
    fetcher: TranscriptFetcher,
}

impl YoutubeTranscriptTool {
    pub fn new(fetcher: TranscriptFetcher) -> Self {
        Self { fetcher }
    }
}

#[async_trait]
impl Tool for YoutubeTranscriptTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "youtube_transcript".to_string(),
            description: "Fetch the caption transcript of a YouTube video.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "url": { "type": "string", "description": "YouTube video URL or id" }
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
        let transcript = self.fetcher.fetch(url, cancel).await?;
        Ok(ToolResult::success(json!({ "transcript": transcript })))
    }
}
