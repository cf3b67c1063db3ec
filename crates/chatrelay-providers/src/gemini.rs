use async_stream::try_stream;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use chatrelay_types::{ModelInfo, Part, ProviderInfo, Role, ToolInvocation, Turn};

use crate::{
    normalize_plain_base, truncate_for_error, ChunkStream, GenerateRequest, ModelResponse,
    Provider, StreamChunk, TokenUsage,
};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_MODEL: &str = "gemini-1.5-flash";

pub struct GeminiProvider {
    base_url: String,
    api_key: Option<String>,
    default_model: String,
    client: Client,
}

impl GeminiProvider {
    pub fn new(
        api_key: Option<String>,
        url: Option<&str>,
        default_model: Option<&str>,
        client: Client,
    ) -> Self {
        Self {
            base_url: normalize_plain_base(url.unwrap_or(DEFAULT_BASE_URL)),
            api_key,
            default_model: default_model
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .unwrap_or(DEFAULT_MODEL)
                .to_string(),
            client,
        }
    }

    fn model<'a>(&'a self, model_override: Option<&'a str>) -> &'a str {
        model_override
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(self.default_model.as_str())
    }

    fn api_key(&self) -> anyhow::Result<&str> {
        self.api_key.as_deref().ok_or_else(|| {
            anyhow::anyhow!(
                "gemini API key is not configured. Set `GEMINI_API_KEY` or providers.gemini.api_key."
            )
        })
    }
}

#[async_trait]
impl Provider for GeminiProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: "gemini".to_string(),
            name: "Google Gemini".to_string(),
            models: vec![ModelInfo {
                id: self.default_model.clone(),
                provider_id: "gemini".to_string(),
                display_name: self.default_model.clone(),
                context_window: 1_048_576,
            }],
        }
    }

    async fn generate(
        &self,
        request: GenerateRequest,
        model_override: Option<&str>,
        cancel: CancellationToken,
    ) -> anyhow::Result<ModelResponse> {
        let model = self.model(model_override);
        let url = format!("{}/models/{}:generateContent", self.base_url, model);
        let req = self
            .client
            .post(url)
            .header("x-goog-api-key", self.api_key()?)
            .json(&build_request_body(&request));

        let response = tokio::select! {
            _ = cancel.cancelled() => anyhow::bail!("model request cancelled"),
            response = req.send() => response?,
        };
        let status = response.status();
        let raw = response.text().await?;
        let value = serde_json::from_str::<Value>(&raw).unwrap_or(Value::Null);

        if !status.is_success() {
            let detail = extract_gemini_error(&value).unwrap_or_else(|| {
                format!(
                    "provider request failed with status {}: {}",
                    status,
                    truncate_for_error(&raw, 500)
                )
            });
            anyhow::bail!(detail);
        }

        parse_model_response(&value)
    }

    async fn stream(
        &self,
        request: GenerateRequest,
        model_override: Option<&str>,
        cancel: CancellationToken,
    ) -> anyhow::Result<ChunkStream> {
        let model = self.model(model_override);
        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse",
            self.base_url, model
        );
        let req = self
            .client
            .post(url)
            .header("x-goog-api-key", self.api_key()?)
            .json(&build_request_body(&request));

        let resp = tokio::select! {
            _ = cancel.cancelled() => anyhow::bail!("model request cancelled"),
            resp = req.send() => resp?,
        };
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let detail = serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|v| extract_gemini_error(&v))
                .unwrap_or_else(|| truncate_for_error(&text, 500));
            anyhow::bail!(
                "provider stream request failed with status {}: {}",
                status,
                detail
            );
        }

        let mut bytes = resp.bytes_stream();
        let stream = try_stream! {
            let mut buffer: Vec<u8> = Vec::new();
            let mut finish_reason: Option<String> = None;
            let mut usage: Option<TokenUsage> = None;
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => {
                        finish_reason = Some("cancelled".to_string());
                        break;
                    }
                    next = bytes.next() => next,
                };
                let Some(chunk) = next else {
                    break;
                };
                buffer.extend_from_slice(&chunk?);

                while let Some(frame) = take_sse_frame(&mut buffer) {
                    for payload in sse_payloads(&frame) {
                        let Ok(value) = serde_json::from_str::<Value>(&payload) else {
                            continue;
                        };
                        if let Some(detail) = extract_gemini_error(&value) {
                            Err(anyhow::anyhow!(detail))?;
                        }
                        let parsed = parse_model_response(&value)?;
                        if parsed.finish_reason.is_some() {
                            finish_reason = parsed.finish_reason.clone();
                        }
                        if parsed.usage.is_some() {
                            usage = parsed.usage.clone();
                        }
                        for part in parsed.parts {
                            match part {
                                Part::Text(text) if !text.is_empty() => {
                                    yield StreamChunk::TextDelta(text);
                                }
                                Part::FunctionCall(call) => {
                                    yield StreamChunk::ToolCall(call);
                                }
                                _ => {}
                            }
                        }
                    }
                }
            }
            yield StreamChunk::Done {
                finish_reason: finish_reason.unwrap_or_else(|| "STOP".to_string()),
                usage,
            };
        };
        Ok(Box::pin(stream))
    }
}

fn wire_role(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Model => "model",
        Role::Tool => "function",
    }
}

fn wire_turn(turn: &Turn) -> Value {
    json!({
        "role": wire_role(turn.role),
        "parts": turn.parts,
    })
}

pub(crate) fn build_request_body(request: &GenerateRequest) -> Value {
    let mut body = json!({
        "contents": request.contents.iter().map(wire_turn).collect::<Vec<_>>(),
    });
    if let Some(system) = request
        .system_instruction
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        body["systemInstruction"] = json!({ "parts": [{ "text": system }] });
    }
    if !request.tools.is_empty() {
        let declarations = request
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.input_schema,
                })
            })
            .collect::<Vec<_>>();
        body["tools"] = json!([{ "functionDeclarations": declarations }]);
    }
    body
}

/// Reads the first candidate without trusting any field to be present.
pub(crate) fn parse_model_response(value: &Value) -> anyhow::Result<ModelResponse> {
    if let Some(detail) = extract_gemini_error(value) {
        anyhow::bail!(detail);
    }

    let candidate = value.get("candidates").and_then(|c| c.get(0));
    let parts = candidate
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(|p| p.as_array())
        .map(|items| items.iter().filter_map(parse_part).collect())
        .unwrap_or_default();
    let finish_reason = candidate
        .and_then(|c| c.get("finishReason"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .or_else(|| {
            value
                .get("promptFeedback")
                .and_then(|f| f.get("blockReason"))
                .and_then(|v| v.as_str())
                .map(str::to_string)
        });

    Ok(ModelResponse {
        parts,
        finish_reason,
        usage: extract_usage(value),
    })
}

fn parse_part(value: &Value) -> Option<Part> {
    if value.get("thought").and_then(|v| v.as_bool()) == Some(true) {
        return None;
    }
    if let Some(text) = value.get("text").and_then(|v| v.as_str()) {
        return Some(Part::text(text));
    }
    if let Some(call) = value.get("functionCall") {
        let name = call.get("name").and_then(|v| v.as_str())?;
        let args = call
            .get("args")
            .and_then(|v| v.as_object())
            .cloned()
            .unwrap_or_default();
        return Some(Part::FunctionCall(ToolInvocation::new(name, args)));
    }
    if let Some(inline) = value.get("inlineData") {
        let mime_type = inline.get("mimeType").and_then(|v| v.as_str())?;
        let data = inline.get("data").and_then(|v| v.as_str())?;
        return Some(Part::inline(mime_type, data));
    }
    None
}

fn extract_usage(value: &Value) -> Option<TokenUsage> {
    let usage = value.get("usageMetadata")?;
    let prompt_tokens = usage
        .get("promptTokenCount")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let completion_tokens = usage
        .get("candidatesTokenCount")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let total_tokens = usage
        .get("totalTokenCount")
        .and_then(|v| v.as_u64())
        .unwrap_or(prompt_tokens.saturating_add(completion_tokens));
    Some(TokenUsage {
        prompt_tokens,
        completion_tokens,
        total_tokens,
    })
}

fn extract_gemini_error(value: &Value) -> Option<String> {
    let error = value.get("error")?;
    error
        .get("message")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .or_else(|| error.as_str().map(str::to_string))
}

fn take_sse_frame(buffer: &mut Vec<u8>) -> Option<String> {
    let lf = find_subslice(buffer, b"\n\n").map(|pos| (pos, 2));
    let crlf = find_subslice(buffer, b"\r\n\r\n").map(|pos| (pos, 4));
    let (pos, sep_len) = match (lf, crlf) {
        (Some(a), Some(b)) => {
            if a.0 <= b.0 {
                a
            } else {
                b
            }
        }
        (Some(a), None) => a,
        (None, Some(b)) => b,
        (None, None) => return None,
    };
    let frame = String::from_utf8_lossy(&buffer[..pos]).to_string();
    buffer.drain(..pos + sep_len);
    Some(frame)
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn sse_payloads(frame: &str) -> Vec<String> {
    let data = frame
        .lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter_map(|line| line.strip_prefix("data:"))
        .map(str::trim_start)
        .collect::<Vec<_>>();
    if data.is_empty() {
        return Vec::new();
    }
    vec![data.join("\n")]
}
