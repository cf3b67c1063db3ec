use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use chatrelay_types::{Blob, FunctionResponse, Part, Role, ToolInvocation, Turn};

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ChatRequest {
    #[serde(default, deserialize_with = "array_or_empty")]
    pub history: Vec<Value>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default, rename = "newMessage")]
    pub new_message: Option<String>,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default, alias = "promptType")]
    pub action: Option<String>,
    #[serde(default, rename = "imageData", alias = "image_data")]
    pub image_data: Option<InlineFile>,
    #[serde(default)]
    pub file: Option<InlineFile>,
}

impl ChatRequest {
    /// First non-blank of `message`, `prompt` and `newMessage`.
    pub fn message_text(&self) -> Option<&str> {
        [&self.message, &self.prompt, &self.new_message]
            .into_iter()
            .filter_map(|field| field.as_deref())
            .map(str::trim)
            .find(|text| !text.is_empty())
    }

    /// `imageData` wins over the older `file` field.
    pub fn attachment(&self) -> Option<&InlineFile> {
        self.image_data.as_ref().or(self.file.as_ref())
    }
}

/// Base64 payload sent by browsers, either raw or as a `data:` URL.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct InlineFile {
    #[serde(
        default,
        rename = "mimeType",
        alias = "type",
        alias = "mime_type"
    )]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub data: String,
}

impl InlineFile {
    /// Splits a `data:<mime>;base64,<payload>` URL, falling back to the declared type.
    pub fn parts(&self) -> (String, &str) {
        let declared = self
            .mime_type
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty());
        if let Some(rest) = self.data.strip_prefix("data:") {
            if let Some((meta, payload)) = rest.split_once(',') {
                let url_mime = meta.split(';').next().unwrap_or("").trim();
                let mime = declared
                    .or(Some(url_mime).filter(|m| !m.is_empty()))
                    .unwrap_or("application/octet-stream");
                return (mime.to_string(), payload.trim());
            }
        }
        (
            declared.unwrap_or("application/octet-stream").to_string(),
            self.data.trim(),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatAction {
    Chat,
    WebSearch,
    ImageChat,
}

impl ChatAction {
    pub fn parse(raw: Option<&str>) -> Option<Self> {
        let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
            return Some(Self::Chat);
        };
        match raw.to_ascii_lowercase().replace('-', "_").as_str() {
            "chat" | "text" => Some(Self::Chat),
            "web_search" | "websearch" | "search" => Some(Self::WebSearch),
            "image_chat" | "imagechat" | "image" | "vision" => Some(Self::ImageChat),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub response: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SearchSummarizeRequest {
    #[serde(default)]
    pub query: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ImagePromptRequest {
    #[serde(default)]
    pub prompt: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageResponse {
    #[serde(rename = "imageUrl")]
    pub image_url: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct UrlRequest {
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentResponse {
    pub content: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct DocumentTaskRequest {
    #[serde(default)]
    pub task: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub file: Option<InlineFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentTaskResponse {
    pub result: String,
}

fn array_or_empty<'de, D>(deserializer: D) -> Result<Vec<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Array(items)) => items,
        _ => Vec::new(),
    })
}

pub fn decode_role(raw: &str) -> Option<Role> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "user" => Some(Role::User),
        "model" | "assistant" => Some(Role::Model),
        "tool" | "function" => Some(Role::Tool),
        _ => None,
    }
}

/// Reads one loosely-typed history entry. Returns `None` when the entry has no
/// recognizable role; a turn whose leading part cannot be read comes back with
/// no parts so callers can drop it.
pub fn decode_history_entry(value: &Value) -> Option<Turn> {
    let obj = value.as_object()?;
    let role = obj.get("role").and_then(|v| v.as_str()).and_then(decode_role)?;

    let parts = match obj.get("parts") {
        Some(Value::Array(raw_parts)) => {
            let decoded = raw_parts.iter().map(decode_part).collect::<Vec<_>>();
            if decoded.first().map(Option::is_none).unwrap_or(true) {
                Vec::new()
            } else {
                decoded.into_iter().flatten().collect()
            }
        }
        Some(Value::String(text)) => vec![Part::text(text.clone())],
        Some(_) => Vec::new(),
        None => ["text", "content"]
            .iter()
            .find_map(|key| obj.get(*key).and_then(|v| v.as_str()))
            .map(|text| vec![Part::text(text)])
            .unwrap_or_default(),
    };

    Some(Turn::new(role, parts))
}

fn decode_part(value: &Value) -> Option<Part> {
    if let Some(text) = value.as_str() {
        return Some(Part::text(text));
    }
    let obj = value.as_object()?;
    if let Some(text) = obj.get("text").and_then(|v| v.as_str()) {
        return Some(Part::text(text));
    }
    if let Some(inline) = obj.get("inlineData").or_else(|| obj.get("inline_data")) {
        let mime_type = inline
            .get("mimeType")
            .or_else(|| inline.get("mime_type"))
            .and_then(|v| v.as_str())?;
        let data = inline.get("data").and_then(|v| v.as_str())?;
        return Some(Part::InlineData(Blob {
            mime_type: mime_type.to_string(),
            data: data.to_string(),
        }));
    }
    if let Some(call) = obj.get("functionCall") {
        return serde_json::from_value::<ToolInvocation>(call.clone())
            .ok()
            .map(Part::FunctionCall);
    }
    if let Some(response) = obj.get("functionResponse") {
        return serde_json::from_value::<FunctionResponse>(response.clone())
            .ok()
            .map(Part::FunctionResponse);
    }
    None
}
