use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ToolInvocation, ToolResult};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
    Tool,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Model => "model",
            Role::Tool => "tool",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Blob {
    #[serde(rename = "mimeType", alias = "mime_type")]
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionResponse {
    pub name: String,
    pub response: Value,
}

/// One content fragment of a turn. Serialized in the externally tagged
/// `{"text": ..}` / `{"inlineData": ..}` shape the generative API expects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Part {
    Text(String),
    InlineData(Blob),
    FunctionCall(ToolInvocation),
    FunctionResponse(FunctionResponse),
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text(text.into())
    }

    pub fn inline(mime_type: impl Into<String>, data: impl Into<String>) -> Self {
        Part::InlineData(Blob {
            mime_type: mime_type.into(),
            data: data.into(),
        })
    }

    /// Text or binary payload with something in it.
    pub fn is_usable(&self) -> bool {
        match self {
            Part::Text(text) => !text.trim().is_empty(),
            Part::InlineData(blob) => !blob.data.trim().is_empty(),
            Part::FunctionCall(_) | Part::FunctionResponse(_) => false,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Part::Text(text) => Some(text.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub parts: Vec<Part>,
}

impl Turn {
    pub fn new(role: Role, parts: Vec<Part>) -> Self {
        Self { role, parts }
    }

    pub fn user_text(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![Part::text(text)])
    }

    pub fn model_text(text: impl Into<String>) -> Self {
        Self::new(Role::Model, vec![Part::text(text)])
    }

    pub fn model_call(invocation: ToolInvocation) -> Self {
        Self::new(Role::Model, vec![Part::FunctionCall(invocation)])
    }

    pub fn tool_result(name: impl Into<String>, result: &ToolResult) -> Self {
        Self::new(
            Role::Tool,
            vec![Part::FunctionResponse(FunctionResponse {
                name: name.into(),
                response: result.to_response_value(),
            })],
        )
    }

    /// A turn the normalizer keeps: non-empty parts whose first element carries content.
    pub fn has_usable_content(&self) -> bool {
        self.parts.first().map(Part::is_usable).unwrap_or(false)
    }

    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(Part::as_text)
            .collect::<Vec<_>>()
            .join("")
    }
}

/// Ordered turns submitted to the model, owned by a single request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Conversation {
    turns: Vec<Turn>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_turns(turns: Vec<Turn>) -> Self {
        Self { turns }
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn into_turns(self) -> Vec<Turn> {
        self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    pub fn push(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    /// Appends the new user turn; a trailing user turn is superseded by it.
    pub fn push_user(&mut self, turn: Turn) {
        if self.turns.last().map(|t| t.role) == Some(Role::User) {
            self.turns.pop();
        }
        self.turns.push(turn);
    }

    pub fn roles(&self) -> Vec<Role> {
        self.turns.iter().map(|t| t.role).collect()
    }
}
