use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

impl ToolSchema {
    /// Names listed under the schema's top-level `required` array.
    pub fn required_params(&self) -> Vec<&str> {
        self.input_schema
            .get("required")
            .and_then(|v| v.as_array())
            .map(|items| items.iter().filter_map(|v| v.as_str()).collect())
            .unwrap_or_default()
    }

    /// Required parameters that are absent (or null) in `args`.
    pub fn missing_params(&self, args: &Map<String, Value>) -> Vec<String> {
        self.required_params()
            .into_iter()
            .filter(|name| args.get(*name).map(Value::is_null).unwrap_or(true))
            .map(str::to_string)
            .collect()
    }
}

/// A structured request from the model to run a registered capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub name: String,
    #[serde(default, alias = "arguments", deserialize_with = "args_or_empty")]
    pub args: Map<String, Value>,
}

impl ToolInvocation {
    pub fn new(name: impl Into<String>, args: Map<String, Value>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }

    pub fn str_arg(&self, key: &str) -> Option<&str> {
        self.args
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

fn args_or_empty<'de, D>(deserializer: D) -> Result<Map<String, Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolResult {
    Failure { error: String },
    Success(Map<String, Value>),
}

impl ToolResult {
    pub fn success(fields: Value) -> Self {
        match fields {
            Value::Object(map) => Self::Success(map),
            other => {
                let mut map = Map::new();
                map.insert("result".to_string(), other);
                Self::Success(map)
            }
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self::Failure {
            error: error.into(),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure { .. })
    }

    pub fn to_response_value(&self) -> Value {
        match self {
            Self::Success(map) => Value::Object(map.clone()),
            Self::Failure { error } => json!({ "error": error }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_params_reports_absent_and_null_fields() {
        let schema = ToolSchema {
            name: "web_search".to_string(),
            description: "search".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {"query": {"type": "string"}, "limit": {"type": "integer"}},
                "required": ["query", "limit"]
            }),
        };
        let mut args = Map::new();
        args.insert("limit".to_string(), Value::Null);
        assert_eq!(schema.missing_params(&args), vec!["query", "limit"]);

        args.insert("query".to_string(), json!("gold price"));
        args.insert("limit".to_string(), json!(3));
        assert!(schema.missing_params(&args).is_empty());
    }

    #[test]
    fn invocation_accepts_arguments_alias_and_null_args() {
        let inv: ToolInvocation =
            serde_json::from_value(json!({"name":"web_search","arguments":{"query":"q"}}))
                .expect("invocation");
        assert_eq!(inv.str_arg("query"), Some("q"));

        let inv: ToolInvocation =
            serde_json::from_value(json!({"name":"unknown_tool","args":null})).expect("null");
        assert!(inv.args.is_empty());
    }

    #[test]
    fn failure_result_wraps_single_error_field() {
        let result = ToolResult::failure("search unavailable");
        assert!(result.is_failure());
        assert_eq!(
            result.to_response_value(),
            json!({"error": "search unavailable"})
        );
        assert_eq!(
            ToolResult::success(json!("plain")).to_response_value(),
            json!({"result": "plain"})
        );
    }
}
