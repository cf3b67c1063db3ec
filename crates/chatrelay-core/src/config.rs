use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::fs;
use tokio::sync::RwLock;

use chatrelay_observability::redact_text;
use chatrelay_providers::is_placeholder_api_key;
use chatrelay_tools::{ImageConfig, SearchConfig, ToolsConfig};

pub const DEFAULT_MAX_TOOL_ITERATIONS: usize = 5;
pub const MAX_TOOL_ITERATIONS_CAP: usize = 10;
pub const DEFAULT_MAX_HISTORY_TURNS: usize = 20;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub url: Option<String>,
    pub default_model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChatSettings {
    pub system_prompt: Option<String>,
    pub max_tool_iterations: Option<usize>,
    pub max_history_turns: Option<usize>,
    pub request_timeout_secs: Option<u64>,
}

impl ChatSettings {
    /// Model round-trips allowed per request, clamped to `1..=10`.
    pub fn max_tool_iterations(&self) -> usize {
        self.max_tool_iterations
            .unwrap_or(DEFAULT_MAX_TOOL_ITERATIONS)
            .clamp(1, MAX_TOOL_ITERATIONS_CAP)
    }

    /// `0` keeps the whole history.
    pub fn max_history_turns(&self) -> usize {
        self.max_history_turns.unwrap_or(DEFAULT_MAX_HISTORY_TURNS)
    }

    pub fn request_timeout_secs(&self) -> u64 {
        self.request_timeout_secs
            .filter(|s| *s > 0)
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS)
    }

    pub fn system_prompt(&self) -> Option<&str> {
        self.system_prompt
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RelayConfig {
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    pub default_provider: Option<String>,
    #[serde(default)]
    pub chat: ChatSettings,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub image: ImageConfig,
}

#[derive(Debug, Clone, Default)]
struct ConfigLayers {
    file: Value,
    env: Value,
    cli: Value,
}

/// Layered JSON configuration: file, then environment, then CLI overrides.
/// Later layers win; `null` values never override.
#[derive(Clone)]
pub struct ConfigStore {
    path: Option<PathBuf>,
    layers: Arc<RwLock<ConfigLayers>>,
}

impl ConfigStore {
    pub async fn new(path: Option<&Path>, cli_overrides: Option<Value>) -> anyhow::Result<Self> {
        let file = match path {
            Some(path) => read_json_file(path).await?,
            None => empty_object(),
        };
        Ok(Self::from_layers(
            path.map(Path::to_path_buf),
            file,
            env_layer(),
            cli_overrides.unwrap_or_else(empty_object),
        ))
    }

    pub fn from_layers(path: Option<PathBuf>, file: Value, env: Value, cli: Value) -> Self {
        Self {
            path,
            layers: Arc::new(RwLock::new(ConfigLayers { file, env, cli })),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub async fn get(&self) -> RelayConfig {
        let merged = self.get_effective_value().await;
        match serde_json::from_value(merged) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!("effective config does not match the expected shape: {}", err);
                RelayConfig::default()
            }
        }
    }

    pub async fn get_effective_value(&self) -> Value {
        let layers = self.layers.read().await;
        let mut merged = empty_object();
        deep_merge(&mut merged, &layers.file);
        deep_merge(&mut merged, &layers.env);
        deep_merge(&mut merged, &layers.cli);
        merged
    }

    /// Effective config with every `api_key` replaced by its redacted form.
    pub async fn get_redacted_value(&self) -> Value {
        let mut value = self.get_effective_value().await;
        redact_secrets(&mut value);
        value
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

async fn read_json_file(path: &Path) -> anyhow::Result<Value> {
    if !path.exists() {
        tracing::debug!("config file {} not found; using defaults", path.display());
        return Ok(empty_object());
    }
    let raw = fs::read_to_string(path).await?;
    if raw.trim().is_empty() {
        return Ok(empty_object());
    }
    serde_json::from_str::<Value>(&raw)
        .map_err(|e| anyhow::anyhow!("invalid JSON in config file {}: {}", path.display(), e))
}

fn env_layer() -> Value {
    env_layer_from(|name| std::env::var(name).ok())
}

fn env_layer_from(lookup: impl Fn(&str) -> Option<String>) -> Value {
    let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
    let mut root = empty_object();

    let gemini_key = ["GEMINI_API_KEY", "GOOGLE_API_KEY"]
        .iter()
        .find_map(|name| var(name).filter(|key| !is_placeholder_api_key(key)));
    if let Some(api_key) = gemini_key {
        deep_merge(
            &mut root,
            &json!({ "providers": { "gemini": { "api_key": api_key } } }),
        );
    }
    if let Some(model) = var("GEMINI_MODEL") {
        deep_merge(
            &mut root,
            &json!({ "providers": { "gemini": { "default_model": model.trim() } } }),
        );
    }
    if let Some(key) = var("SERPER_API_KEY").filter(|k| !is_placeholder_api_key(k)) {
        deep_merge(&mut root, &json!({ "search": { "api_key": key } }));
    }
    if let Some(key) = var("STABILITY_API_KEY").filter(|k| !is_placeholder_api_key(k)) {
        deep_merge(&mut root, &json!({ "image": { "api_key": key } }));
    }
    if let Some(prompt) = var("CHATRELAY_SYSTEM_PROMPT") {
        deep_merge(&mut root, &json!({ "chat": { "system_prompt": prompt } }));
    }
    for (name, key) in [
        ("CHATRELAY_MAX_TOOL_ITERATIONS", "max_tool_iterations"),
        ("CHATRELAY_MAX_HISTORY_TURNS", "max_history_turns"),
        ("CHATRELAY_REQUEST_TIMEOUT_SECS", "request_timeout_secs"),
    ] {
        let Some(raw) = var(name) else { continue };
        match raw.trim().parse::<u64>() {
            Ok(n) => deep_merge(&mut root, &json!({ "chat": { key: n } })),
            Err(_) => tracing::warn!("ignoring {}={:?}: not a non-negative integer", name, raw),
        }
    }

    root
}

fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}

fn redact_secrets(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, child) in map.iter_mut() {
                match child {
                    Value::String(secret) if key == "api_key" => {
                        let redacted = redact_text(secret);
                        *child = Value::String(redacted);
                    }
                    _ => redact_secrets(child),
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(redact_secrets),
        _ => {}
    }
}

fn usable_key(key: &Option<String>) -> Option<String> {
    key.as_deref()
        .filter(|k| !is_placeholder_api_key(k))
        .map(|k| k.trim().to_string())
}

impl From<ProviderConfig> for chatrelay_providers::ProviderConfig {
    fn from(value: ProviderConfig) -> Self {
        Self {
            api_key: usable_key(&value.api_key),
            url: value.url,
            default_model: value.default_model,
        }
    }
}

impl From<&RelayConfig> for chatrelay_providers::AppConfig {
    fn from(value: &RelayConfig) -> Self {
        Self {
            providers: value
                .providers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone().into()))
                .collect(),
            default_provider: value.default_provider.clone(),
            request_timeout_secs: Some(value.chat.request_timeout_secs()),
        }
    }
}

impl From<&RelayConfig> for ToolsConfig {
    fn from(value: &RelayConfig) -> Self {
        Self {
            search: SearchConfig {
                api_key: usable_key(&value.search.api_key),
                ..value.search.clone()
            },
            image: ImageConfig {
                api_key: usable_key(&value.image.api_key),
                ..value.image.clone()
            },
            request_timeout_secs: Some(value.chat.request_timeout_secs()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env_from(pairs: &[(&str, &str)]) -> Value {
        let map = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        env_layer_from(|name| map.get(name).cloned())
    }

    #[test]
    fn deep_merge_skips_nulls_and_merges_objects() {
        let mut base = json!({"chat": {"system_prompt": "a", "max_tool_iterations": 3}});
        deep_merge(
            &mut base,
            &json!({"chat": {"system_prompt": null, "max_tool_iterations": 7}, "default_provider": "gemini"}),
        );
        assert_eq!(
            base,
            json!({"chat": {"system_prompt": "a", "max_tool_iterations": 7}, "default_provider": "gemini"})
        );
    }

    #[test]
    fn env_layer_maps_known_variables() {
        let env = env_from(&[
            ("GOOGLE_API_KEY", "g-key"),
            ("GEMINI_MODEL", "gemini-1.5-pro"),
            ("SERPER_API_KEY", "s-key"),
            ("STABILITY_API_KEY", "placeholder"),
            ("CHATRELAY_MAX_TOOL_ITERATIONS", "3"),
            ("CHATRELAY_MAX_HISTORY_TURNS", "many"),
        ]);
        assert_eq!(env["providers"]["gemini"]["api_key"], "g-key");
        assert_eq!(env["providers"]["gemini"]["default_model"], "gemini-1.5-pro");
        assert_eq!(env["search"]["api_key"], "s-key");
        assert!(env.get("image").is_none());
        assert_eq!(env["chat"]["max_tool_iterations"], 3);
        assert!(env["chat"].get("max_history_turns").is_none());
    }

    #[test]
    fn gemini_key_prefers_gemini_variable() {
        let env = env_from(&[("GEMINI_API_KEY", "first"), ("GOOGLE_API_KEY", "second")]);
        assert_eq!(env["providers"]["gemini"]["api_key"], "first");
    }

    #[tokio::test]
    async fn later_layers_win() {
        let store = ConfigStore::from_layers(
            None,
            json!({"default_provider": "local", "chat": {"max_history_turns": 4}}),
            json!({"chat": {"max_history_turns": 8}}),
            json!({"default_provider": "gemini"}),
        );
        let config = store.get().await;
        assert_eq!(config.default_provider.as_deref(), Some("gemini"));
        assert_eq!(config.chat.max_history_turns(), 8);
    }

    #[test]
    fn chat_settings_defaults_and_clamp() {
        let settings = ChatSettings::default();
        assert_eq!(settings.max_tool_iterations(), 5);
        assert_eq!(settings.max_history_turns(), 20);
        assert_eq!(settings.request_timeout_secs(), 60);
        assert!(settings.system_prompt().is_none());

        let settings = ChatSettings {
            max_tool_iterations: Some(50),
            ..ChatSettings::default()
        };
        assert_eq!(settings.max_tool_iterations(), 10);
        let settings = ChatSettings {
            max_tool_iterations: Some(0),
            ..ChatSettings::default()
        };
        assert_eq!(settings.max_tool_iterations(), 1);
    }

    #[tokio::test]
    async fn redacted_value_hides_api_keys() {
        let store = ConfigStore::from_layers(
            None,
            json!({"providers": {"gemini": {"api_key": "AIza-secret", "default_model": "m"}}, "search": {"api_key": "serp"}}),
            empty_object(),
            empty_object(),
        );
        let value = store.get_redacted_value().await;
        let rendered = value.to_string();
        assert!(!rendered.contains("AIza-secret"));
        assert!(!rendered.contains("\"serp\""));
        assert_eq!(value["providers"]["gemini"]["default_model"], "m");
        assert!(value["search"]["api_key"]
            .as_str()
            .unwrap_or("")
            .starts_with("[redacted"));
    }

    #[tokio::test]
    async fn missing_file_is_an_empty_layer_and_bad_json_errors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("absent.json");
        let store = ConfigStore::new(Some(&missing), None).await.expect("store");
        assert_eq!(store.path(), Some(missing.as_path()));

        let broken = dir.path().join("broken.json");
        std::fs::write(&broken, "{not json").expect("write");
        let err = ConfigStore::new(Some(&broken), None)
            .await
            .err()
            .expect("invalid json");
        assert!(err.to_string().contains("invalid JSON"));
    }

    #[test]
    fn conversions_drop_placeholder_keys() {
        let mut config = RelayConfig::default();
        config.providers.insert(
            "gemini".to_string(),
            ProviderConfig {
                api_key: Some("x".to_string()),
                ..ProviderConfig::default()
            },
        );
        config.search.api_key = Some(" s-key ".to_string());
        config.chat.request_timeout_secs = Some(15);

        let providers = chatrelay_providers::AppConfig::from(&config);
        assert!(providers.providers["gemini"].api_key.is_none());
        assert_eq!(providers.request_timeout_secs, Some(15));

        let tools = ToolsConfig::from(&config);
        assert_eq!(tools.search.api_key.as_deref(), Some("s-key"));
        assert_eq!(tools.request_timeout_secs, Some(15));
    }
}
